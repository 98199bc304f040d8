//! Whole-page rendering in front of the page store.

use std::{path::Path, sync::Arc};

use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::{
    cache::{CacheStore, LoadOutcome, RecomputeGuard},
    domain::{document::Document, tag::{Tag, saturating_after}},
};

use super::{
    context::Context,
    engine::Engine,
    error::AppError,
    request::Request,
    script::Script,
};

const SOURCE: &str = "application::page";

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub document: Arc<Document>,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub from_cache: bool,
    /// Whether the page was eligible for the page store.
    pub cachable: bool,
}

#[derive(Debug, Clone)]
pub struct PageRenderer {
    engine: Arc<Engine>,
}

impl PageRenderer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn render_path(&self, path: &Path, request: Request) -> Result<RenderedPage, AppError> {
        let script = self.engine.load_script(path).await?;
        self.render(script, request).await
    }

    #[instrument(skip_all, fields(script = %script.name(), url = %request.url()))]
    pub async fn render(&self, script: Arc<Script>, request: Request) -> Result<RenderedPage, AppError> {
        let ctx = Context::new(Arc::clone(&self.engine), Arc::clone(&script), request);

        let store = self
            .engine
            .page_cache()
            .filter(|_| script.cachable(self.engine.config(), None));
        let Some(store) = store else {
            return self.assemble(&script, &ctx, None).await;
        };

        let key = script.create_tag_key(&ctx).await?;
        let guard = match claim(store, key.as_str(), &ctx).await {
            Claim::Hit(doc) => {
                debug!(target = SOURCE, key = key.as_str(), "Serving page from cache");
                script.add_headers(&ctx);
                return Ok(RenderedPage {
                    document: doc,
                    status: ctx.response().status(),
                    headers: ctx.response().headers(),
                    cookies: ctx.response().cookies(),
                    from_cache: true,
                    cachable: true,
                });
            }
            Claim::Owned(guard) => Some(guard),
            Claim::Unowned => None,
        };
        self.assemble(&script, &ctx, guard).await
    }

    async fn assemble(
        &self,
        script: &Script,
        ctx: &Arc<Context>,
        guard: Option<RecomputeGuard>,
    ) -> Result<RenderedPage, AppError> {
        let document = Arc::new(script.invoke(ctx).await?);
        let cachable = script.cachable(self.engine.config(), Some(ctx));

        if let (true, Some(guard), Some(cache_time)) =
            (cachable, guard, script.properties().cache_time)
        {
            let now = OffsetDateTime::now_utc();
            let expire = saturating_after(now, cache_time);
            let outcome = guard.save(Tag::fresh(Some(now), Some(expire)), Arc::clone(&document));
            debug!(target = SOURCE, saved = ?outcome, "Stored assembled page");
        }

        Ok(RenderedPage {
            document,
            status: ctx.response().status(),
            headers: ctx.response().headers(),
            cookies: ctx.response().cookies(),
            from_cache: false,
            cachable,
        })
    }
}

enum Claim {
    Hit(Arc<Document>),
    Owned(RecomputeGuard),
    Unowned,
}

async fn claim(store: &CacheStore, key: &str, ctx: &Context) -> Claim {
    let waiter = match store.load(key) {
        LoadOutcome::Found { doc, .. } => return Claim::Hit(doc),
        LoadOutcome::NotFound(guard) | LoadOutcome::Expired { guard, .. } => {
            return Claim::Owned(guard);
        }
        LoadOutcome::NeedRecompute { waiter, .. } => waiter,
    };

    if tokio::time::timeout(ctx.timer().remained(), waiter.wait())
        .await
        .is_err()
    {
        return Claim::Unowned;
    }
    match store.load(key) {
        LoadOutcome::Found { doc, .. } => Claim::Hit(doc),
        LoadOutcome::NotFound(guard) | LoadOutcome::Expired { guard, .. } => Claim::Owned(guard),
        LoadOutcome::NeedRecompute { .. } => Claim::Unowned,
    }
}

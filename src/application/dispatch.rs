//! Running one block into its result slot: cache lookup for tag-capable
//! blocks, bounded execution, failure capture and the save back into the
//! block store.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, error, instrument, warn};

use crate::{
    cache::{CacheStore, Cached, LoadOutcome, RecomputeGuard},
    domain::{
        document::{Document, Element},
        tag::Tag,
    },
};

use super::{
    block::{Block, BlockError},
    context::Context,
    invoke::InvokeContext,
};

const SOURCE: &str = "application::dispatch";
const META_ELEMENT: &str = "meta";

/// Execute block `index` of the context's script and fill its slot.
#[instrument(skip_all, fields(request_id = %ctx.id(), index = index))]
pub(crate) async fn invoke_block(ctx: Arc<Context>, index: usize) {
    let Some(block) = ctx.script().blocks().get(index).cloned() else {
        error!(target = SOURCE, index, "Block index outside the script");
        return;
    };

    let started = Instant::now();
    let mut invoke = run(&ctx, block.as_ref()).await;
    let elapsed = started.elapsed();
    invoke.set_elapsed(elapsed);
    if block.info().meta {
        invoke.set_meta(meta_document(&invoke));
    }

    let info = block.info();
    histogram!("tessera_block_invoke_ms", "block" => info.kind.clone())
        .record(elapsed.as_secs_f64() * 1000.0);
    counter!(
        "tessera_block_invocations_total",
        "block" => info.kind.clone(),
        "outcome" => invoke.outcome().as_str()
    )
    .increment(1);
    debug!(
        target = SOURCE,
        block = %info.identity(),
        outcome = invoke.outcome().as_str(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Block finished"
    );

    if let Err(err) = ctx.set_result(index, invoke) {
        error!(target = SOURCE, index, error = %err, "Failed to store block result");
    }
}

/// Where a tag-capable block may be read from and saved to.
struct CacheSlot<'a> {
    store: &'a CacheStore,
    cache_time: Duration,
}

fn cache_slot<'a>(ctx: &'a Context, block: &dyn Block) -> Option<CacheSlot<'a>> {
    let engine = ctx.engine();
    let store = engine.block_cache()?;
    if !block.is_tag_capable() {
        return None;
    }
    let policy = block.info().tag?;
    if policy.cache_time <= engine.config().cache.minimal_cache_time() {
        return None;
    }
    if block
        .info()
        .strategy
        .as_ref()
        .is_some_and(|strategy| strategy.no_cache(ctx))
    {
        return None;
    }
    Some(CacheSlot {
        store,
        cache_time: policy.cache_time,
    })
}

enum Lookup {
    Hit,
    Owned(RecomputeGuard),
    /// Someone else still owns the key; run without saving.
    Unowned,
}

fn resolve(outcome: LoadOutcome, invoke: &mut InvokeContext) -> Result<Lookup, LoadOutcome> {
    match outcome {
        LoadOutcome::Found { tag, doc } => {
            invoke.use_cached(tag, doc);
            Ok(Lookup::Hit)
        }
        LoadOutcome::NotFound(guard) => Ok(Lookup::Owned(guard)),
        LoadOutcome::Expired { tag, doc, guard } => {
            invoke.set_previous(Cached { tag, doc });
            Ok(Lookup::Owned(guard))
        }
        contended @ LoadOutcome::NeedRecompute { .. } => Err(contended),
    }
}

async fn lookup(
    ctx: &Context,
    slot: &CacheSlot<'_>,
    key: &str,
    invoke: &mut InvokeContext,
) -> Lookup {
    let (stale, waiter) = match resolve(slot.store.load(key), invoke) {
        Ok(lookup) => return lookup,
        Err(LoadOutcome::NeedRecompute { stale, waiter }) => (stale, waiter),
        Err(_) => return Lookup::Unowned,
    };

    let limit = ctx.root().timer().remained();
    if tokio::time::timeout(limit, waiter.wait()).await.is_err() {
        if let Some(stale) = stale {
            invoke.set_previous(stale);
        }
        return Lookup::Unowned;
    }

    match resolve(slot.store.load(key), invoke) {
        Ok(lookup) => lookup,
        Err(LoadOutcome::NeedRecompute { stale, .. }) => {
            if let Some(stale) = stale {
                invoke.set_previous(stale);
            }
            Lookup::Unowned
        }
        Err(_) => Lookup::Unowned,
    }
}

async fn run(ctx: &Arc<Context>, block: &dyn Block) -> InvokeContext {
    let info = block.info();
    let mut invoke = InvokeContext::new(info.evaluate_args(ctx));

    let slot = cache_slot(ctx, block);
    let mut guard = None;
    if let Some(slot) = &slot {
        let key = block.create_tag_key(ctx, &invoke);
        invoke.set_tag_key(key.clone());
        match lookup(ctx, slot, key.as_str(), &mut invoke).await {
            Lookup::Hit => return invoke,
            Lookup::Owned(owned) => guard = Some(owned),
            Lookup::Unowned => {}
        }
    }

    match execute(ctx, block, &mut invoke).await {
        Ok(()) => {
            invoke.mark_success();
            if invoke.is_no_cache() {
                ctx.set_no_cache();
            }
            let previous = invoke.take_previous();
            if let (Some(slot), Some(guard)) = (slot, guard) {
                save(slot, guard, &mut invoke, previous);
            } else if let Some(previous) = previous {
                reuse_unmodified(&mut invoke, &previous);
            }
            invoke
        }
        Err(err) if err.is_critical() => {
            error!(target = SOURCE, block = %info.identity(), error = %err, "Critical block failure");
            let failed = block.error_result(err.message());
            ctx.record_critical(err);
            failed
        }
        Err(err) => {
            warn!(target = SOURCE, block = %info.identity(), error = %err, "Block failed");
            ctx.set_no_cache();
            block.error_result(err.message())
        }
    }
}

async fn execute(
    ctx: &Arc<Context>,
    block: &dyn Block,
    invoke: &mut InvokeContext,
) -> Result<(), BlockError> {
    let info = block.info();
    let limit = info.timeout.min(ctx.root().timer().remained());
    match tokio::time::timeout(limit, block.call(ctx, invoke)).await {
        Ok(result) => result,
        Err(_) => Err(BlockError::recoverable(info, "timed out")),
    }
}

/// An unmodified tag means the producer skipped the fetch and the stale copy
/// is still the current content.
fn reuse_unmodified(invoke: &mut InvokeContext, previous: &Cached) {
    if invoke.tag().is_some_and(|tag| !tag.modified) {
        invoke.set_document_arc(Arc::clone(&previous.doc));
    }
}

fn save(
    slot: CacheSlot<'_>,
    guard: RecomputeGuard,
    invoke: &mut InvokeContext,
    previous: Option<Cached>,
) {
    if let Some(previous) = &previous {
        reuse_unmodified(invoke, previous);
    }
    if invoke.is_no_cache() {
        return;
    }

    let mut tag = invoke.tag().copied().unwrap_or_default();
    if previous.is_none() {
        tag.modified = true;
    }
    let now = OffsetDateTime::now_utc();
    // A confirmed copy keeps its timestamps but starts a new freshness window.
    let tag = if tag.expired_at(now) {
        Tag {
            expire_time: None,
            ..tag
        }
    } else {
        tag
    }
    .expire_after_if_unset(now, slot.cache_time);
    invoke.set_tag(tag);
    let outcome = guard.save(tag, invoke.doc_arc());
    debug!(
        target = SOURCE,
        key = invoke.tag_key().map(|key| key.as_str()).unwrap_or_default(),
        saved = ?outcome,
        "Saved block result"
    );
}

fn meta_document(invoke: &InvokeContext) -> Document {
    let mut doc = Document::with_root(Element::new(META_ELEMENT));
    let Some(root) = doc.root_element() else {
        return doc;
    };

    let tag = invoke.tag().copied().unwrap_or_default();
    let timestamp = |at: Option<OffsetDateTime>| {
        at.map(|at| at.unix_timestamp().to_string())
            .unwrap_or_default()
    };
    let entries = [
        ("cached", if invoke.have_cached_copy() { "yes" } else { "no" }.to_string()),
        ("elapsed-time", invoke.elapsed().as_millis().to_string()),
        ("expire-time", timestamp(tag.expire_time)),
        ("last-modified", timestamp(tag.last_modified)),
    ];
    for (name, value) in entries {
        let param = doc.create_element(Element::new("param").with_attribute("name", name));
        let text = doc.create_text(value);
        doc.append_child(param, text);
        doc.append_child(root, param);
    }
    doc
}

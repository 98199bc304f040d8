//! `file` block: load a local XML document, or run a local script inline.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    application::{
        block::{Block, BlockDeclaration, BlockError, BlockFactory, BlockInfo},
        context::Context,
        invoke::InvokeContext,
        script::{ParseEnv, ScriptError, file_mtime},
    },
    domain::{document::Document, tag::Tag},
};

const SOURCE: &str = "infra::blocks::file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Load,
    Invoke,
}

#[derive(Debug)]
pub struct FileBlock {
    info: BlockInfo,
    method: Method,
    base_dir: Option<PathBuf>,
}

impl FileBlock {
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn load(&self, path: &Path, invoke: &mut InvokeContext) -> Result<(), BlockError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(target = SOURCE, path = %path.display(), error = %err, "File unavailable");
                invoke.set_document(Document::new());
                invoke.set_no_cache();
                return Ok(());
            }
        };

        if self.is_tag_capable() {
            if let Some(mtime) = file_mtime(&metadata) {
                let tag = Tag::combine(invoke.previous().map(|cached| &cached.tag), mtime);
                invoke.set_tag(tag);
                if !tag.modified {
                    return Ok(());
                }
            }
        }

        let source = match tokio::fs::read_to_string(path).await {
            Ok(source) => source,
            Err(err) => {
                debug!(target = SOURCE, path = %path.display(), error = %err, "File unreadable");
                invoke.set_document(Document::new());
                invoke.set_no_cache();
                return Ok(());
            }
        };
        let doc = Document::parse(&source).map_err(|err| {
            BlockError::recoverable(&self.info, format!("{}: {err}", path.display()))
        })?;
        invoke.set_document(doc);
        Ok(())
    }

    async fn invoke(
        &self,
        ctx: &Arc<Context>,
        path: &Path,
        invoke: &mut InvokeContext,
    ) -> Result<(), BlockError> {
        let script = ctx
            .engine()
            .load_script(path)
            .await
            .map_err(|err| BlockError::recoverable(&self.info, err.to_string()))?;

        let child = Context::child(ctx, Arc::clone(&script), BTreeMap::new());
        child.set_force_no_threaded(true);
        let doc = script.invoke(&child).await.map_err(|err| match err {
            ScriptError::Block(err) => err,
            other => BlockError::recoverable(&self.info, other.to_string()),
        })?;

        if child.no_cache() {
            invoke.set_no_cache();
        }
        invoke.set_document(doc);
        invoke.set_local_context(child);
        Ok(())
    }
}

#[async_trait]
impl Block for FileBlock {
    fn info(&self) -> &BlockInfo {
        &self.info
    }

    async fn call(&self, ctx: &Arc<Context>, invoke: &mut InvokeContext) -> Result<(), BlockError> {
        let path = invoke
            .args()
            .get(0)
            .map(|path| self.resolve(path))
            .ok_or_else(|| BlockError::recoverable(&self.info, "missing file path"))?;
        match self.method {
            Method::Load => self.load(&path, invoke).await,
            Method::Invoke => self.invoke(ctx, &path, invoke).await,
        }
    }

    fn is_tag_capable(&self) -> bool {
        self.method == Method::Load && self.info.tag.is_some()
    }
}

pub struct FileFactory;

impl BlockFactory for FileFactory {
    fn create(
        &self,
        declaration: BlockDeclaration,
        env: &ParseEnv<'_>,
    ) -> Result<Arc<dyn Block>, ScriptError> {
        let info = declaration.info;
        let method = match info.method.as_str() {
            "load" => Method::Load,
            "invoke" => Method::Invoke,
            other => {
                return Err(ScriptError::invalid_block(
                    info.identity(),
                    format!("unknown method `{other}`"),
                ));
            }
        };
        if info.params.is_empty() {
            return Err(ScriptError::invalid_block(
                info.identity(),
                "a file path param is required",
            ));
        }
        Ok(Arc::new(FileBlock {
            info,
            method,
            base_dir: env.base_dir.map(Path::to_path_buf),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::{
        application::{engine::Engine, engine::EngineConfig, request::Request},
        cache::StrategySet,
        infra::blocks::builtin_registry,
    };

    use super::*;

    fn engine() -> Arc<Engine> {
        Engine::new(EngineConfig::default(), builtin_registry(), StrategySet::default())
    }

    async fn render(engine: &Arc<Engine>, script_path: &Path) -> (String, Arc<Context>) {
        let script = engine.load_script(script_path).await.expect("script loads");
        let ctx = Context::new(
            Arc::clone(engine),
            Arc::clone(&script),
            Request::from_url("/").expect("url"),
        );
        let doc = script.invoke(&ctx).await.expect("invoke");
        (doc.to_xml(), ctx)
    }

    #[tokio::test]
    async fn relative_files_resolve_against_the_script_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("news.xml"), "<news><item>a</item></news>").expect("write");
        let page = dir.path().join("page.xml");
        fs::write(
            &page,
            r#"<page xmlns:b="urn:tessera:block"><b:file method="load"><param>news.xml</param></b:file></page>"#,
        )
        .expect("write");

        let (xml, ctx) = render(&engine(), &page).await;
        assert_eq!(
            xml,
            r#"<page xmlns:b="urn:tessera:block"><news><item>a</item></news></page>"#
        );
        assert!(!ctx.no_cache());
    }

    #[tokio::test]
    async fn missing_files_remove_the_node_and_disable_caching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let page = dir.path().join("page.xml");
        fs::write(
            &page,
            r#"<page xmlns:b="urn:tessera:block"><b:file method="load"><param>absent.xml</param></b:file></page>"#,
        )
        .expect("write");

        let (xml, ctx) = render(&engine(), &page).await;
        assert_eq!(xml, r#"<page xmlns:b="urn:tessera:block"/>"#);
        assert!(ctx.no_cache());
    }

    #[tokio::test]
    async fn invoke_runs_nested_scripts_inline() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("leaf.xml"), "<leaf/>").expect("write");
        fs::write(
            dir.path().join("inner.xml"),
            r#"<inner xmlns:b="urn:tessera:block"><b:file method="load" threaded="yes"><param>leaf.xml</param></b:file></inner>"#,
        )
        .expect("write");
        let page = dir.path().join("page.xml");
        fs::write(
            &page,
            r#"<page xmlns:b="urn:tessera:block"><b:file method="invoke"><param>inner.xml</param></b:file></page>"#,
        )
        .expect("write");

        let (xml, _) = render(&engine(), &page).await;
        assert_eq!(
            xml,
            r#"<page xmlns:b="urn:tessera:block"><inner xmlns:b="urn:tessera:block"><leaf/></inner></page>"#
        );
    }

    #[test]
    fn unknown_methods_are_rejected_at_parse_time() {
        let engine = engine();
        let result = engine.parse_script(
            "page.xml",
            r#"<page xmlns:b="urn:tessera:block"><b:file method="fetch"><param>a</param></b:file></page>"#,
        );
        assert!(matches!(result, Err(ScriptError::InvalidBlock { .. })));
    }
}

//! `local` block: an inline sub-script run in a child context.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    application::{
        block::{Block, BlockDeclaration, BlockError, BlockFactory, BlockInfo},
        context::Context,
        invoke::InvokeContext,
        script::{ParseEnv, Script, ScriptError},
    },
    domain::{document::Document, tag::Tag},
};

const ROOT_WRAPPER: &str = "root";

#[derive(Debug)]
pub struct LocalBlock {
    info: BlockInfo,
    script: Arc<Script>,
    /// Local parameter names, in declaration order.
    names: Vec<String>,
}

#[async_trait]
impl Block for LocalBlock {
    fn info(&self) -> &BlockInfo {
        &self.info
    }

    async fn call(&self, ctx: &Arc<Context>, invoke: &mut InvokeContext) -> Result<(), BlockError> {
        let params: BTreeMap<String, String> = self
            .names
            .iter()
            .cloned()
            .zip(invoke.args().iter().map(str::to_string))
            .collect();

        let child = Context::child(ctx, Arc::clone(&self.script), params);
        let doc = self.script.invoke(&child).await.map_err(|err| match err {
            ScriptError::Block(err) => err,
            other => BlockError::recoverable(&self.info, other.to_string()),
        })?;

        if child.no_cache() {
            invoke.set_no_cache();
        }
        if self.is_tag_capable() {
            invoke.set_tag(Tag::fresh(Some(OffsetDateTime::now_utc()), None));
        }
        invoke.set_document(doc);
        invoke.set_local_context(child);
        Ok(())
    }
}

pub struct LocalFactory;

impl BlockFactory for LocalFactory {
    fn create(
        &self,
        declaration: BlockDeclaration,
        env: &ParseEnv<'_>,
    ) -> Result<Arc<dyn Block>, ScriptError> {
        let BlockDeclaration { info, content } = declaration;
        let Some(mut content) = content else {
            return Err(ScriptError::invalid_block(
                info.identity(),
                "an inline script element is required",
            ));
        };

        let names = info
            .params
            .iter()
            .map(|param| {
                param.id.clone().ok_or_else(|| {
                    ScriptError::invalid_block(info.identity(), "every local param needs an id")
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        unwrap_root(&mut content);
        let name = format!("{}#local", info.identity());
        let script = Script::from_document(&name, content, env)?;

        Ok(Arc::new(LocalBlock {
            info,
            script: Arc::new(script),
            names,
        }))
    }
}

/// `<root name="x">` renames the inline root element to `x`.
fn unwrap_root(content: &mut Document) {
    let Some(root) = content.root_element() else {
        return;
    };
    let Some(element) = content.element_mut(root) else {
        return;
    };
    if element.namespace.is_some() || element.name != ROOT_WRAPPER {
        return;
    }
    let Some(position) = element.attributes.iter().position(|attr| attr.name == "name") else {
        return;
    };
    element.name = element.attributes.remove(position).value;
}

#[cfg(test)]
mod tests {
    use crate::{
        application::{engine::Engine, engine::EngineConfig, request::Request},
        cache::StrategySet,
        infra::blocks::builtin_registry,
    };

    use super::*;

    fn engine() -> Arc<Engine> {
        Engine::new(EngineConfig::default(), builtin_registry(), StrategySet::default())
    }

    async fn render(engine: &Arc<Engine>, source: &str, url: &str) -> (String, Arc<Context>) {
        let script = engine.parse_script("page.xml", source).expect("script parses");
        let ctx = Context::new(
            Arc::clone(engine),
            Arc::clone(&script),
            Request::from_url(url).expect("url"),
        );
        let doc = script.invoke(&ctx).await.expect("invoke");
        (doc.to_xml(), ctx)
    }

    #[tokio::test]
    async fn local_params_reach_the_inline_script() {
        let source = concat!(
            r#"<page xmlns:b="urn:tessera:block"><b:local>"#,
            r#"<param id="show" type="QueryArg">on</param>"#,
            r#"<param id="hide" type="String"></param>"#,
            r#"<root name="greeting">"#,
            r#"<b:state method="dump" guard="show" guard-type="LocalArg"/>"#,
            r#"<b:state method="echo_query" guard="hide" guard-type="LocalArg"/>"#,
            r#"</root></b:local></page>"#,
        );

        let (xml, ctx) = render(&engine(), source, "/?on=1").await;
        assert_eq!(
            xml,
            r#"<page xmlns:b="urn:tessera:block"><greeting><state/></greeting></page>"#
        );
        assert!(!ctx.no_cache());
    }

    #[tokio::test]
    async fn no_cache_in_the_inline_script_reaches_the_page() {
        let source = concat!(
            r#"<page xmlns:b="urn:tessera:block"><b:local><inner>"#,
            r#"<b:file method="load"><param>/nonexistent/tessera.xml</param></b:file>"#,
            r#"</inner></b:local></page>"#,
        );

        let (xml, ctx) = render(&engine(), source, "/").await;
        assert_eq!(xml, r#"<page xmlns:b="urn:tessera:block"><inner/></page>"#);
        assert!(ctx.no_cache());
    }

    #[test]
    fn params_without_ids_are_rejected() {
        let result = engine().parse_script(
            "page.xml",
            r#"<page xmlns:b="urn:tessera:block"><b:local><param>x</param><inner/></b:local></page>"#,
        );
        assert!(matches!(result, Err(ScriptError::InvalidBlock { .. })));
    }

    #[test]
    fn missing_inline_content_is_rejected() {
        let result = engine().parse_script(
            "page.xml",
            r#"<page xmlns:b="urn:tessera:block"><b:local/></page>"#,
        );
        assert!(matches!(result, Err(ScriptError::InvalidBlock { .. })));
    }

    #[test]
    fn root_wrapper_is_renamed() {
        let mut doc = Document::parse(r#"<root name="news"><item/></root>"#).expect("parse");
        unwrap_root(&mut doc);
        assert_eq!(doc.to_xml(), "<news><item/></news>");
    }
}

//! End-to-end assembly of page scripts through the public engine API.

use std::{
    fs,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tessera::{
    application::{
        block::{Block, BlockDeclaration, BlockError, BlockFactory, BlockInfo, BlockRegistry},
        context::Context,
        engine::{Engine, EngineConfig},
        invoke::InvokeContext,
        request::Request,
        script::{ParseEnv, Script, ScriptError},
    },
    cache::StrategySet,
    domain::document::{Document, Element},
    infra::blocks::builtin_registry,
};

/// Sleeps for `method` milliseconds, then yields `<slept ms="…"/>`.
#[derive(Debug)]
struct SleepBlock {
    info: BlockInfo,
    delay: Duration,
}

#[async_trait]
impl Block for SleepBlock {
    fn info(&self) -> &BlockInfo {
        &self.info
    }

    async fn call(&self, _ctx: &Arc<Context>, invoke: &mut InvokeContext) -> Result<(), BlockError> {
        tokio::time::sleep(self.delay).await;
        invoke.set_document(Document::with_root(
            Element::new("slept").with_attribute("ms", self.delay.as_millis().to_string()),
        ));
        Ok(())
    }
}

struct SleepFactory;

impl BlockFactory for SleepFactory {
    fn create(
        &self,
        declaration: BlockDeclaration,
        _env: &ParseEnv<'_>,
    ) -> Result<Arc<dyn Block>, ScriptError> {
        let info = declaration.info;
        let millis = info
            .method
            .parse::<u64>()
            .map_err(|err| ScriptError::invalid_block(info.identity(), err.to_string()))?;
        Ok(Arc::new(SleepBlock {
            info,
            delay: Duration::from_millis(millis),
        }))
    }
}

fn engine() -> Arc<Engine> {
    let mut blocks: BlockRegistry = builtin_registry();
    blocks.register("sleep", SleepFactory);
    Engine::new(EngineConfig::default(), blocks, StrategySet::default())
}

async fn invoke(engine: &Arc<Engine>, script: &Arc<Script>, url: &str) -> (String, Arc<Context>) {
    let ctx = Context::new(
        Arc::clone(engine),
        Arc::clone(script),
        Request::from_url(url).expect("valid url"),
    );
    let doc = script.invoke(&ctx).await.expect("script invokes");
    (doc.to_xml(), ctx)
}

#[tokio::test]
async fn slow_threaded_block_times_out_while_inline_blocks_keep_content() {
    let engine = engine();
    let script = engine
        .parse_script(
            "page.xml",
            concat!(
                r#"<page xmlns:b="urn:tessera:block">"#,
                r#"<b:sleep method="200" threaded="yes" timeout="100"/>"#,
                r#"<b:sleep method="1"/>"#,
                r#"<b:sleep method="2"/>"#,
                r#"</page>"#,
            ),
        )
        .expect("script parses");

    let (xml, ctx) = invoke(&engine, &script, "/").await;

    assert_eq!(
        xml,
        concat!(
            r#"<page xmlns:b="urn:tessera:block">"#,
            r#"<xscript_invoke_failed error="timed out" block="sleep" method="200"/>"#,
            r#"<slept ms="1"/>"#,
            r#"<slept ms="2"/>"#,
            r#"</page>"#,
        )
    );
    assert!(ctx.no_cache());
    assert!(ctx.results_ready());
}

#[tokio::test]
async fn threaded_blocks_run_concurrently() {
    let engine = engine();
    let script = engine
        .parse_script(
            "page.xml",
            concat!(
                r#"<page xmlns:b="urn:tessera:block">"#,
                r#"<b:sleep method="100" threaded="yes" timeout="2000"/>"#,
                r#"<b:sleep method="100" threaded="yes" timeout="2000"/>"#,
                r#"<b:sleep method="100" threaded="yes" timeout="2000"/>"#,
                r#"</page>"#,
            ),
        )
        .expect("script parses");

    let started = Instant::now();
    let (xml, ctx) = invoke(&engine, &script, "/").await;
    let elapsed = started.elapsed();

    assert_eq!(xml.matches(r#"<slept ms="100"/>"#).count(), 3);
    assert!(!ctx.no_cache());
    assert!(elapsed < Duration::from_millis(280), "took {elapsed:?}");
}

#[tokio::test]
async fn all_threaded_is_ignored_when_the_engine_forces_inline() {
    let config = EngineConfig {
        force_no_threaded: true,
        ..EngineConfig::default()
    };
    let mut blocks = builtin_registry();
    blocks.register("sleep", SleepFactory);
    let engine = Engine::new(config, blocks, StrategySet::default());
    let script = engine
        .parse_script(
            "page.xml",
            concat!(
                r#"<page xmlns:b="urn:tessera:block">"#,
                r#"<b:xscript all-threaded="yes"/>"#,
                r#"<b:sleep method="10"/>"#,
                r#"<b:sleep method="10"/>"#,
                r#"</page>"#,
            ),
        )
        .expect("script parses");

    let (xml, _) = invoke(&engine, &script, "/").await;
    assert_eq!(
        xml,
        r#"<page xmlns:b="urn:tessera:block"><slept ms="10"/><slept ms="10"/></page>"#
    );
}

#[tokio::test]
async fn file_results_are_narrowed_by_xpointer() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join("news.xml"),
        r#"<news><item id="1">one</item><skip/><item id="2">two</item></news>"#,
    )
    .expect("write data");
    let page = dir.path().join("page.xml");
    fs::write(
        &page,
        concat!(
            r#"<page xmlns:b="urn:tessera:block">"#,
            r#"<b:file method="load" xpointer="/news/item"><param>news.xml</param></b:file>"#,
            r#"<b:file method="load" xpointer="/news/item[2]/@id"><param>news.xml</param></b:file>"#,
            r#"<b:file method="load" xpointer="/.."><param>news.xml</param></b:file>"#,
            r#"</page>"#,
        ),
    )
    .expect("write script");

    let engine = engine();
    let script = engine.load_script(&page).await.expect("script loads");
    let (xml, _) = invoke(&engine, &script, "/").await;

    assert_eq!(
        xml,
        r#"<page xmlns:b="urn:tessera:block"><item id="1">one</item><item id="2">two</item>2</page>"#
    );
}

#[tokio::test]
async fn guards_read_state_written_by_earlier_inline_blocks() {
    let engine = engine();
    let script = engine
        .parse_script(
            "page.xml",
            concat!(
                r#"<page xmlns:b="urn:tessera:block">"#,
                r#"<b:state method="set_bool"><param>beta</param><param type="QueryArg">beta</param></b:state>"#,
                r#"<b:sleep method="1" guard="beta"/>"#,
                r#"<b:sleep method="2" guard-not="beta"/>"#,
                r#"</page>"#,
            ),
        )
        .expect("script parses");

    let (on, _) = invoke(&engine, &script, "/?beta=1").await;
    assert_eq!(on, r#"<page xmlns:b="urn:tessera:block"><slept ms="1"/></page>"#);

    let (off, _) = invoke(&engine, &script, "/").await;
    assert_eq!(off, r#"<page xmlns:b="urn:tessera:block"><slept ms="2"/></page>"#);
}

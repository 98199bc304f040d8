//! Block and page caching driven by freshness tags.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use tessera::{
    application::{
        context::Context,
        engine::{Engine, EngineConfig},
        invoke::Outcome,
        page::PageRenderer,
        request::Request,
    },
    cache::{CacheConfig, PartSpec, StrategyDefinition, StrategyRegistry, StrategySet},
    infra::blocks::builtin_registry,
};

const FILE_PAGE: &str = concat!(
    r#"<page xmlns:b="urn:tessera:block">"#,
    r#"<b:file method="load" tag="yes"><param>data.xml</param></b:file>"#,
    r#"</page>"#,
);

fn engine_with(cache: CacheConfig) -> Arc<Engine> {
    let config = EngineConfig {
        cache,
        ..EngineConfig::default()
    };
    Engine::new(config, builtin_registry(), StrategySet::default())
}

fn write_file(path: &Path, content: &str) {
    fs::write(path, content).expect("write file");
}

fn set_mtime(path: &Path, at: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(at))
        .expect("set mtime");
}

fn mtime(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .expect("read mtime")
}

async fn invoke_file_page(engine: &Arc<Engine>, page: &PathBuf) -> (String, Arc<Context>) {
    let script = engine.load_script(page).await.expect("script loads");
    let ctx = Context::new(
        Arc::clone(engine),
        Arc::clone(&script),
        Request::from_url("/").expect("url"),
    );
    let xml = script.invoke(&ctx).await.expect("invoke").to_xml();
    (xml, ctx)
}

async fn render_file_page(engine: &Arc<Engine>, page: &PathBuf) -> String {
    invoke_file_page(engine, page).await.0
}

fn cache_without_pages(ttl_seconds: u64) -> CacheConfig {
    CacheConfig {
        enable_page_cache: false,
        ttl_seconds,
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn fresh_block_results_are_served_from_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data = dir.path().join("data.xml");
    let page = dir.path().join("page.xml");
    write_file(&data, "<data>first</data>");
    write_file(&page, FILE_PAGE);

    let engine = engine_with(cache_without_pages(0));
    let first = render_file_page(&engine, &page).await;
    assert!(first.contains("<data>first</data>"));

    write_file(&data, "<data>second</data>");
    set_mtime(&data, SystemTime::now() + Duration::from_secs(10));

    let (second, ctx) = invoke_file_page(&engine, &page).await;
    assert_eq!(second, first);
    assert_eq!(engine.block_cache().map(|store| store.len()), Some(1));

    let replayed = ctx.result(0).expect("block result");
    assert_eq!(replayed.outcome(), Outcome::Cached);
    assert!(replayed.have_cached_copy());
    assert_eq!(replayed.tag().map(|tag| tag.modified), Some(false));
}

#[tokio::test]
async fn unchanged_files_are_not_reread_after_expiry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data = dir.path().join("data.xml");
    let page = dir.path().join("page.xml");
    write_file(&data, "<data>first</data>");
    write_file(&page, FILE_PAGE);
    let original = mtime(&data);

    let engine = engine_with(cache_without_pages(1));
    let first = render_file_page(&engine, &page).await;
    assert!(first.contains("<data>first</data>"));

    // Same mtime, different bytes: only a re-read could observe the change.
    write_file(&data, "<data>second</data>");
    set_mtime(&data, original);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let second = render_file_page(&engine, &page).await;
    assert!(second.contains("<data>first</data>"), "got {second}");
}

#[tokio::test]
async fn modified_files_are_reread_after_expiry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data = dir.path().join("data.xml");
    let page = dir.path().join("page.xml");
    write_file(&data, "<data>first</data>");
    write_file(&page, FILE_PAGE);

    let engine = engine_with(cache_without_pages(1));
    render_file_page(&engine, &page).await;

    write_file(&data, "<data>second</data>");
    set_mtime(&data, SystemTime::now() + Duration::from_secs(10));
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let second = render_file_page(&engine, &page).await;
    assert!(second.contains("<data>second</data>"), "got {second}");
}

#[tokio::test]
async fn cachable_pages_are_served_from_the_page_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let page = dir.path().join("page.xml");
    write_file(
        &page,
        concat!(
            r#"<page xmlns:b="urn:tessera:block">"#,
            r#"<b:xscript cache-time="60"/>"#,
            r#"<b:state method="echo_query"/>"#,
            r#"</page>"#,
        ),
    );

    let engine = engine_with(CacheConfig::default());
    let renderer = PageRenderer::new(Arc::clone(&engine));

    let first = renderer
        .render_path(&page, Request::from_url("/?a=1").expect("url"))
        .await
        .expect("first render");
    assert!(!first.from_cache);
    assert!(first.cachable);

    let second = renderer
        .render_path(&page, Request::from_url("/?a=1").expect("url"))
        .await
        .expect("second render");
    assert!(second.from_cache);
    assert!(Arc::ptr_eq(&first.document, &second.document));
    assert!(second.headers.iter().any(|(name, _)| name == "Expires"));

    let other = renderer
        .render_path(&page, Request::from_url("/?a=2").expect("url"))
        .await
        .expect("third render");
    assert!(!other.from_cache);
    assert!(other.document.to_xml().contains(r#"<param name="a">2</param>"#));
}

#[tokio::test]
async fn no_cache_pages_are_not_stored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let page = dir.path().join("page.xml");
    write_file(
        &page,
        concat!(
            r#"<page xmlns:b="urn:tessera:block">"#,
            r#"<b:xscript cache-time="60"/>"#,
            r#"<b:file method="load"><param>missing.xml</param></b:file>"#,
            r#"</page>"#,
        ),
    );

    let engine = engine_with(CacheConfig::default());
    let renderer = PageRenderer::new(Arc::clone(&engine));
    for _ in 0..2 {
        let rendered = renderer
            .render_path(&page, Request::from_url("/").expect("url"))
            .await
            .expect("render");
        assert!(!rendered.from_cache);
        assert!(!rendered.cachable);
    }
    assert_eq!(engine.page_cache().map(|store| store.len()), Some(0));
}

#[test]
fn query_order_does_not_change_sorted_strategy_keys() {
    let config = EngineConfig {
        strategies: vec![
            StrategyDefinition {
                name: "sorted".to_string(),
                parts: vec![PartSpec::new("query", "")],
            },
            StrategyDefinition {
                name: "ordered".to_string(),
                parts: vec![PartSpec::new("query", "").unsorted()],
            },
        ],
        ..EngineConfig::default()
    };
    let engine = Engine::with_strategies(config, builtin_registry(), &StrategyRegistry::builtin())
        .expect("engine");
    let script = engine
        .parse_script("page.xml", "<page/>")
        .expect("script parses");
    let context = |url: &str| {
        Context::new(
            Arc::clone(&engine),
            Arc::clone(&script),
            Request::from_url(url).expect("url"),
        )
    };
    let forward = context("/?a=1&b=2");
    let reverse = context("/?b=2&a=1");

    let sorted = engine.strategies().get("sorted").expect("sorted strategy");
    assert_eq!(sorted.create_key(&forward), sorted.create_key(&reverse));

    let ordered = engine.strategies().get("ordered").expect("ordered strategy");
    assert_ne!(ordered.create_key(&forward), ordered.create_key(&reverse));
    assert_ne!(sorted.create_key(&forward), ordered.create_key(&forward));
}

use std::{fs, path::PathBuf};

use serial_test::serial;

use super::*;

fn cli(args: &[&str]) -> CliArgs {
    CliArgs::try_parse_from(args).expect("valid command line")
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(
        settings.engine.request_timeout,
        Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
    );
    assert_eq!(settings.engine.default_tag_time, Duration::from_secs(60));
    assert!(settings.cache.enable_block_cache);
    assert_eq!(settings.cache.page_capacity.get(), 256);
    assert!(settings.strategies.is_empty());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.engine.block_timeout_ms = Some(1_000);
    raw.logging.level = Some("info".to_string());

    raw.apply_cli(&cli(&[
        "tessera",
        "--log-level",
        "debug",
        "render",
        "page.xml",
        "--engine-block-timeout-ms",
        "250",
        "--cache-enable-page-cache",
        "false",
    ]));
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.engine.block_timeout, Duration::from_millis(250));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(!settings.cache.enable_page_cache);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    raw.apply_cli(&cli(&["tessera", "check", "page.xml", "--log-json", "yes"]));
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn render_arguments_are_parsed() {
    let args = cli(&[
        "tessera",
        "render",
        "pages/index.xml",
        "--url",
        "/news?id=3",
        "--cookie",
        "uid=7",
        "--cookie",
        "lang=en",
        "--repeat",
        "2",
    ]);
    let Command::Render(render) = args.command else {
        panic!("expected render command");
    };
    assert_eq!(render.script, PathBuf::from("pages/index.xml"));
    assert_eq!(render.url, "/news?id=3");
    assert_eq!(render.cookies, ["uid=7", "lang=en"]);
    assert_eq!(render.repeat, 2);
    assert_eq!(render.method, "GET");
}

#[test]
fn repeat_must_be_positive() {
    assert!(CliArgs::try_parse_from(["tessera", "render", "a.xml", "--repeat", "0"]).is_err());
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("verbose".to_string());
    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn zero_timeouts_are_rejected() {
    let mut raw = RawSettings::default();
    raw.engine.request_timeout_ms = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero timeout");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "engine.request_timeout_ms",
            ..
        }
    ));
}

#[test]
fn block_timeout_may_not_exceed_request_timeout() {
    let mut raw = RawSettings::default();
    raw.engine.request_timeout_ms = Some(100);
    raw.engine.block_timeout_ms = Some(200);
    let err = Settings::from_raw(raw).expect_err("block timeout too long");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "engine.block_timeout_ms",
            ..
        }
    ));
}

#[test]
fn zero_capacity_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.block_capacity = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero capacity");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.block_capacity",
            ..
        }
    ));
}

#[test]
fn cookies_cannot_be_both_allowed_and_denied() {
    let mut raw = RawSettings::default();
    raw.policy.allow_caching_cookies = Some(vec!["lang".to_string()]);
    raw.policy.deny_cookies = Some(vec![" lang ".to_string()]);
    let err = Settings::from_raw(raw).expect_err("conflicting policy");
    assert!(matches!(err, LoadError::Invalid { key: "policy", .. }));
}

#[test]
fn strategy_parts_follow_a_fixed_order() {
    let mut raw = RawSettings::default();
    raw.strategies.insert(
        "news".to_string(),
        RawStrategySettings {
            no_cache_state: Some("preview".to_string()),
            cookie: Some("lang".to_string()),
            query: Some("id,page".to_string()),
            query_sort: Some(false),
            ..Default::default()
        },
    );
    let settings = Settings::from_raw(raw).expect("valid settings");

    let strategy = &settings.strategies[0];
    assert_eq!(strategy.name, "news");
    let kinds: Vec<&str> = strategy.parts.iter().map(|part| part.kind.as_str()).collect();
    assert_eq!(kinds, ["query", "cookie", "no-cache-state"]);
    assert!(!strategy.parts[0].sort);
    assert!(!strategy.parts[0].except);
}

#[test]
fn empty_strategies_are_rejected() {
    let mut raw = RawSettings::default();
    raw.strategies
        .insert("hollow".to_string(), RawStrategySettings::default());
    let err = Settings::from_raw(raw).expect_err("empty strategy");
    assert!(matches!(err, LoadError::Invalid { key: "strategies", .. }));
}

#[test]
#[serial]
fn config_file_and_environment_are_layered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tessera.toml");
    fs::write(
        &path,
        r#"
[engine]
block_timeout_ms = 1500

[cache]
page_capacity = 32

[strategies.by-query]
query = "id"
"#,
    )
    .expect("write config");

    // SAFETY: the test is serialised; no other thread reads the environment.
    unsafe {
        std::env::set_var("TESSERA__CACHE__PAGE_CAPACITY", "64");
        std::env::set_var("TESSERA__POLICY__DENY_COOKIES", "session,token");
    }
    let path_arg = path.to_string_lossy().into_owned();
    let result = load(&cli(&["tessera", "--config-file", &path_arg, "check", "a.xml"]));
    unsafe {
        std::env::remove_var("TESSERA__CACHE__PAGE_CAPACITY");
        std::env::remove_var("TESSERA__POLICY__DENY_COOKIES");
    }

    let settings = result.expect("settings load");
    assert_eq!(settings.engine.block_timeout, Duration::from_millis(1500));
    assert_eq!(settings.cache.page_capacity.get(), 64);
    assert_eq!(settings.policy.deny_cookies, ["session", "token"]);
    assert_eq!(settings.strategies[0].name, "by-query");
}

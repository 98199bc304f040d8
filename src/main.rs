use std::{
    fmt,
    io::{self, Write},
    process,
    sync::Arc,
};

use tessera::{
    application::{
        engine::{Engine, EngineConfig},
        error::AppError,
        page::PageRenderer,
        request::Request,
    },
    cache::StrategyRegistry,
    config::{self, CheckArgs, RenderArgs},
    infra::{blocks::builtin_registry, error::InfraError, sweeper, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const SOURCE: &str = "tessera::main";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(i32::from(error.exit_code()));
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let engine = Engine::with_strategies(
        EngineConfig::from(&settings),
        builtin_registry(),
        &StrategyRegistry::builtin(),
    )?;

    match cli_args.command {
        config::Command::Render(args) => run_render(engine, *args).await,
        config::Command::Check(args) => run_check(engine, args).await,
    }
}

async fn run_render(engine: Arc<Engine>, args: RenderArgs) -> Result<(), AppError> {
    let request = build_request(&args)?;

    let sweep_handle = engine
        .config()
        .cache
        .is_enabled()
        .then(|| sweeper::spawn(Arc::clone(&engine), engine.config().cache.sweep_interval()));

    let renderer = PageRenderer::new(Arc::clone(&engine));
    let mut result = Ok(());
    for round in 1..=args.repeat {
        match renderer.render_path(&args.script, request.clone()).await {
            Ok(page) => {
                info!(
                    target = SOURCE,
                    round,
                    status = page.status,
                    from_cache = page.from_cache,
                    cachable = page.cachable,
                    headers = ?page.headers,
                    cookies = ?page.cookies,
                    "Rendered page"
                );
                if let Err(err) = emit(&mut io::stdout().lock(), &page.document) {
                    result = Err(err);
                    break;
                }
            }
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }

    if let Some(handle) = sweep_handle {
        handle.abort();
        let _ = handle.await;
    }
    result
}

async fn run_check(engine: Arc<Engine>, args: CheckArgs) -> Result<(), AppError> {
    let script = engine.load_script(&args.script).await?;
    let properties = script.properties();

    info!(
        target = SOURCE,
        script = %script.name(),
        blocks = script.blocks().len(),
        stylesheet = ?script.stylesheet(),
        cache_time = ?properties.cache_time,
        "Script is valid"
    );

    let mut stdout = io::stdout().lock();
    for block in script.blocks() {
        let info = block.info();
        let strategy = info
            .strategy
            .as_ref()
            .map(|strategy| strategy.name().to_string())
            .unwrap_or_else(|| "-".to_string());
        let tag = match (block.is_tag_capable(), info.tag) {
            (true, Some(policy)) => format!("{}s", policy.cache_time.as_secs()),
            _ => "-".to_string(),
        };
        emit(
            &mut stdout,
            format_args!(
                "{}\tthreaded={}\ttimeout={}ms\ttag={}\tstrategy={}",
                info.identity(),
                info.threaded,
                info.timeout.as_millis(),
                tag,
                strategy
            ),
        )?;
    }
    Ok(())
}

/// Write one line of command output.
fn emit(out: &mut impl Write, line: impl fmt::Display) -> Result<(), AppError> {
    writeln!(out, "{line}").map_err(|err| AppError::from(InfraError::from(err)))
}

fn build_request(args: &RenderArgs) -> Result<Request, AppError> {
    let mut request = Request::from_url(&args.url)?.with_method(&args.method);
    for cookie in &args.cookies {
        let (name, value) = split_pair(cookie, "--cookie")?;
        request = request.with_cookie(name, value);
    }
    for header in &args.headers {
        let (name, value) = split_pair(header, "--header")?;
        request = request.with_header(name, value);
    }
    Ok(request)
}

fn split_pair<'a>(raw: &'a str, flag: &str) -> Result<(&'a str, &'a str), AppError> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => Err(AppError::validation(format!(
            "{flag} expects NAME=VALUE, got `{raw}`"
        ))),
    }
}

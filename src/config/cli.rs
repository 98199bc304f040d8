use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the Tessera binary.
#[derive(Debug, Parser)]
#[command(name = "tessera", version, about = "Tessera XML page assembler")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "TESSERA_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a script against a synthetic request and print the merged document.
    Render(Box<RenderArgs>),
    /// Parse a script and list its blocks.
    Check(CheckArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[arg(value_name = "SCRIPT", value_hint = ValueHint::FilePath)]
    pub script: PathBuf,

    /// Request URL, path and query string.
    #[arg(long, default_value = "/", value_name = "URL")]
    pub url: String,

    /// Request method checked against `allow-methods`.
    #[arg(long, default_value = "GET", value_name = "METHOD")]
    pub method: String,

    /// Request cookie as NAME=VALUE; may be repeated.
    #[arg(long = "cookie", value_name = "NAME=VALUE")]
    pub cookies: Vec<String>,

    /// Request header as NAME=VALUE; may be repeated.
    #[arg(long = "header", value_name = "NAME=VALUE")]
    pub headers: Vec<String>,

    /// Render the page this many times, to exercise the caches.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,

    #[command(flatten)]
    pub overrides: EngineOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct CheckArgs {
    #[arg(value_name = "SCRIPT", value_hint = ValueHint::FilePath)]
    pub script: PathBuf,

    #[command(flatten)]
    pub overrides: EngineOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EngineOverrides {
    /// Override the request deadline.
    #[arg(long = "engine-request-timeout-ms", value_name = "MS")]
    pub request_timeout_ms: Option<u64>,

    /// Override the timeout of blocks that declare none.
    #[arg(long = "engine-block-timeout-ms", value_name = "MS")]
    pub block_timeout_ms: Option<u64>,

    /// Run every block inline.
    #[arg(
        long = "engine-force-no-threaded",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub force_no_threaded: Option<bool>,

    /// Toggle the block-result store.
    #[arg(
        long = "cache-enable-block-cache",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub enable_block_cache: Option<bool>,

    /// Toggle the page store.
    #[arg(
        long = "cache-enable-page-cache",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub enable_page_cache: Option<bool>,
}

impl Command {
    pub fn overrides(&self) -> &EngineOverrides {
        match self {
            Command::Render(args) => &args.overrides,
            Command::Check(args) => &args.overrides,
        }
    }
}

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use harbor_run::{exit_code, RunConfig, RunController};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "harbor", about = "Run a WebAssembly module inside the harbor sandbox")]
struct Cli {
    /// Path to the .wasm module; also the module's first argument
    module: PathBuf,

    /// Arguments passed to the module after its path
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    args: Vec<String>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Export to run instead of the configured entry
    #[arg(long)]
    entry: Option<String>,

    /// Environment variable for the module, KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Expose this process's environment to the module
    #[arg(long)]
    inherit_env: bool,

    /// Seed for the module's random source
    #[arg(long)]
    seed: Option<u64>,

    /// Cancel the run after this many milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Cap on linear memory pages
    #[arg(long)]
    max_pages: Option<u32>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn init_logging(format: LogFormat) {
    // Logs go to stderr; stdout belongs to the module.
    let filter = EnvFilter::try_from_env("HARBOR_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

impl Cli {
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
            None => RunConfig::default(),
        };
        if let Some(entry) = &self.entry {
            config.engine.entry = entry.clone();
        }
        if let Some(pages) = self.max_pages {
            config.engine.max_memory_pages = pages;
        }
        if self.seed.is_some() {
            config.host.seed = self.seed;
        }
        if self.deadline_ms.is_some() {
            config.run.deadline_ms = self.deadline_ms;
        }
        config.host.inherit_env |= self.inherit_env;
        config.host.env.extend(self.env.iter().cloned());
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = cli.run_config()?;
    tracing::info!(
        module = %cli.module.display(),
        entry = %config.engine.entry,
        deadline_ms = ?config.run.deadline_ms,
        "starting harbor"
    );

    let controller = RunController::new(config);
    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            stop.stop();
        }
    });

    let code = match controller.run_file(&cli.module, cli.args.clone()).await {
        Ok(state) => {
            if !matches!(state, harbor_wasm::TerminalState::NormalExit(_)) {
                eprintln!("harbor: {state}");
            }
            exit_code(&state)
        }
        Err(e) => {
            eprintln!("harbor: {e}");
            e.exit_code()
        }
    };
    Ok(ExitCode::from((code & 0xFF) as u8))
}

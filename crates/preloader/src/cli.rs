//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use preloader_service::caching::SystemMemory;
use preloader_service::config::Config;
use preloader_service::download::Loaders;
use preloader_service::metrics;
use preloader_service::preload::Preloader;

use crate::logging;
use crate::manifest;
use crate::output::{self, Report};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Outputs one row per resource.
    Table,
    /// Outputs the outcomes and cache statistics as JSON.
    Json,
}

/// Preloader commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Preload the resources listed in a manifest.
    Preload(PreloadArgs),

    /// Validate the configuration file and exit.
    CheckConfig,
}

#[derive(Debug, Args)]
struct PreloadArgs {
    /// A YAML or JSON list of resources with `key`, `priority` and `kind`.
    manifest: PathBuf,

    /// The output format.
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Keep the cache and its background tasks alive for this long after the batch,
    /// e.g. `90s` or `10m`.
    #[arg(long, value_parser = humantime::parse_duration)]
    hold: Option<Duration>,

    /// Exit with an error if any resource failed to load.
    #[arg(long)]
    strict: bool,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "preloader", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: Runs before `sentry::init` starts its transport thread, and before the runtime
    // exists. No other threads have been spawned yet.
    unsafe { logging::init_logging(&config) };

    // The tracing layer reports to the current hub, so events after this point reach sentry.
    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    metrics::configure_statsd(&config.metrics)?;

    match cli.command {
        Command::Preload(args) => preload(config, args).context("failed to preload resources"),
        Command::CheckConfig => {
            tracing::info!("Configuration is valid");
            Ok(())
        }
    }
}

fn preload(config: Config, args: PreloadArgs) -> Result<()> {
    let requests = manifest::read(&args.manifest)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("preloader-worker")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    let report = runtime.block_on(async {
        let loaders = Loaders::from_config(&config.loaders)?;
        let preloader = Preloader::new(&config, loaders)?;
        let tasks = preloader.start_background_tasks(Arc::new(SystemMemory::new()));

        let outcomes = preloader.preload_all(requests).await;
        if let Some(hold) = args.hold {
            tracing::info!("Holding the cache for {}", humantime::format_duration(hold));
            tokio::time::sleep(hold).await;
        }

        let report = Report::new(&outcomes, preloader.cache().stats());
        tasks.stop().await;
        preloader.shutdown();
        anyhow::Ok(report)
    })?;

    output::print(&report, args.format)?;

    let failures = report.failures();
    if args.strict && failures > 0 {
        bail!("{failures} resources failed to load");
    }
    Ok(())
}

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

use feedsink_converter::converter::Converter;
use feedsink_core::config::PipelineConfig;
use feedsink_core::tool::init_log;
use feedsink_ingestor::ingest::ingest;
use feedsink_loader::loader::Loader;
use feedsink_loader::mysql_store::MysqlStore;
use feedsink_loader::store::{MemoryStore, QueryStore};

#[derive(Parser, Debug)]
#[command(version, about = "Record market and social feeds, convert and load them.")]
struct Args {
    /// Pipeline config file.
    #[arg(long, default_value = "resources/pipeline.toml")]
    config: String,

    #[arg(long, env = "FEEDSINK_SOCIAL_TOKEN", hide_env_values = true)]
    social_token: Option<String>,

    #[arg(long, env = "FEEDSINK_SOCIAL_PASSWORD", hide_env_values = true)]
    social_password: Option<String>,

    #[arg(long, env = "FEEDSINK_STORE_URL", hide_env_values = true)]
    store_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Record both feeds into the raw layer.
    Ingest {
        /// Stop after this many seconds, run until interrupted without it.
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Convert closed raw partitions to columnar batches.
    Convert,

    /// Load converted batches into the query store.
    Load,

    /// Ingest, then convert and load what is closed.
    Run {
        #[arg(long)]
        duration_secs: Option<u64>,
    },
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::from_config_file(&self.config)?;

        if let Some(token) = &self.social_token {
            config.social_feed.token = Some(token.clone());
        }
        if let Some(password) = &self.social_password {
            config.social_feed.password = Some(password.clone());
        }
        if let Some(url) = &self.store_url {
            config.store.url = url.clone();
        }

        Ok(config)
    }
}

fn open_store(config: &PipelineConfig) -> Result<Arc<dyn QueryStore>> {
    if config.store.url.is_empty() {
        warn!("no store url configured, load into an in-memory store that is dropped on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }

    Ok(Arc::new(MysqlStore::connect(&config.store.url)?))
}

async fn run_command(
    command: Command,
    config: PipelineConfig,
    subsys: SubsystemHandle,
) -> Result<()> {
    let ct = subsys.create_cancellation_token();

    match command {
        Command::Ingest { duration_secs } => {
            ingest(&config, duration_secs.map(Duration::from_secs), ct).await?;
        }
        Command::Convert => {
            Converter::new(&config).convert_closed(Utc::now(), ct).await?;
        }
        Command::Load => {
            let loader = Loader::new(open_store(&config)?, &config);
            let batches = loader.completed_batches()?;
            loader.load_all(batches, ct).await?;
        }
        Command::Run { duration_secs } => {
            ingest(&config, duration_secs.map(Duration::from_secs), ct.clone()).await?;

            Converter::new(&config)
                .convert_closed(Utc::now(), ct.clone())
                .await?;

            let loader = Loader::new(open_store(&config)?, &config);
            let batches = loader.completed_batches()?;
            loader.load_all(batches, ct).await?;
        }
    }

    subsys.request_shutdown();

    Ok(())
}

async fn serve(args: Args) -> Result<()> {
    let config = args.pipeline_config()?;
    let command = args.command;

    info!("start feedsink, command: {:?}, config: {}", command, args.config);

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("pipeline", move |a| {
            run_command(command, config, a)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_millis(5000))
    .await?;

    info!("feedsink done");

    Ok(())
}

fn main() -> Result<()> {
    init_log();

    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve(args))?;

    Ok(())
}

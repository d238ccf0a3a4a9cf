use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use feedpipe::catalog::{CatalogStore, Channel, Episode};
use feedpipe::config::Config;
use feedpipe::pipeline::{Collaborators, Pipeline};
use feedpipe::server;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "feedpipe")]
#[command(about = "Podcast crawl, download and live recording pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// One-shot commands open the stores directly and must not run next to `run`
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run all workers, the produce scheduler, the reconciler and the ops server
    Run(RunArgs),
    /// Run a single producer pass; emitted jobs are picked up by the next `run`
    Produce,
    /// Run a single reconciliation sweep
    Reconcile,
    /// Register a channel by its feed URL
    ChannelAdd(ChannelAddArgs),
    /// Register a live episode to be recorded
    LiveAdd(LiveAddArgs),
    /// List dead-lettered queue entries
    DeadLetters(DeadLettersArgs),
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Override the ops server bind address
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct ChannelAddArgs {
    #[arg(long)]
    pub title: String,
    #[arg(long)]
    pub rss_url: String,
}

#[derive(clap::Args, Debug)]
pub struct LiveAddArgs {
    #[arg(long)]
    pub channel_id: String,
    #[arg(long)]
    pub title: String,
    #[arg(long)]
    pub stream_url: String,
    /// Announced stream start, RFC 3339
    #[arg(long)]
    pub start: DateTime<Utc>,
    /// Recording length; the configured maximum applies when omitted
    #[arg(long)]
    pub duration_secs: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct DeadLettersArgs {
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

impl Commands {
    pub async fn execute(self, mut config: Config) -> Result<(), AnyError> {
        if let Commands::Run(args) = &self {
            if let Some(address) = args.address {
                config.server.bind_addr = address;
            }
            return server::run(config).await;
        }

        let collaborators = Collaborators::from_config(&config)?;
        let shutdown = CancellationToken::new();
        let pipeline = Pipeline::open(config, collaborators, shutdown.clone())?;

        match self {
            Commands::Run(_) => {}
            Commands::Produce => {
                let report = pipeline.producer.produce_all().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Commands::Reconcile => {
                let report = pipeline.standalone_reconciler().run_once(Utc::now()).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Commands::ChannelAdd(args) => {
                let channel = Channel::new(args.title, args.rss_url);
                pipeline.catalog.upsert_channel(&channel).await?;
                println!("{}", channel.id);
            }
            Commands::LiveAdd(args) => {
                if pipeline.catalog.get_channel(&args.channel_id).await?.is_none() {
                    return Err(format!("channel {} not found", args.channel_id).into());
                }
                let episode = Episode::new_live(
                    args.channel_id,
                    args.title,
                    args.stream_url,
                    args.start,
                    args.duration_secs,
                );
                if !pipeline.catalog.insert_episode(&episode).await? {
                    return Err(format!("episode {} already exists", episode.slug).into());
                }
                println!("{}", episode.id);
            }
            Commands::DeadLetters(args) => {
                for dead in pipeline.queue.dead_letters(args.limit)? {
                    println!("{}", serde_json::to_string(&dead)?);
                }
            }
        }

        shutdown.cancel();
        pipeline.shutdown(Vec::new()).await?;
        Ok(())
    }
}

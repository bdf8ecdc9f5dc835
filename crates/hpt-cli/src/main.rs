use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hpt_mds::SourceSelection;
use hpt_sync::{SyncConfig, SyncPipeline};
use hpt_web::LookupConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hpt-cli")]
#[command(about = "HEAL progress tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull metadata, score every study and replace the tracker table
    Sync {
        /// Read a saved metadata payload instead of calling the service
        #[arg(long, env = "MDS_LOCAL_SNAPSHOT")]
        local: Option<PathBuf>,
        /// Metadata service URL
        #[arg(long, env = "MDS_URL", conflicts_with = "local")]
        url: Option<String>,
    },
    /// Score a saved payload and print each study's checklist gaps as JSON lines
    Score { snapshot: PathBuf },
    /// Serve the read-only lookup endpoint
    Serve {
        #[arg(long, env = "HPT_WEB_PORT")]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hpt=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        local: None,
        url: None,
    }) {
        Commands::Sync { local, url } => {
            let mut config = SyncConfig::from_env();
            if let Some(path) = local {
                config = config.with_source(SourceSelection::Local { path });
            } else if let Some(url) = url {
                config = config.with_source(SourceSelection::Remote { url });
            }
            let summary = SyncPipeline::new(config)?.run_once().await?;
            info!(
                run_id = %summary.run_id,
                studies = summary.studies,
                columns = summary.columns,
                "sync complete"
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing run summary")?
            );
        }
        Commands::Score { snapshot } => {
            let raw = tokio::fs::read(&snapshot)
                .await
                .with_context(|| format!("reading {}", snapshot.display()))?;
            let batch = hpt_mds::parse_batch(&raw)?;
            let mut records = hpt_mds::flatten_batch(&batch);
            for card in hpt_checklist::score_batch(&mut records) {
                println!("{}", serde_json::to_string(&card)?);
            }
        }
        Commands::Serve { port } => {
            let mut config = LookupConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            hpt_web::serve(config).await?;
        }
    }

    Ok(())
}

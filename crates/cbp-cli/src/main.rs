use std::sync::Arc;

use anyhow::{Context, Result};
use cbp_sync::{PurchaseIndex, SyncConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cbp-cli")]
#[command(about = "Customer bought product index command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or upgrade the purchase, staging, queue and state tables.
    Migrate,
    /// Run a full sync in the foreground.
    Sync,
    /// Serve HTTP with the background worker, health check and resync schedule active.
    Worker,
    /// Serve HTTP only.
    Serve,
    /// Answer a single purchase lookup.
    Lookup {
        #[arg(long)]
        product_id: i64,
        #[arg(long, default_value_t = 0)]
        user_id: i64,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// Drop purchases that reference a deleted product, variation or order.
    Remove { id: i64 },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn connect() -> Result<PurchaseIndex> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    PurchaseIndex::connect(config).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Migrate => {
            connect().await?.ensure_schema().await?;
            println!("schema ready");
        }
        Commands::Sync => {
            let summary = cbp_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} batches={} extracted={} merged={} final_offset={}",
                summary.run_id, summary.batches, summary.extracted, summary.merged, summary.final_offset
            );
        }
        Commands::Worker => {
            let index = Arc::new(connect().await?);
            index.ensure_schema().await?;
            let scheduler = index.maybe_build_scheduler().await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting resync scheduler")?;
                info!("resync scheduler started");
            }
            let outcome = index.health_check().await?;
            info!(?outcome, "startup health check");
            let port = index.config().web_port;
            cbp_web::serve(index, port).await?;
        }
        Commands::Serve => {
            cbp_web::serve_from_env().await?;
        }
        Commands::Lookup {
            product_id,
            user_id,
            email,
        } => {
            let bought = connect()
                .await?
                .has_purchased(product_id, user_id, &email)
                .await?;
            println!("{bought}");
        }
        Commands::Remove { id } => {
            let removed = connect().await?.remove_entries_for_source_id(id).await?;
            println!("removed {removed} purchase rows referencing {id}");
        }
    }

    Ok(())
}

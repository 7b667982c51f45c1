use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use konf_storage::{HttpIdentity, HttpSheetFetcher, PgStore, SheetKey, SyncStore};
use konf_sync::{SyncConfig, SyncPipeline};
use konf_web::AppState;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "konf")]
#[command(about = "Konf event platform command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Sync one event's datasets from its spreadsheet.
    Sync {
        #[arg(long)]
        event_id: Uuid,
        /// Share URL of the spreadsheet; defaults to the URL stored on the event.
        #[arg(long)]
        sheets_url: Option<String>,
    },
    /// Run the web server.
    Serve {
        /// Port to listen on; defaults to KONF_WEB_PORT or 8000.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Sync {
            event_id,
            sheets_url,
        } => {
            let store = Arc::new(PgStore::connect(&config.database_url).await?);
            let sheets = Arc::new(HttpSheetFetcher::new(config.fetch_config())?);

            let event = store
                .event_by_id(event_id)
                .await?
                .with_context(|| format!("no event with id {event_id}"))?;
            let url = sheets_url
                .or_else(|| event.sheets_url.clone())
                .context("event has no stored sheets url; pass --sheets-url")?;
            let key = SheetKey::from_share_url(&url)
                .context("sheets url is not a Google Sheets share link")?;

            let pipeline = SyncPipeline::new(store, sheets, config.max_sheet_rows);
            let report = pipeline.sync_event(event.id, &key).await;

            println!(
                "sync complete: event={} program={} participants={} exhibitors={}",
                event.slug,
                report.program.count,
                report.participants.count,
                report.exhibitors.count
            );
            for (entity, entity_report) in [
                ("program", &report.program),
                ("participants", &report.participants),
                ("exhibitors", &report.exhibitors),
            ] {
                for error in &entity_report.errors {
                    eprintln!("{entity}: {error}");
                }
            }
        }
        Commands::Serve { port } => {
            let port = port
                .or_else(|| {
                    std::env::var("KONF_WEB_PORT")
                        .ok()
                        .and_then(|v| v.parse().ok())
                })
                .unwrap_or(8000);

            let store = Arc::new(PgStore::connect(&config.database_url).await?);
            let sheets = Arc::new(HttpSheetFetcher::new(config.fetch_config())?);
            let identity = Arc::new(HttpIdentity::new(
                config.auth_user_url.clone(),
                Duration::from_secs(config.fetch_timeout_secs),
            )?);
            let pipeline = Arc::new(SyncPipeline::new(
                store.clone(),
                sheets,
                config.max_sheet_rows,
            ));

            let state = AppState {
                store,
                identity,
                pipeline,
            };
            konf_web::serve(state, port).await?;
        }
    }

    Ok(())
}

use anyhow::{bail, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;

use rednote_sync::config;
use rednote_sync::db::{self, ledger};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Query sync state: one record, records needing attention, or per-stage counts"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Source item id to show
    item_id: Option<String>,

    /// List records that are FAILED or have a FAILED destination
    #[arg(long, conflicts_with = "item_id")]
    attention: bool,

    /// Print the number of records in each stage
    #[arg(long, conflicts_with_all = ["item_id", "attention"])]
    summary: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let output = if let Some(item_id) = &args.item_id {
        let Some(record) = db::get_record(&pool, item_id).await? else {
            bail!("no sync record for item {}", item_id);
        };
        let entries = ledger::entries_for_item(&pool, item_id).await?;
        json!({ "record": record, "ledger": entries })
    } else if args.attention {
        let records = db::records_needing_attention(&pool).await?;
        json!({ "count": records.len(), "records": records })
    } else if args.summary {
        json!({ "stages": db::count_by_stage(&pool).await? })
    } else {
        bail!("pass an item id, --attention or --summary");
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

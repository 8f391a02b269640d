use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use csv::WriterBuilder;
use dialoguer::Confirm;
use tracing::info;

use metawin_analysis::{
    env::EnvConfig,
    load_weekly_activity, log,
    metawin::ENTRY_SOLD_EVENT,
    metrics::{self, average_fee_per_transaction},
    snapshot,
    time_windows::{self, TimeWindow},
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the dataset, from the cache file when present, and print its row count.
    Fetch,
    /// Delete the cache file and fetch the dataset again.
    Refresh {
        /// Skip the confirmation prompt.
        #[clap(long)]
        yes: bool,
    },
    /// Print transaction and gas fee totals for a time window.
    Summary {
        /// Time window key, one of d7, d30, d90, d365, ytd, all.
        #[clap(long, default_value = "all")]
        time_window: TimeWindow,
    },
    /// Write the rows of a time window with derived fee columns to CSV.
    Export {
        /// Time window key, one of d7, d30, d90, d365, ytd, all.
        #[clap(long, default_value = "all")]
        time_window: TimeWindow,
        /// Output file path (e.g., ./output.csv).
        #[clap(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = log::init_from_env()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch => {
            let dataset = load_weekly_activity(&config).await?;
            println!("{} rows", dataset.len());
        }
        Commands::Refresh { yes } => {
            refresh(&config, yes).await?;
        }
        Commands::Summary { time_window } => {
            summary(&config, time_window).await?;
        }
        Commands::Export {
            time_window,
            output,
        } => {
            export(&config, time_window, &output).await?;
        }
    }

    Ok(())
}

async fn refresh(config: &EnvConfig, yes: bool) -> anyhow::Result<()> {
    let confirmed = yes
        || Confirm::new()
            .with_prompt(format!(
                "delete {} and fetch the dataset again?",
                config.cache_path.display()
            ))
            .default(false)
            .interact()?;

    if !confirmed {
        info!("refresh cancelled");
        return Ok(());
    }

    let deleted = snapshot::delete_snapshot(&config.cache_path)?;
    info!(path = %config.cache_path.display(), deleted, "cleared cache file");

    let dataset = load_weekly_activity(config).await?;
    println!("{} rows", dataset.len());

    Ok(())
}

async fn summary(config: &EnvConfig, time_window: TimeWindow) -> anyhow::Result<()> {
    let dataset = load_weekly_activity(config).await?;
    let rows = time_windows::filter(&dataset, time_window, Utc::now().date_naive());

    let totals = metrics::totals(&rows);
    println!("{time_window}");
    println!("  total transactions: {}", totals.total_transaction_count);
    println!("  total eth gas fees: {:.6}", totals.total_eth_gas_fee);

    for (event_name, count) in metrics::transactions_by_event(&rows) {
        println!("  {event_name}: {count}");
    }

    Ok(())
}

async fn export(config: &EnvConfig, time_window: TimeWindow, output: &Path) -> anyhow::Result<()> {
    let dataset = load_weekly_activity(config).await?;
    let rows = time_windows::filter(&dataset, time_window, Utc::now().date_naive());
    let group_means = metrics::date_group_means(&rows, ENTRY_SOLD_EVENT);

    let mut writer = csv_writer(output)?;

    writer.write_record([
        "tx_dt",
        "contract_address",
        "event_name",
        "tot_txs_count",
        "weekly_eth_fee",
        "weekly_avg_eth_gas_fee_paid_by_smart_contract",
        "ma_eth_gas_fee",
    ])?;

    // Group means exist for entry sales only, in the same order as the filtered rows.
    let mut group_means = group_means.into_iter();
    for row in &rows {
        let ma_eth_gas_fee = if row.event_name == ENTRY_SOLD_EVENT {
            group_means.next().and_then(|mean| mean.ma_eth_gas_fee)
        } else {
            None
        };

        writer.write_record([
            row.tx_dt.format("%Y-%m-%d").to_string(),
            row.contract_address.clone(),
            row.event_name.clone(),
            row.tot_txs_count.to_string(),
            row.weekly_eth_fee.to_string(),
            average_fee_per_transaction(row)
                .map(|v| v.to_string())
                .unwrap_or_default(),
            ma_eth_gas_fee.map(|v| v.to_string()).unwrap_or_default(),
        ])?;
    }

    writer.flush()?;
    info!(output = %output.display(), rows = rows.len(), %time_window, "export completed");

    Ok(())
}

fn csv_writer(path: &Path) -> anyhow::Result<csv::Writer<std::fs::File>> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    Ok(WriterBuilder::new().has_headers(true).from_writer(file))
}

mod base;
mod fifo;
mod gains;
mod ledger;
mod robinhood;
mod time;

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Result;
use base::Transaction;
use chrono::{Datelike, Local, NaiveDate};
use clap::Parser;
use fifo::{NoCorrections, Processor, SplitPolicy, SplitRatioResolver};
use ledger::{Ledger, Lot};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "capgains", version)]
#[command(about = "Estimate realized capital gains from Robinhood transaction history")]
struct Cli {
    /// Robinhood transaction CSV file or directory of CSV files
    #[arg(required = true)]
    transaction_file: Vec<PathBuf>,

    /// Tax year to total gains for (defaults to the current year)
    #[arg(long)]
    year: Option<i32>,

    /// Decimal places a split ratio may carry before a corrected ratio is
    /// requested
    #[arg(long, default_value_t = 1)]
    split_ratio_scale: u32,

    /// Fail on suspect split ratios instead of prompting for a correction
    #[arg(long)]
    no_prompt: bool,

    /// Output path for the per-instrument gains report
    #[arg(long, default_value = "out_gains.csv")]
    gains_file: PathBuf,

    /// Output path for the adjusted lot chains
    #[arg(long, default_value = "out_lots.csv")]
    lots_file: PathBuf,

    /// Also dump the lot chains as JSON
    #[arg(long)]
    lots_json: Option<PathBuf>,

    /// Also dump the normalized transactions as JSON (editable, can be fed
    /// back in place of the CSV exports)
    #[arg(long)]
    transactions_json: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Asks on stdin for a corrected split ratio.
struct PromptResolver;

impl SplitRatioResolver for PromptResolver {
    fn corrected_ratio(&mut self, instrument: &str, date: NaiveDate, suspect: Decimal) -> Option<Decimal> {
        warn!(
            "{} split on {} has a calculated ratio of {} which seems wrong. Please enter the value you'd like to use:",
            instrument, date, suspect
        );
        print!("> ");
        io::stdout().flush().ok()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line).ok()?;
        Decimal::from_str(line.trim()).ok()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut transactions = Vec::new();
    for path in &cli.transaction_file {
        if path.exists() {
            transactions.extend(robinhood::import_path(path)?);
        } else {
            warn!("Invalid file or directory: {}", path.display());
        }
    }

    if let Some(path) = &cli.transactions_json {
        info!("Writing {}", path.display());
        base::save_transactions_to_json(&transactions, path)?;
    }

    let policy = SplitPolicy {
        max_ratio_scale: cli.split_ratio_scale,
    };
    let ledger = if cli.no_prompt {
        process_transactions(&transactions, policy, NoCorrections)?
    } else {
        process_transactions(&transactions, policy, PromptResolver)?
    };

    let year = cli.year.unwrap_or_else(|| Local::now().year());
    let report = gains::realized_gains(&ledger, year);
    info!("Writing {} (tax year {})", cli.gains_file.display(), report.year);
    gains::save_gains_to_csv(&report, &cli.gains_file)?;

    info!("Writing {}", cli.lots_file.display());
    save_lots_to_csv(&ledger, &cli.lots_file)?;

    if let Some(path) = &cli.lots_json {
        info!("Writing {}", path.display());
        save_lots_to_json(&ledger, path)?;
    }

    Ok(())
}

fn process_transactions(
    transactions: &[Transaction],
    policy: SplitPolicy,
    resolver: impl SplitRatioResolver,
) -> Result<Ledger> {
    let mut processor = Processor::new(policy, resolver);
    processor.process(transactions)?;
    info!(
        "Processed {} transactions across {} instruments",
        transactions.len(),
        processor.ledger().instruments().len()
    );
    Ok(processor.into_ledger())
}

/// Dumps every lot chain, adjusted for sells and splits, oldest lot first.
fn save_lots_to_csv(ledger: &Ledger, output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    #[derive(Serialize)]
    struct CsvLot<'a> {
        #[serde(rename = "Instrument")]
        instrument: &'a str,
        #[serde(rename = "Purchase Date")]
        purchase_date: NaiveDate,
        #[serde(rename = "Purchase Price")]
        purchase_price: Decimal,
        #[serde(rename = "Quantity")]
        quantity: Decimal,
        #[serde(rename = "Sell Date")]
        sell_date: Option<NaiveDate>,
        #[serde(rename = "Sell Price")]
        sell_price: Option<Decimal>,
    }

    for instrument in ledger.instruments() {
        for lot in ledger.lots_oldest_first(instrument) {
            wtr.serialize(CsvLot {
                instrument: &lot.instrument,
                purchase_date: lot.purchase_date,
                purchase_price: lot.purchase_price,
                quantity: lot.quantity,
                sell_date: lot.disposal.map(|d| d.date),
                sell_price: lot.disposal.map(|d| d.price),
            })?;
        }
    }

    Ok(())
}

fn save_lots_to_json(ledger: &Ledger, output_path: &Path) -> Result<()> {
    let chains: BTreeMap<&str, Vec<&Lot>> = ledger
        .instruments()
        .into_iter()
        .map(|instrument| (instrument, ledger.lots_oldest_first(instrument).collect()))
        .collect();
    let json = serde_json::to_string_pretty(&chains)?;
    std::fs::write(output_path, json)?;
    Ok(())
}

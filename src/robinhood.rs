use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use strum::EnumString;
use tracing::{debug, info, warn};

use crate::base::{AcquisitionCode, SplitTerms, Transaction};
use crate::time;

/// Activity codes that affect lot tracking. Everything else in an export
/// (dividends, cash transfers, fees, interest) is surfaced at debug level
/// and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
enum TransCode {
    Buy,
    Sell,
    #[strum(serialize = "CONV")]
    Conversion,
    #[strum(serialize = "SXCH")]
    Exchange,
    #[strum(serialize = "MRGS")]
    Merger,
    #[strum(serialize = "SPL")]
    Split,
}

/// Raw row of a Robinhood activity export. Every field stays unparsed:
/// non-trade rows leave quantity and price empty or annotated ('S' suffix on
/// SXCH quantities, '$' and thousands separators on prices), and rows we
/// skip should not be able to fail the import.
#[derive(Debug, Deserialize)]
struct ActivityRow {
    #[serde(rename = "Activity Date")]
    activity_date: String,
    #[serde(rename = "Instrument")]
    instrument: String,
    #[serde(rename = "Trans Code")]
    trans_code: String,
    #[serde(rename = "Quantity")]
    quantity: String,
    #[serde(rename = "Price")]
    price: String,
}

fn parse_quantity(raw: &str) -> Result<Decimal> {
    // SXCH rows annotate the share count with a trailing 'S'
    let cleaned = raw.trim().trim_end_matches('S');
    Decimal::from_str(cleaned).with_context(|| format!("invalid quantity {:?}", raw))
}

fn parse_price(raw: &str) -> Result<Option<Decimal>> {
    let cleaned = raw.trim().trim_start_matches('$').replace(',', "");
    if cleaned.is_empty() {
        return Ok(None);
    }
    Decimal::from_str(&cleaned)
        .map(Some)
        .with_context(|| format!("invalid price {:?}", raw))
}

/// Converts one export row into a normalized transaction. Rows without an
/// instrument and rows whose code does not touch lots map to `None`.
fn transaction_from_row(row: &ActivityRow) -> Result<Option<Transaction>> {
    let instrument = row.instrument.trim();
    if instrument.is_empty() {
        return Ok(None);
    }
    let Ok(code) = TransCode::from_str(row.trans_code.trim()) else {
        debug!("Ignoring {} {} row", instrument, row.trans_code);
        return Ok(None);
    };

    let describe = || format!("{} {} row on {}", instrument, row.trans_code, row.activity_date);
    let date = time::parse_date(&row.activity_date).with_context(describe)?;
    let quantity = parse_quantity(&row.quantity).with_context(describe)?;
    let tx = match code {
        TransCode::Buy => {
            let price = parse_price(&row.price)?
                .with_context(|| format!("{} has no price", describe()))?;
            Transaction::buy(date, instrument, quantity, price)
        }
        TransCode::Sell => {
            let price = parse_price(&row.price)?
                .with_context(|| format!("{} has no price", describe()))?;
            Transaction::sell(date, instrument, quantity, price)
        }
        TransCode::Conversion => Transaction::zero_basis(date, instrument, quantity, AcquisitionCode::Conversion),
        TransCode::Exchange => Transaction::zero_basis(date, instrument, quantity, AcquisitionCode::Exchange),
        TransCode::Merger => Transaction::zero_basis(date, instrument, quantity, AcquisitionCode::Merger),
        // SPL rows report the number of new shares credited by the split.
        TransCode::Split => Transaction::split(date, instrument, SplitTerms::SharesReceived(quantity)),
    };

    Ok(Some(tx))
}

/// Returns `None` when the file does not look like a Robinhood activity
/// export (missing header row, not a CSV at all). Stray files are expected
/// next to the real ones and get skipped with a warning.
fn read_activity_rows(path: &Path) -> Option<Vec<ActivityRow>> {
    let raw = fs::read_to_string(path).ok()?;
    let mut rdr = csv::ReaderBuilder::new().from_reader(raw.trim_start_matches('\u{feff}').as_bytes());
    if !rdr.headers().ok()?.iter().any(|header| header == "Activity Date") {
        return None;
    }
    rdr.deserialize().collect::<Result<Vec<_>, _>>().ok()
}

/// Loads a Robinhood activity CSV into normalized transactions. Export rows
/// are listed newest first; the result is oldest first.
pub(crate) fn import_file(path: &Path) -> Result<Vec<Transaction>> {
    info!("Importing {}", path.display());
    let Some(rows) = read_activity_rows(path) else {
        warn!("Failed to parse file: {}", path.display());
        return Ok(Vec::new());
    };

    let mut transactions = Vec::new();
    for row in rows.iter().rev() {
        if let Some(tx) = transaction_from_row(row)? {
            transactions.push(tx);
        }
    }
    Ok(transactions)
}

/// Imports every `.csv` file of a directory, in filename order.
pub(crate) fn import_directory(dir: &Path) -> Result<Vec<Transaction>> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
        })
        .collect();
    paths.sort();

    let mut transactions = Vec::new();
    for path in &paths {
        transactions.extend(import_file(path)?);
    }
    Ok(transactions)
}

pub(crate) fn import_path(path: &Path) -> Result<Vec<Transaction>> {
    if path.is_dir() {
        import_directory(path)
    } else if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
        crate::base::load_transactions_from_json(path)
            .with_context(|| format!("loading transactions from {}", path.display()))
    } else {
        import_file(path)
    }
}

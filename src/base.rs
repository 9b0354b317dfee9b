use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub(crate) enum ProcessError {
    #[error("malformed {instrument} transaction on {date}: {detail}")]
    MalformedTransaction {
        instrument: String,
        date: NaiveDate,
        detail: String,
    },
    #[error("disposal of {requested} {instrument} on {date} exceeds the {available} held in open lots")]
    InsufficientLots {
        instrument: String,
        date: NaiveDate,
        requested: Decimal,
        available: Decimal,
    },
    #[error("{instrument} split on {date} has the suspect ratio {ratio} and no corrected ratio was supplied")]
    AmbiguousSplitRatio {
        instrument: String,
        date: NaiveDate,
        ratio: Decimal,
    },
}

/// Transaction codes that create shares without carrying usable cost basis
/// data. Lots they create are given a purchase price of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub(crate) enum AcquisitionCode {
    #[strum(serialize = "CONV")]
    Conversion,
    #[strum(serialize = "SXCH")]
    Exchange,
    #[strum(serialize = "MRGS")]
    Merger,
}

/// Terms of a forward stock split. Brokerage exports usually report only the
/// number of new shares credited, in which case the ratio is derived from the
/// open quantity at the time the split is applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) enum SplitTerms {
    /// New shares per old share.
    Ratio(Decimal),
    /// Shares credited on top of the existing position.
    SharesReceived(Decimal),
}

/// Unified transaction type for all sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum Operation {
    Buy {
        quantity: Decimal,
        price: Decimal,
    },
    /// Buy-like event without reliable cost basis (conversions, share
    /// exchanges, mergers). Basis is assumed to be zero.
    ZeroBasisAcquisition {
        quantity: Decimal,
        code: AcquisitionCode,
    },
    Sell {
        quantity: Decimal,
        price: Decimal,
    },
    Split {
        terms: SplitTerms,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Transaction {
    pub date: NaiveDate,
    pub instrument: String,
    pub operation: Operation,
}

impl Transaction {
    pub(crate) fn new(date: NaiveDate, instrument: impl Into<String>, operation: Operation) -> Self {
        Self {
            date,
            instrument: instrument.into(),
            operation,
        }
    }

    pub(crate) fn buy(date: NaiveDate, instrument: impl Into<String>, quantity: Decimal, price: Decimal) -> Self {
        Self::new(date, instrument, Operation::Buy { quantity, price })
    }

    pub(crate) fn sell(date: NaiveDate, instrument: impl Into<String>, quantity: Decimal, price: Decimal) -> Self {
        Self::new(date, instrument, Operation::Sell { quantity, price })
    }

    pub(crate) fn zero_basis(
        date: NaiveDate,
        instrument: impl Into<String>,
        quantity: Decimal,
        code: AcquisitionCode,
    ) -> Self {
        Self::new(date, instrument, Operation::ZeroBasisAcquisition { quantity, code })
    }

    pub(crate) fn split(date: NaiveDate, instrument: impl Into<String>, terms: SplitTerms) -> Self {
        Self::new(date, instrument, Operation::Split { terms })
    }
}

pub(crate) fn save_transactions_to_json(transactions: &[Transaction], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(transactions)?;
    std::fs::write(output_path, json)?;
    Ok(())
}

pub(crate) fn load_transactions_from_json(input_path: &Path) -> Result<Vec<Transaction>> {
    let json = std::fs::read_to_string(input_path)?;
    let transactions: Vec<Transaction> = serde_json::from_str(&json)?;
    Ok(transactions)
}

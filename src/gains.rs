use std::path::Path;

use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::ledger::Ledger;

/// Realized gain subtotals for one instrument in the report year, at full
/// precision.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InstrumentGains {
    pub instrument: String,
    pub short_term: Decimal,
    pub long_term: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GainReport {
    pub year: i32,
    pub instruments: Vec<InstrumentGains>,
    /// Totals are sums of the per-instrument subtotals rounded to cents.
    pub short_term_total: Decimal,
    pub long_term_total: Decimal,
}

fn long_term(purchased: NaiveDate, sold: NaiveDate) -> bool {
    sold - purchased > Duration::days(365)
}

fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Totals short- and long-term realized gains for the given year.
///
/// Walks each chain from the head (newest lot) backward, past any open lots
/// representing current holdings, and accumulates every lot sold in the
/// target year. Sells are applied in chronological order, so sell dates are
/// non-increasing along the backward walk; the first lot sold before the
/// year starts ends the walk.
pub(crate) fn realized_gains(ledger: &Ledger, year: i32) -> GainReport {
    let mut report = GainReport {
        year,
        instruments: Vec::new(),
        short_term_total: Decimal::ZERO,
        long_term_total: Decimal::ZERO,
    };
    let Some(start_of_year) = NaiveDate::from_ymd_opt(year, 1, 1) else {
        return report;
    };

    for instrument in ledger.instruments() {
        let mut short_term = Decimal::ZERO;
        let mut long_term_gains = Decimal::ZERO;
        for lot in ledger.lots_newest_first(instrument) {
            let Some(disposal) = lot.disposal else {
                continue;
            };
            if disposal.date < start_of_year {
                break;
            }
            if disposal.date.year() != year {
                continue;
            }
            let gain = (disposal.price - lot.purchase_price) * lot.quantity;
            if long_term(lot.purchase_date, disposal.date) {
                long_term_gains += gain;
            } else {
                short_term += gain;
            }
        }
        report.short_term_total += round_cents(short_term);
        report.long_term_total += round_cents(long_term_gains);
        if !short_term.is_zero() || !long_term_gains.is_zero() {
            report.instruments.push(InstrumentGains {
                instrument: instrument.to_owned(),
                short_term,
                long_term: long_term_gains,
            });
        }
    }

    report
}

/// Formats a dollar amount to cents. Amounts under half a cent render blank.
pub(crate) fn format_usd(amount: Decimal) -> String {
    if amount.abs() < Decimal::new(5, 3) {
        String::new()
    } else {
        format!("{:.2}", round_cents(amount))
    }
}

pub(crate) fn save_gains_to_csv(report: &GainReport, output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    #[derive(Serialize)]
    struct CsvGains<'a> {
        #[serde(rename = "Instrument")]
        instrument: &'a str,
        #[serde(rename = "Long-Term Gains")]
        long_term: String,
        #[serde(rename = "Short-Term Gains")]
        short_term: String,
    }

    for entry in &report.instruments {
        wtr.serialize(CsvGains {
            instrument: &entry.instrument,
            long_term: format_usd(entry.long_term),
            short_term: format_usd(entry.short_term),
        })?;
    }
    wtr.serialize(CsvGains {
        instrument: "Total",
        long_term: format_usd(report.long_term_total),
        short_term: format_usd(report.short_term_total),
    })?;

    Ok(())
}

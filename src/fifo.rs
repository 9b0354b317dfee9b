use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::base::{Operation, ProcessError, SplitTerms, Transaction};
use crate::ledger::{Disposal, Ledger};

/// Supplies a corrected split ratio when the reported one looks like a
/// casualty of truncated broker data. Returning `None` leaves the ambiguity
/// unresolved and processing fails with `AmbiguousSplitRatio`.
pub(crate) trait SplitRatioResolver {
    fn corrected_ratio(&mut self, instrument: &str, date: NaiveDate, suspect: Decimal) -> Option<Decimal>;
}

/// Resolver that never supplies a correction.
pub(crate) struct NoCorrections;

impl SplitRatioResolver for NoCorrections {
    fn corrected_ratio(&mut self, _instrument: &str, _date: NaiveDate, _suspect: Decimal) -> Option<Decimal> {
        None
    }
}

/// Robinhood truncates SPL share counts to four decimal places, so a derived
/// ratio with a long fraction usually means the reported value is wrong.
/// Ratios with more decimal places than `max_ratio_scale` are escalated to
/// the resolver.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SplitPolicy {
    pub max_ratio_scale: u32,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self { max_ratio_scale: 1 }
    }
}

/// Applies normalized transactions to a lot ledger, one at a time, in the
/// chronological order supplied by the caller. Sells consume open lots
/// oldest-first.
pub(crate) struct Processor<R> {
    ledger: Ledger,
    policy: SplitPolicy,
    resolver: R,
}

impl<R: SplitRatioResolver> Processor<R> {
    pub(crate) fn new(policy: SplitPolicy, resolver: R) -> Self {
        Self {
            ledger: Ledger::new(),
            policy,
            resolver,
        }
    }

    pub(crate) fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub(crate) fn into_ledger(self) -> Ledger {
        self.ledger
    }

    pub(crate) fn process(&mut self, transactions: &[Transaction]) -> Result<(), ProcessError> {
        for transaction in transactions {
            self.apply(transaction)?;
        }
        Ok(())
    }

    pub(crate) fn apply(&mut self, tx: &Transaction) -> Result<(), ProcessError> {
        match &tx.operation {
            Operation::Buy { quantity, price } => {
                ensure_positive_quantity(tx, *quantity)?;
                debug!("Processing {} {} buy of {} at {}", tx.date, tx.instrument, quantity, price);
                self.ledger.append_lot(&tx.instrument, tx.date, *price, *quantity);
            }
            Operation::ZeroBasisAcquisition { quantity, code } => {
                ensure_positive_quantity(tx, *quantity)?;
                debug!(
                    "Processing {} {} {} of {}, assuming zero cost basis",
                    tx.date, tx.instrument, code, quantity
                );
                self.ledger.append_lot(&tx.instrument, tx.date, Decimal::ZERO, *quantity);
            }
            Operation::Sell { quantity, price } => {
                ensure_positive_quantity(tx, *quantity)?;
                debug!("Processing {} {} sell of {} at {}", tx.date, tx.instrument, quantity, price);
                self.sell(tx, *quantity, *price)?;
            }
            Operation::Split { terms } => {
                debug!("Processing {} {} split", tx.date, tx.instrument);
                self.split(tx, *terms)?;
            }
        }
        debug!(
            "Current quantity of {}: {}",
            tx.instrument,
            self.ledger.current_quantity(&tx.instrument)
        );
        Ok(())
    }

    /// Consumes `quantity` shares from the instrument's chain, oldest open
    /// lot first. A lot larger than the remaining sell amount is split into
    /// a closed portion and an open remainder.
    fn sell(&mut self, tx: &Transaction, quantity: Decimal, price: Decimal) -> Result<(), ProcessError> {
        let available = self.ledger.current_quantity(&tx.instrument);
        if available < quantity {
            return Err(ProcessError::InsufficientLots {
                instrument: tx.instrument.clone(),
                date: tx.date,
                requested: quantity,
                available,
            });
        }

        let disposal = Disposal {
            date: tx.date,
            price,
        };
        let mut remaining = quantity;
        let mut cursor = self.ledger.chain(&tx.instrument).map(|chain| chain.root);
        while remaining > Decimal::ZERO {
            let Some(id) = cursor else {
                // The chain ran out even though `open_quantity` covered the
                // sell; the bookkeeping has drifted from the chain contents.
                return Err(ProcessError::InsufficientLots {
                    instrument: tx.instrument.clone(),
                    date: tx.date,
                    requested: remaining,
                    available: Decimal::ZERO,
                });
            };
            let lot = self.ledger.lot(id);
            let (open, lot_quantity, next) = (lot.is_open(), lot.quantity, lot.next());
            if !open {
                cursor = next;
            } else if lot_quantity <= remaining {
                self.ledger.close(id, disposal);
                remaining -= lot_quantity;
                cursor = next;
            } else {
                self.ledger.split_close(id, remaining, disposal);
                remaining = Decimal::ZERO;
            }
        }
        Ok(())
    }

    fn split(&mut self, tx: &Transaction, terms: SplitTerms) -> Result<(), ProcessError> {
        let held = self.ledger.current_quantity(&tx.instrument);
        if held <= Decimal::ZERO {
            return Err(ProcessError::InsufficientLots {
                instrument: tx.instrument.clone(),
                date: tx.date,
                requested: match terms {
                    SplitTerms::SharesReceived(received) => received,
                    SplitTerms::Ratio(_) => Decimal::ZERO,
                },
                available: held,
            });
        }

        let reported = match terms {
            SplitTerms::Ratio(ratio) => ratio,
            SplitTerms::SharesReceived(received) => {
                if received <= Decimal::ZERO {
                    return Err(malformed(tx, format!("split credited {} shares", received)));
                }
                let ratio = (held + received) / held;
                debug!(
                    "Performing {} split: current holdings of {} increased by {} gives ratio {}",
                    tx.instrument, held, received, ratio
                );
                ratio
            }
        };
        ensure_forward_ratio(tx, reported)?;

        let ratio = if reported.normalize().scale() > self.policy.max_ratio_scale {
            let corrected = self
                .resolver
                .corrected_ratio(&tx.instrument, tx.date, reported)
                .ok_or_else(|| ProcessError::AmbiguousSplitRatio {
                    instrument: tx.instrument.clone(),
                    date: tx.date,
                    ratio: reported,
                })?;
            ensure_forward_ratio(tx, corrected)?;
            info!(
                "Using split ratio of {} for {} split on {}",
                corrected, tx.instrument, tx.date
            );
            corrected
        } else {
            reported
        };

        self.ledger.rescale_open(&tx.instrument, ratio);
        Ok(())
    }
}

fn ensure_positive_quantity(tx: &Transaction, quantity: Decimal) -> Result<(), ProcessError> {
    if quantity <= Decimal::ZERO {
        return Err(malformed(tx, format!("non-positive quantity {}", quantity)));
    }
    Ok(())
}

fn ensure_forward_ratio(tx: &Transaction, ratio: Decimal) -> Result<(), ProcessError> {
    if ratio <= Decimal::ONE {
        return Err(malformed(
            tx,
            format!("split ratio {} is not a forward split (reverse splits are unsupported)", ratio),
        ));
    }
    Ok(())
}

fn malformed(tx: &Transaction, detail: String) -> ProcessError {
    ProcessError::MalformedTransaction {
        instrument: tx.instrument.clone(),
        date: tx.date,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::AcquisitionCode;
    use crate::ledger::Lot;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn processor() -> Processor<NoCorrections> {
        Processor::new(SplitPolicy::default(), NoCorrections)
    }

    /// Resolver that always answers with a fixed ratio.
    struct Fixed(Decimal);

    impl SplitRatioResolver for Fixed {
        fn corrected_ratio(&mut self, _: &str, _: NaiveDate, _: Decimal) -> Option<Decimal> {
            Some(self.0)
        }
    }

    fn lots(processor: &Processor<impl SplitRatioResolver>, instrument: &str) -> Vec<Lot> {
        processor.ledger().lots_oldest_first(instrument).cloned().collect()
    }

    #[test]
    fn full_sell_closes_the_lot() {
        let mut p = processor();
        p.process(&[
            Transaction::buy(date(2023, 1, 1), "AAPL", dec!(10), dec!(100)),
            Transaction::sell(date(2023, 6, 1), "AAPL", dec!(10), dec!(150)),
        ])
        .unwrap();

        let lots = lots(&p, "AAPL");
        assert_eq!(lots.len(), 1);
        assert_eq!(
            lots[0].disposal,
            Some(Disposal {
                date: date(2023, 6, 1),
                price: dec!(150),
            })
        );
        assert_eq!(lots[0].quantity, dec!(10));
        assert_eq!(p.ledger().current_quantity("AAPL"), Decimal::ZERO);
    }

    #[test]
    fn partial_sell_splits_the_lot() {
        let mut p = processor();
        p.process(&[
            Transaction::buy(date(2022, 1, 1), "AAPL", dec!(10), dec!(100)),
            Transaction::sell(date(2023, 6, 1), "AAPL", dec!(4), dec!(150)),
        ])
        .unwrap();

        let lots = lots(&p, "AAPL");
        assert_eq!(lots.len(), 2);
        assert_eq!(lots[0].quantity, dec!(4));
        assert!(!lots[0].is_open());
        assert_eq!(lots[1].quantity, dec!(6));
        assert!(lots[1].is_open());
        // Both halves keep the original basis.
        assert_eq!(lots[0].purchase_date, date(2022, 1, 1));
        assert_eq!(lots[0].purchase_price, dec!(100));
        assert_eq!(lots[1].purchase_date, date(2022, 1, 1));
        assert_eq!(lots[1].purchase_price, dec!(100));
        assert_eq!(p.ledger().current_quantity("AAPL"), dec!(6));
    }

    #[test]
    fn sells_consume_oldest_lots_first() {
        let mut p = processor();
        p.process(&[
            Transaction::buy(date(2023, 1, 1), "AAPL", dec!(10), dec!(100)),
            Transaction::buy(date(2023, 2, 1), "AAPL", dec!(10), dec!(110)),
            Transaction::buy(date(2023, 3, 1), "AAPL", dec!(10), dec!(120)),
            Transaction::sell(date(2023, 6, 1), "AAPL", dec!(25), dec!(150)),
        ])
        .unwrap();

        let lots = lots(&p, "AAPL");
        assert_eq!(lots.len(), 4);
        // Oldest two lots fully closed, third split.
        assert!(!lots[0].is_open());
        assert!(!lots[1].is_open());
        assert!(!lots[2].is_open());
        assert!(lots[3].is_open());
        assert_eq!(lots[2].quantity, dec!(5));
        assert_eq!(lots[2].purchase_date, date(2023, 3, 1));
        assert_eq!(lots[3].quantity, dec!(5));

        // No lot is closed while an older one remains open, and the closed
        // quantity matches the requested sell.
        let mut seen_open = false;
        let mut closed_total = Decimal::ZERO;
        for lot in &lots {
            if lot.is_open() {
                seen_open = true;
            } else {
                assert!(!seen_open, "closed lot found after an open one");
                closed_total += lot.quantity;
            }
        }
        assert_eq!(closed_total, dec!(25));
        assert_eq!(p.ledger().current_quantity("AAPL"), dec!(5));
    }

    #[test]
    fn sell_across_multiple_transactions_closes_in_purchase_order() {
        let mut p = processor();
        p.process(&[
            Transaction::buy(date(2023, 1, 1), "AAPL", dec!(4), dec!(100)),
            Transaction::buy(date(2023, 2, 1), "AAPL", dec!(4), dec!(110)),
            Transaction::sell(date(2023, 3, 1), "AAPL", dec!(2), dec!(120)),
            Transaction::sell(date(2023, 4, 1), "AAPL", dec!(4), dec!(130)),
        ])
        .unwrap();

        let lots = lots(&p, "AAPL");
        let sell_dates: Vec<Option<NaiveDate>> =
            lots.iter().map(|lot| lot.disposal.map(|d| d.date)).collect();
        assert_eq!(
            sell_dates,
            vec![
                Some(date(2023, 3, 1)),
                Some(date(2023, 4, 1)),
                Some(date(2023, 4, 1)),
                None,
            ]
        );
        assert_eq!(p.ledger().current_quantity("AAPL"), dec!(2));
    }

    #[test]
    fn overdrawn_sell_fails_without_mutating_the_ledger() {
        let mut p = processor();
        p.apply(&Transaction::buy(date(2023, 1, 1), "AAPL", dec!(10), dec!(50)))
            .unwrap();

        let err = p
            .apply(&Transaction::sell(date(2023, 2, 1), "AAPL", dec!(15), dec!(60)))
            .unwrap_err();
        assert_eq!(
            err,
            ProcessError::InsufficientLots {
                instrument: "AAPL".to_owned(),
                date: date(2023, 2, 1),
                requested: dec!(15),
                available: dec!(10),
            }
        );

        let lots = lots(&p, "AAPL");
        assert_eq!(lots.len(), 1);
        assert!(lots[0].is_open());
        assert_eq!(lots[0].quantity, dec!(10));
        assert_eq!(p.ledger().current_quantity("AAPL"), dec!(10));
    }

    #[test]
    fn conversions_get_zero_basis() {
        let mut p = processor();
        p.apply(&Transaction::zero_basis(
            date(2023, 1, 1),
            "AAPL",
            dec!(5),
            AcquisitionCode::Conversion,
        ))
        .unwrap();

        let lots = lots(&p, "AAPL");
        assert_eq!(lots[0].purchase_price, Decimal::ZERO);
        assert_eq!(lots[0].quantity, dec!(5));
        assert!(lots[0].is_open());
    }

    #[test]
    fn split_rescales_quantities_but_not_prices() {
        let mut p = processor();
        p.process(&[
            Transaction::buy(date(2023, 1, 1), "AAPL", dec!(10), dec!(50)),
            Transaction::split(date(2023, 2, 1), "AAPL", SplitTerms::Ratio(dec!(2))),
        ])
        .unwrap();

        let lots = lots(&p, "AAPL");
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].quantity, dec!(20));
        assert_eq!(lots[0].purchase_price, dec!(50));
        assert_eq!(p.ledger().current_quantity("AAPL"), dec!(20));
    }

    #[test]
    fn split_ratio_derived_from_shares_received() {
        let mut p = processor();
        p.process(&[
            Transaction::buy(date(2023, 1, 1), "AAPL", dec!(10), dec!(50)),
            Transaction::split(date(2023, 2, 1), "AAPL", SplitTerms::SharesReceived(dec!(10))),
        ])
        .unwrap();

        assert_eq!(p.ledger().current_quantity("AAPL"), dec!(20));
    }

    #[test]
    fn split_leaves_closed_lots_alone() {
        let mut p = processor();
        p.process(&[
            Transaction::buy(date(2023, 1, 1), "AAPL", dec!(10), dec!(50)),
            Transaction::sell(date(2023, 2, 1), "AAPL", dec!(4), dec!(60)),
            Transaction::split(date(2023, 3, 1), "AAPL", SplitTerms::SharesReceived(dec!(6))),
        ])
        .unwrap();

        let lots = lots(&p, "AAPL");
        assert_eq!(lots.len(), 2);
        assert_eq!(lots[0].quantity, dec!(4));
        assert!(!lots[0].is_open());
        assert_eq!(lots[1].quantity, dec!(12));
        assert_eq!(p.ledger().current_quantity("AAPL"), dec!(12));
    }

    #[test]
    fn truncated_split_ratio_requires_a_correction() {
        let mut p = processor();
        p.apply(&Transaction::buy(date(2023, 1, 1), "AAPL", dec!(10.5), dec!(50)))
            .unwrap();

        // 3.8182 new shares on 10.5 held derives 1.3636..., which cannot be
        // a clean split ratio.
        let err = p
            .apply(&Transaction::split(
                date(2023, 2, 1),
                "AAPL",
                SplitTerms::SharesReceived(dec!(3.8182)),
            ))
            .unwrap_err();
        assert!(matches!(err, ProcessError::AmbiguousSplitRatio { .. }));
        // Nothing was rescaled.
        assert_eq!(p.ledger().current_quantity("AAPL"), dec!(10.5));
    }

    #[test]
    fn corrected_ratio_resumes_processing() {
        let mut p = Processor::new(SplitPolicy::default(), Fixed(dec!(2)));
        p.process(&[
            Transaction::buy(date(2023, 1, 1), "AAPL", dec!(10.5), dec!(50)),
            Transaction::split(date(2023, 2, 1), "AAPL", SplitTerms::SharesReceived(dec!(10.4999))),
        ])
        .unwrap();

        assert_eq!(p.ledger().current_quantity("AAPL"), dec!(21.0));
    }

    #[test]
    fn ratio_scale_tolerance_is_configurable() {
        let policy = SplitPolicy { max_ratio_scale: 2 };
        let mut p = Processor::new(policy, NoCorrections);
        p.process(&[
            Transaction::buy(date(2023, 1, 1), "AAPL", dec!(8), dec!(50)),
            // Ratio 1.25 has two decimal places; allowed under the wider
            // tolerance, ambiguous under the default.
            Transaction::split(date(2023, 2, 1), "AAPL", SplitTerms::Ratio(dec!(1.25))),
        ])
        .unwrap();
        assert_eq!(p.ledger().current_quantity("AAPL"), dec!(10.00));

        let mut strict = processor();
        strict
            .apply(&Transaction::buy(date(2023, 1, 1), "AAPL", dec!(8), dec!(50)))
            .unwrap();
        let err = strict
            .apply(&Transaction::split(date(2023, 2, 1), "AAPL", SplitTerms::Ratio(dec!(1.25))))
            .unwrap_err();
        assert!(matches!(err, ProcessError::AmbiguousSplitRatio { .. }));
    }

    #[test]
    fn reverse_splits_are_rejected() {
        let mut p = processor();
        p.apply(&Transaction::buy(date(2023, 1, 1), "AAPL", dec!(10), dec!(50)))
            .unwrap();

        let err = p
            .apply(&Transaction::split(date(2023, 2, 1), "AAPL", SplitTerms::Ratio(dec!(0.5))))
            .unwrap_err();
        assert!(matches!(err, ProcessError::MalformedTransaction { .. }));
    }

    #[test]
    fn split_without_holdings_is_rejected() {
        let mut p = processor();
        let err = p
            .apply(&Transaction::split(date(2023, 2, 1), "AAPL", SplitTerms::SharesReceived(dec!(5))))
            .unwrap_err();
        assert!(matches!(err, ProcessError::InsufficientLots { .. }));
    }

    #[test]
    fn non_positive_quantities_are_rejected() {
        let mut p = processor();
        let err = p
            .apply(&Transaction::buy(date(2023, 1, 1), "AAPL", dec!(0), dec!(50)))
            .unwrap_err();
        assert!(matches!(err, ProcessError::MalformedTransaction { .. }));
    }
}

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

/// Stable handle to a lot in the ledger arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LotId(usize);

/// Sale that closed a lot. Date and price always travel together, so a lot
/// can never end up half closed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub(crate) struct Disposal {
    pub date: NaiveDate,
    pub price: Decimal,
}

/// One acquisition of shares, tracked until fully sold. Created by a
/// buy-like transaction, or by splitting a partially consumed lot during a
/// sell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Lot {
    pub instrument: String,
    pub purchase_date: NaiveDate,
    pub purchase_price: Decimal,
    pub quantity: Decimal,
    pub disposal: Option<Disposal>,
    #[serde(skip)]
    prev: Option<LotId>,
    #[serde(skip)]
    next: Option<LotId>,
}

impl Lot {
    pub(crate) fn is_open(&self) -> bool {
        self.disposal.is_none()
    }

    pub(crate) fn prev(&self) -> Option<LotId> {
        self.prev
    }

    pub(crate) fn next(&self) -> Option<LotId> {
        self.next
    }
}

/// Per-instrument chain state. `root` is the first lot ever acquired (it may
/// be closed), `head` the most recent acquisition. `open_quantity` always
/// equals the summed quantity of the chain's open lots.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Chain {
    pub root: LotId,
    pub head: LotId,
    pub open_quantity: Decimal,
}

/// Arena of lots plus the per-instrument chain bookkeeping. Lots are linked
/// by arena index rather than by reference, and are never removed; closed
/// lots stay in the chain for gains reporting.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    lots: Vec<Lot>,
    chains: HashMap<String, Chain>,
}

impl Ledger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a new open lot and links it as the head of the instrument's
    /// chain, creating the chain if this is the first acquisition.
    pub(crate) fn append_lot(
        &mut self,
        instrument: &str,
        date: NaiveDate,
        price: Decimal,
        quantity: Decimal,
    ) -> LotId {
        let id = LotId(self.lots.len());
        let prev = self.chains.get(instrument).map(|chain| chain.head);
        self.lots.push(Lot {
            instrument: instrument.to_owned(),
            purchase_date: date,
            purchase_price: price,
            quantity,
            disposal: None,
            prev,
            next: None,
        });
        match self.chains.get_mut(instrument) {
            Some(chain) => {
                self.lots[chain.head.0].next = Some(id);
                chain.head = id;
                chain.open_quantity += quantity;
            }
            None => {
                self.chains.insert(
                    instrument.to_owned(),
                    Chain {
                        root: id,
                        head: id,
                        open_quantity: quantity,
                    },
                );
            }
        }
        id
    }

    /// The live total of unsold shares for an instrument.
    pub(crate) fn current_quantity(&self, instrument: &str) -> Decimal {
        self.chains
            .get(instrument)
            .map_or(Decimal::ZERO, |chain| chain.open_quantity)
    }

    pub(crate) fn chain(&self, instrument: &str) -> Option<&Chain> {
        self.chains.get(instrument)
    }

    pub(crate) fn lot(&self, id: LotId) -> &Lot {
        &self.lots[id.0]
    }

    pub(crate) fn instruments(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.chains.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn lots_oldest_first(&self, instrument: &str) -> LotIter<'_> {
        LotIter {
            ledger: self,
            cursor: self.chains.get(instrument).map(|chain| chain.root),
            forward: true,
        }
    }

    pub(crate) fn lots_newest_first(&self, instrument: &str) -> LotIter<'_> {
        LotIter {
            ledger: self,
            cursor: self.chains.get(instrument).map(|chain| chain.head),
            forward: false,
        }
    }

    /// Marks a fully consumed open lot as closed.
    pub(crate) fn close(&mut self, id: LotId, disposal: Disposal) {
        let lot = &mut self.lots[id.0];
        debug_assert!(lot.is_open());
        lot.disposal = Some(disposal);
        let instrument = lot.instrument.clone();
        let quantity = lot.quantity;
        let chain = self.chains.get_mut(&instrument).expect("lot belongs to a chain");
        chain.open_quantity -= quantity;
    }

    /// Closes `sold_quantity` out of a partially consumed open lot. The lot
    /// keeps the remainder and stays open; the sold portion becomes a new
    /// closed lot inserted right before it, so chain order is preserved.
    pub(crate) fn split_close(&mut self, id: LotId, sold_quantity: Decimal, disposal: Disposal) -> LotId {
        let closed_id = LotId(self.lots.len());
        let (instrument, purchase_date, purchase_price, prev) = {
            let lot = &self.lots[id.0];
            debug_assert!(lot.is_open());
            debug_assert!(sold_quantity < lot.quantity);
            (lot.instrument.clone(), lot.purchase_date, lot.purchase_price, lot.prev)
        };
        self.lots.push(Lot {
            instrument: instrument.clone(),
            purchase_date,
            purchase_price,
            quantity: sold_quantity,
            disposal: Some(disposal),
            prev,
            next: Some(id),
        });
        if let Some(prev_id) = prev {
            self.lots[prev_id.0].next = Some(closed_id);
        }
        let remainder = &mut self.lots[id.0];
        remainder.prev = Some(closed_id);
        remainder.quantity -= sold_quantity;
        let chain = self.chains.get_mut(&instrument).expect("lot belongs to a chain");
        if chain.root == id {
            chain.root = closed_id;
        }
        chain.open_quantity -= sold_quantity;
        closed_id
    }

    /// Multiplies every open lot's quantity by `ratio`, walking from the
    /// chain head backward until the first closed lot. Open lots form a
    /// contiguous suffix of the chain, since sells consume oldest-first.
    pub(crate) fn rescale_open(&mut self, instrument: &str, ratio: Decimal) {
        let Some(chain) = self.chains.get(instrument) else {
            return;
        };
        let mut cursor = Some(chain.head);
        while let Some(id) = cursor {
            let lot = &mut self.lots[id.0];
            if !lot.is_open() {
                break;
            }
            lot.quantity *= ratio;
            cursor = lot.prev;
        }
        if let Some(chain) = self.chains.get_mut(instrument) {
            chain.open_quantity *= ratio;
        }
    }
}

pub(crate) struct LotIter<'a> {
    ledger: &'a Ledger,
    cursor: Option<LotId>,
    forward: bool,
}

impl<'a> Iterator for LotIter<'a> {
    type Item = &'a Lot;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let lot = self.ledger.lot(id);
        self.cursor = if self.forward { lot.next() } else { lot.prev() };
        Some(lot)
    }
}

//! Per-instrument order books built from snapshot and incremental messages.
//!
//! Each book sits behind its own lock; a whole message is applied under one
//! write guard and readers receive cloned [`BookSnapshot`]s, so a partially
//! applied update is never visible.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{
    BookSide, BookSnapshot, InstrumentKey, MarketDataIncremental, MarketDataSnapshot, MdIncrement,
    MdUpdateAction, PriceLevel,
};

pub const DEFAULT_MAX_BUFFERED: usize = 1024;

#[derive(Debug, Clone)]
struct Level {
    quantity: Decimal,
    entry_key: String,
}

/// Mutable book for one instrument
#[derive(Debug, Clone)]
pub struct OrderBook {
    instrument: InstrumentKey,
    bids: BTreeMap<Decimal, Level>,
    asks: BTreeMap<Decimal, Level>,
    /// entry key -> (side, price)
    entries: HashMap<String, (BookSide, Decimal)>,
    rpt_seq: Option<u64>,
    version: u64,
    last_update: DateTime<Utc>,
}

impl OrderBook {
    pub fn new(instrument: InstrumentKey) -> Self {
        Self {
            instrument,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            entries: HashMap::new(),
            rpt_seq: None,
            version: 0,
            last_update: Utc::now(),
        }
    }

    fn entry_key(entry_id: Option<&str>, side: BookSide, price: Decimal) -> String {
        match entry_id {
            Some(id) => id.to_string(),
            None => format!("{}@{}", side, price.normalize()),
        }
    }

    fn side_mut(&mut self, side: BookSide) -> &mut BTreeMap<Decimal, Level> {
        match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Offer => &mut self.asks,
        }
    }

    /// Replace every level
    pub fn apply_snapshot(&mut self, snapshot: &MarketDataSnapshot) {
        self.bids.clear();
        self.asks.clear();
        self.entries.clear();
        for entry in &snapshot.entries {
            if entry.quantity > Decimal::ZERO {
                self.upsert(entry.entry_id.as_deref(), entry.side, entry.price, entry.quantity);
            }
        }
        self.rpt_seq = snapshot.rpt_seq;
        self.touch();
    }

    /// Apply one incremental entry. Returns false for a no-op.
    pub fn apply_increment(&mut self, inc: &MdIncrement) -> bool {
        let changed = match inc.action {
            MdUpdateAction::New | MdUpdateAction::Change if inc.quantity > Decimal::ZERO => {
                self.upsert(inc.entry_id.as_deref(), inc.side, inc.price, inc.quantity);
                true
            }
            // Zero quantity on an upsert empties the level
            MdUpdateAction::New | MdUpdateAction::Change | MdUpdateAction::Delete => {
                let key = Self::entry_key(inc.entry_id.as_deref(), inc.side, inc.price);
                self.delete(&key)
            }
        };
        if let Some(seq) = inc.rpt_seq {
            self.rpt_seq = Some(seq);
        }
        if changed {
            self.touch();
        }
        changed
    }

    fn upsert(&mut self, entry_id: Option<&str>, side: BookSide, price: Decimal, quantity: Decimal) {
        let key = Self::entry_key(entry_id, side, price);

        // The entry moved: vacate its old level
        if let Some((old_side, old_price)) = self.entries.get(&key).copied() {
            if old_side != side || old_price != price {
                self.delete(&key);
            }
        }

        // Another entry held this price: the new one takes the level over
        let displaced = self
            .side_mut(side)
            .get(&price)
            .filter(|level| level.entry_key != key)
            .map(|level| level.entry_key.clone());
        if let Some(displaced) = displaced {
            self.entries.remove(&displaced);
        }

        self.side_mut(side).insert(
            price,
            Level {
                quantity,
                entry_key: key.clone(),
            },
        );
        self.entries.insert(key, (side, price));
    }

    fn delete(&mut self, key: &str) -> bool {
        let Some((side, price)) = self.entries.remove(key) else {
            return false;
        };
        let levels = self.side_mut(side);
        if levels.get(&price).map_or(false, |l| l.entry_key == key) {
            levels.remove(&price);
        }
        true
    }

    fn touch(&mut self) {
        self.version += 1;
        self.last_update = Utc::now();
    }

    pub fn rpt_seq(&self) -> Option<u64> {
        self.rpt_seq
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> BookSnapshot {
        self.snapshot_depth(usize::MAX)
    }

    pub fn snapshot_depth(&self, depth: usize) -> BookSnapshot {
        BookSnapshot {
            instrument: self.instrument.clone(),
            bids: self
                .bids
                .iter()
                .rev()
                .take(depth)
                .map(|(p, l)| PriceLevel::new(*p, l.quantity))
                .collect(),
            asks: self
                .asks
                .iter()
                .take(depth)
                .map(|(p, l)| PriceLevel::new(*p, l.quantity))
                .collect(),
            version: self.version,
            last_update: self.last_update,
        }
    }
}

/// Thread-safe collection of books keyed by instrument
pub struct OrderBookTracker {
    books: DashMap<InstrumentKey, Arc<RwLock<OrderBook>>>,
    /// Increments that arrived before the instrument's first snapshot
    pending: Mutex<HashMap<InstrumentKey, VecDeque<MdIncrement>>>,
    max_buffered: usize,
}

impl Default for OrderBookTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERED)
    }
}

impl OrderBookTracker {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            books: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            max_buffered: max_buffered.max(1),
        }
    }

    /// Replace the book atomically, then replay buffered increments that are
    /// newer than the snapshot.
    pub fn apply_snapshot(&self, snapshot: &MarketDataSnapshot) -> BookSnapshot {
        let key = snapshot.instrument.clone();

        let mut pending = self.pending.lock();
        let buffered = pending.remove(&key).unwrap_or_default();
        let book = self
            .books
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(OrderBook::new(key.clone()))))
            .clone();

        let mut guard = book.write();
        guard.apply_snapshot(snapshot);
        drop(pending);

        if !buffered.is_empty() {
            let mut replayed = 0usize;
            let mut stale = 0usize;
            for inc in &buffered {
                let newer = match (snapshot.rpt_seq, inc.rpt_seq) {
                    (Some(snap), Some(seq)) => seq > snap,
                    _ => true,
                };
                if newer {
                    guard.apply_increment(inc);
                    replayed += 1;
                } else {
                    stale += 1;
                }
            }
            debug!(instrument = %key, replayed, stale, "Replayed buffered increments after snapshot");
        }

        guard.snapshot()
    }

    /// Apply an incremental message. Each instrument's entries are applied
    /// under one write guard. Returns the instruments whose book changed.
    pub fn apply_incremental(&self, message: &MarketDataIncremental) -> Vec<InstrumentKey> {
        let mut grouped: Vec<(InstrumentKey, Vec<&MdIncrement>)> = Vec::new();
        for inc in &message.entries {
            match grouped.iter_mut().find(|(k, _)| *k == inc.instrument) {
                Some((_, list)) => list.push(inc),
                None => grouped.push((inc.instrument.clone(), vec![inc])),
            }
        }

        let mut updated = Vec::new();
        for (key, entries) in grouped {
            let book = {
                let mut pending = self.pending.lock();
                match self.books.get(&key).map(|b| b.value().clone()) {
                    Some(book) => book,
                    None => {
                        let queue = pending.entry(key.clone()).or_default();
                        for inc in entries {
                            if queue.len() >= self.max_buffered {
                                queue.pop_front();
                                warn!(instrument = %key, limit = self.max_buffered, "Increment buffer full, dropping oldest");
                            }
                            queue.push_back(inc.clone());
                        }
                        debug!(instrument = %key, buffered = queue.len(), "Buffered increment ahead of first snapshot");
                        continue;
                    }
                }
            };

            let mut guard = book.write();
            let mut changed = false;
            for inc in entries {
                changed |= guard.apply_increment(inc);
            }
            if changed {
                updated.push(key);
            }
        }
        updated
    }

    pub fn book(&self, instrument: &InstrumentKey) -> Option<BookSnapshot> {
        let book = self.books.get(instrument).map(|b| b.value().clone())?;
        let guard = book.read();
        Some(guard.snapshot())
    }

    pub fn top_of_book(&self, instrument: &InstrumentKey, depth: usize) -> Option<BookSnapshot> {
        let book = self.books.get(instrument).map(|b| b.value().clone())?;
        let guard = book.read();
        Some(guard.snapshot_depth(depth))
    }

    pub fn has_book(&self, instrument: &InstrumentKey) -> bool {
        self.books.contains_key(instrument)
    }

    pub fn instruments(&self) -> Vec<InstrumentKey> {
        let mut keys: Vec<_> = self.books.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn buffered_count(&self, instrument: &InstrumentKey) -> usize {
        self.pending.lock().get(instrument).map_or(0, |q| q.len())
    }

    /// Drop every buffered increment; called when the session goes away
    pub fn discard_buffered(&self) -> usize {
        let mut pending = self.pending.lock();
        let dropped: usize = pending.values().map(|q| q.len()).sum();
        pending.clear();
        if dropped > 0 {
            warn!(dropped, "Discarded increments that never saw a snapshot");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MdEntry;
    use rust_decimal_macros::dec;

    fn key() -> InstrumentKey {
        InstrumentKey::new("sim", "X")
    }

    fn snapshot(bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> MarketDataSnapshot {
        let mut entries = Vec::new();
        for (p, q) in bids {
            entries.push(MdEntry::new(BookSide::Bid, *p, *q));
        }
        for (p, q) in asks {
            entries.push(MdEntry::new(BookSide::Offer, *p, *q));
        }
        MarketDataSnapshot {
            md_req_id: None,
            instrument: key(),
            entries,
            rpt_seq: None,
        }
    }

    fn incremental(entries: Vec<MdIncrement>) -> MarketDataIncremental {
        MarketDataIncremental {
            md_req_id: None,
            entries,
        }
    }

    fn levels(levels: &[PriceLevel]) -> Vec<(Decimal, Decimal)> {
        levels.iter().map(|l| (l.price, l.quantity)).collect()
    }

    #[test]
    fn test_snapshot_then_change_and_new() {
        let tracker = OrderBookTracker::default();
        tracker.apply_snapshot(&snapshot(&[(dec!(99), dec!(5))], &[(dec!(101), dec!(3))]));

        let updated = tracker.apply_incremental(&incremental(vec![
            MdIncrement::new(MdUpdateAction::Change, key(), BookSide::Bid, dec!(99), dec!(8)),
            MdIncrement::new(MdUpdateAction::New, key(), BookSide::Offer, dec!(102), dec!(2)),
        ]));
        assert_eq!(updated, vec![key()]);

        let book = tracker.book(&key()).unwrap();
        assert_eq!(levels(&book.bids), vec![(dec!(99), dec!(8))]);
        assert_eq!(
            levels(&book.asks),
            vec![(dec!(101), dec!(3)), (dec!(102), dec!(2))]
        );
    }

    #[test]
    fn test_delete_unknown_entry_is_noop() {
        let tracker = OrderBookTracker::default();
        tracker.apply_snapshot(&snapshot(&[(dec!(99), dec!(5))], &[(dec!(101), dec!(3))]));
        let before = tracker.book(&key()).unwrap();

        let updated = tracker.apply_incremental(&incremental(vec![
            MdIncrement::new(MdUpdateAction::Delete, key(), BookSide::Bid, dec!(42), dec!(0)),
            MdIncrement::new(MdUpdateAction::Delete, key(), BookSide::Offer, dec!(101), dec!(0))
                .with_id("missing"),
        ]));
        assert!(updated.is_empty());

        let after = tracker.book(&key()).unwrap();
        assert_eq!(levels(&before.bids), levels(&after.bids));
        assert_eq!(levels(&before.asks), levels(&after.asks));
        assert_eq!(before.version, after.version);
    }

    #[test]
    fn test_sides_stay_sorted_and_unique() {
        let mut book = OrderBook::new(key());
        let prices = [dec!(100), dec!(98), dec!(103), dec!(99), dec!(101), dec!(98)];
        for (i, p) in prices.iter().enumerate() {
            book.apply_increment(
                &MdIncrement::new(MdUpdateAction::New, key(), BookSide::Bid, *p, dec!(1))
                    .with_id(format!("b{i}")),
            );
            book.apply_increment(
                &MdIncrement::new(MdUpdateAction::New, key(), BookSide::Offer, *p + dec!(10), dec!(1))
                    .with_id(format!("a{i}")),
            );
        }

        let snap = book.snapshot();
        let bid_prices: Vec<_> = snap.bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<_> = snap.asks.iter().map(|l| l.price).collect();
        assert!(bid_prices.windows(2).all(|w| w[0] > w[1]));
        assert!(ask_prices.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(bid_prices.len(), 5);

        // Entry index never points at a level owned by someone else
        for (key, (side, price)) in &book.entries {
            let levels = match side {
                BookSide::Bid => &book.bids,
                BookSide::Offer => &book.asks,
            };
            assert_eq!(&levels[price].entry_key, key);
        }
    }

    #[test]
    fn test_entry_moves_price() {
        let mut book = OrderBook::new(key());
        book.apply_increment(
            &MdIncrement::new(MdUpdateAction::New, key(), BookSide::Bid, dec!(99), dec!(1)).with_id("e1"),
        );
        book.apply_increment(
            &MdIncrement::new(MdUpdateAction::Change, key(), BookSide::Bid, dec!(98), dec!(4)).with_id("e1"),
        );

        let snap = book.snapshot();
        assert_eq!(levels(&snap.bids), vec![(dec!(98), dec!(4))]);
    }

    #[test]
    fn test_increments_buffered_until_snapshot() {
        let tracker = OrderBookTracker::default();
        let stale = MdIncrement::new(MdUpdateAction::New, key(), BookSide::Bid, dec!(97), dec!(1)).with_seq(5);
        let fresh = MdIncrement::new(MdUpdateAction::New, key(), BookSide::Bid, dec!(98), dec!(2)).with_seq(11);

        assert!(tracker.apply_incremental(&incremental(vec![stale, fresh])).is_empty());
        assert_eq!(tracker.buffered_count(&key()), 2);
        assert!(tracker.book(&key()).is_none());

        let mut snap = snapshot(&[(dec!(99), dec!(5))], &[(dec!(101), dec!(3))]);
        snap.rpt_seq = Some(10);
        let book = tracker.apply_snapshot(&snap);

        assert_eq!(levels(&book.bids), vec![(dec!(99), dec!(5)), (dec!(98), dec!(2))]);
        assert_eq!(tracker.buffered_count(&key()), 0);
    }

    #[test]
    fn test_buffer_is_bounded_and_discarded() {
        let tracker = OrderBookTracker::new(2);
        for i in 0..5 {
            tracker.apply_incremental(&incremental(vec![MdIncrement::new(
                MdUpdateAction::New,
                key(),
                BookSide::Bid,
                Decimal::from(90 + i),
                dec!(1),
            )]));
        }
        assert_eq!(tracker.buffered_count(&key()), 2);
        assert_eq!(tracker.discard_buffered(), 2);
        assert_eq!(tracker.buffered_count(&key()), 0);
    }

    #[test]
    fn test_snapshot_replaces_everything() {
        let tracker = OrderBookTracker::default();
        tracker.apply_snapshot(&snapshot(&[(dec!(99), dec!(5)), (dec!(98), dec!(1))], &[]));
        tracker.apply_snapshot(&snapshot(&[(dec!(97), dec!(2))], &[(dec!(100), dec!(1))]));

        let book = tracker.book(&key()).unwrap();
        assert_eq!(levels(&book.bids), vec![(dec!(97), dec!(2))]);
        assert_eq!(levels(&book.asks), vec![(dec!(100), dec!(1))]);
    }

    #[test]
    fn test_concurrent_readers_see_whole_updates() {
        let tracker = Arc::new(OrderBookTracker::default());
        tracker.apply_snapshot(&snapshot(&[(dec!(99), dec!(1))], &[(dec!(101), dec!(1))]));

        let writer = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for i in 1..=200u32 {
                    let q = Decimal::from(i);
                    tracker.apply_incremental(&incremental(vec![
                        MdIncrement::new(MdUpdateAction::Change, key(), BookSide::Bid, dec!(99), q),
                        MdIncrement::new(MdUpdateAction::Change, key(), BookSide::Offer, dec!(101), q),
                    ]));
                }
            })
        };

        for _ in 0..200 {
            let book = tracker.book(&key()).unwrap();
            // Both sides are always written in the same message
            assert_eq!(book.bids[0].quantity, book.asks[0].quantity);
        }
        writer.join().unwrap();
    }
}

//! Compact per-item outcome ledger
//!
//! Item ids are interned once into an ordered arena; the outcome of each item
//! is stored as two bits indexed by the item's ordinal. An item holds at most
//! one outcome, and recording a second outcome for it is ignored.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

const BITS_PER_ITEM: usize = 2;
const ITEMS_PER_WORD: usize = 64 / BITS_PER_ITEM;
const OUTCOME_MASK: u64 = 0b11;

/// Final outcome of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    Processed,
    Failed,
    Skipped,
}

impl ItemOutcome {
    fn bits(self) -> u64 {
        match self {
            ItemOutcome::Processed => 0b01,
            ItemOutcome::Failed => 0b10,
            ItemOutcome::Skipped => 0b11,
        }
    }

    fn from_bits(bits: u64) -> Option<Self> {
        match bits & OUTCOME_MASK {
            0b01 => Some(ItemOutcome::Processed),
            0b10 => Some(ItemOutcome::Failed),
            0b11 => Some(ItemOutcome::Skipped),
            _ => None,
        }
    }
}

/// Item ledger keyed by interned id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "LedgerDocument", into = "LedgerDocument")]
pub struct ItemLedger {
    ids: IndexSet<String>,
    outcomes: Vec<u64>,
    processed: usize,
    failed: usize,
    skipped: usize,
}

impl ItemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outcome; returns `false` if the item already had one
    pub fn record(&mut self, id: &str, outcome: ItemOutcome) -> bool {
        if self.ids.contains(id) {
            return false;
        }

        let (ordinal, _) = self.ids.insert_full(id.to_string());
        self.set_bits(ordinal, outcome.bits());
        match outcome {
            ItemOutcome::Processed => self.processed += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
        true
    }

    pub fn outcome(&self, id: &str) -> Option<ItemOutcome> {
        let ordinal = self.ids.get_index_of(id)?;
        ItemOutcome::from_bits(self.bits(ordinal))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn count(&self, outcome: ItemOutcome) -> usize {
        match outcome {
            ItemOutcome::Processed => self.processed,
            ItemOutcome::Failed => self.failed,
            ItemOutcome::Skipped => self.skipped,
        }
    }

    /// Number of items with any outcome
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids with the given outcome, in the order they were first recorded
    pub fn ids(&self, outcome: ItemOutcome) -> impl Iterator<Item = &str> + '_ {
        self.ids
            .iter()
            .enumerate()
            .filter(move |(ordinal, _)| {
                ItemOutcome::from_bits(self.bits(*ordinal)) == Some(outcome)
            })
            .map(|(_, id)| id.as_str())
    }

    fn bits(&self, ordinal: usize) -> u64 {
        let word = ordinal / ITEMS_PER_WORD;
        let shift = (ordinal % ITEMS_PER_WORD) * BITS_PER_ITEM;
        self.outcomes
            .get(word)
            .map(|w| (w >> shift) & OUTCOME_MASK)
            .unwrap_or(0)
    }

    fn set_bits(&mut self, ordinal: usize, bits: u64) {
        let word = ordinal / ITEMS_PER_WORD;
        let shift = (ordinal % ITEMS_PER_WORD) * BITS_PER_ITEM;
        if self.outcomes.len() <= word {
            self.outcomes.resize(word + 1, 0);
        }
        self.outcomes[word] &= !(OUTCOME_MASK << shift);
        self.outcomes[word] |= (bits & OUTCOME_MASK) << shift;
    }
}

/// Ledgers are equal when every id has the same outcome, whatever the
/// order the ids were first seen in
impl PartialEq for ItemLedger {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .ids
                .iter()
                .all(|id| self.outcome(id) == other.outcome(id))
    }
}

impl Eq for ItemLedger {}

/// Persisted form: one id list per outcome
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    processed_image_ids: Vec<String>,
    #[serde(default)]
    failed_image_ids: Vec<String>,
    #[serde(default)]
    skipped_image_ids: Vec<String>,
}

impl From<LedgerDocument> for ItemLedger {
    fn from(doc: LedgerDocument) -> Self {
        let mut ledger = ItemLedger::new();
        for id in &doc.processed_image_ids {
            ledger.record(id, ItemOutcome::Processed);
        }
        for id in &doc.failed_image_ids {
            ledger.record(id, ItemOutcome::Failed);
        }
        for id in &doc.skipped_image_ids {
            ledger.record(id, ItemOutcome::Skipped);
        }
        ledger
    }
}

impl From<ItemLedger> for LedgerDocument {
    fn from(ledger: ItemLedger) -> Self {
        let collect = |outcome: ItemOutcome| -> Vec<String> {
            ledger.ids(outcome).map(str::to_string).collect()
        };
        LedgerDocument {
            processed_image_ids: collect(ItemOutcome::Processed),
            failed_image_ids: collect(ItemOutcome::Failed),
            skipped_image_ids: collect(ItemOutcome::Skipped),
        }
    }
}

#![forbid(unsafe_code)]

use std::fmt;

use gs_kernel_cpu::Parallelism;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Config,
    Dispatch,
    Rejection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Entry cap used by `RuntimeContext::new`.
pub const DEFAULT_LEDGER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
    max_entries: Option<usize>,
    evicted: u64,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that keeps at most `max_entries`, evicting the oldest first.
    #[must_use]
    pub fn bounded(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries: Some(max_entries),
            evicted: 0,
        }
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        if let Some(max_entries) = self.max_entries {
            if max_entries == 0 {
                self.evicted += 1;
                return;
            }
            if self.entries.len() >= max_entries {
                let overflow = self.entries.len() + 1 - max_entries;
                self.entries.drain(..overflow);
                self.evicted += overflow as u64;
            }
        }
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    /// Number of entries dropped by the cap since creation.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Hands every retained entry to the caller and empties the ledger.
    pub fn drain(&mut self) -> Vec<EvidenceEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of one kind, oldest first.
    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    parallelism: Parallelism,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(parallelism: Parallelism) -> Self {
        Self::with_ledger_capacity(parallelism, DEFAULT_LEDGER_CAPACITY)
    }

    #[must_use]
    pub fn with_ledger_capacity(parallelism: Parallelism, max_entries: usize) -> Self {
        let mut ledger = EvidenceLedger::bounded(max_entries);
        ledger.record(
            EvidenceKind::Config,
            format!("parallelism initialized to {}", parallelism.as_str()),
        );
        Self {
            parallelism,
            ledger,
        }
    }

    #[must_use]
    pub fn parallelism(&self) -> Parallelism {
        self.parallelism
    }

    pub fn set_parallelism(&mut self, parallelism: Parallelism) {
        self.parallelism = parallelism;
        self.ledger.record(
            EvidenceKind::Config,
            format!("parallelism switched to {}", parallelism.as_str()),
        );
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_rejection<E>(&mut self, op: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record(
            EvidenceKind::Rejection,
            format!("op={op} rejected: {error}"),
        );
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(Parallelism::default())
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

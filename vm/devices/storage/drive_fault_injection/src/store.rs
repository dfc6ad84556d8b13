// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A per-drive store of faulted blocks.
//!
//! The store holds a fixed pool of single-block records. A record stays in
//! its slot after it is cleared, inactive, until a later `add` needs the slot.

use drive_protocol_defs::AdditionalSenseCode;
use drive_protocol_defs::SenseKey;
use drive_protocol_defs::ascq;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// What a faulted block reports when it is accessed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// An empty slot. Never matches.
    Uninitialized,
    /// Unrecovered read error.
    HardMedia,
    /// Error the device recovered with ECC.
    SoftMedia,
    /// The logical unit is not ready.
    NotReady,
}

impl FaultKind {
    /// The sense key, ASC and ASCQ reported for this kind.
    pub fn sense(&self) -> Option<(SenseKey, AdditionalSenseCode, u8)> {
        let sense = match self {
            Self::Uninitialized => return None,
            Self::HardMedia => (
                SenseKey::MEDIUM_ERROR,
                AdditionalSenseCode::UNRECOVERED_READ_ERROR,
                ascq::GENERAL,
            ),
            Self::SoftMedia => (
                SenseKey::RECOVERED_ERROR,
                AdditionalSenseCode::RECOVERED_WITH_ECC,
                ascq::GENERAL,
            ),
            Self::NotReady => (
                SenseKey::NOT_READY,
                AdditionalSenseCode::LUN_NOT_READY,
                ascq::GENERAL,
            ),
        };
        Some(sense)
    }
}

/// Selects records by kind in lookups.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KindFilter {
    /// Only records of this kind.
    Kind(FaultKind),
    /// Any initialized record.
    AllKinds,
}

impl KindFilter {
    fn matches(&self, kind: FaultKind) -> bool {
        kind != FaultKind::Uninitialized
            && match self {
                Self::Kind(k) => *k == kind,
                Self::AllKinds => true,
            }
    }
}

impl From<FaultKind> for KindFilter {
    fn from(kind: FaultKind) -> Self {
        Self::Kind(kind)
    }
}

/// One faulted block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    /// The faulted block.
    pub lba: u64,
    /// What it reports.
    pub kind: FaultKind,
    /// Whether accesses still fault.
    pub active: bool,
}

impl FaultRecord {
    const EMPTY: Self = Self {
        lba: 0,
        kind: FaultKind::Uninitialized,
        active: false,
    };
}

/// Failure to add a fault range.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An active record of the same kind already covers a block in range.
    #[error("lba {lba:#x} already has an active fault of this kind")]
    DuplicateRange {
        /// The first covered block.
        lba: u64,
    },
    /// The pool ran out of slots. Blocks before `lba` were added.
    #[error("fault store is full, lba {lba:#x} and later were not added")]
    OutOfCapacity {
        /// The first block that was not added.
        lba: u64,
    },
    /// The range has no blocks.
    #[error("empty fault range")]
    EmptyRange,
    /// The range runs past the last addressable block.
    #[error("fault range at {lba_start:#x} with {blocks} blocks runs past the last lba")]
    RangeOverflow {
        /// First block of the range.
        lba_start: u64,
        /// Requested block count.
        blocks: u32,
    },
    /// `Uninitialized` cannot be stored.
    #[error("cannot add a fault of kind {0:?}")]
    InvalidKind(FaultKind),
}

/// Sizing for a [`FaultStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Number of single-block records the store can hold.
    pub capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// The faulted blocks of one drive.
#[derive(Debug)]
pub struct FaultStore {
    records: Mutex<Vec<FaultRecord>>,
}

fn in_range(lba: u64, lba_start: u64, blocks: u64) -> bool {
    lba >= lba_start && lba - lba_start < blocks
}

impl FaultStore {
    /// An empty store.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            records: Mutex::new(vec![FaultRecord::EMPTY; config.capacity]),
        }
    }

    /// Marks `blocks` blocks starting at `lba_start` as faulted.
    ///
    /// Fails without adding anything if an active record of the same kind
    /// already covers part of the range. If the pool runs out partway, the
    /// blocks added so far stay added.
    pub fn add(&self, lba_start: u64, blocks: u32, kind: FaultKind) -> Result<(), StoreError> {
        if blocks == 0 {
            return Err(StoreError::EmptyRange);
        }
        if kind == FaultKind::Uninitialized {
            return Err(StoreError::InvalidKind(kind));
        }
        if lba_start.checked_add(u64::from(blocks - 1)).is_none() {
            return Err(StoreError::RangeOverflow { lba_start, blocks });
        }
        let blocks = u64::from(blocks);

        let mut records = self.records.lock();
        if let Some(dup) = records
            .iter()
            .find(|r| r.active && r.kind == kind && in_range(r.lba, lba_start, blocks))
        {
            return Err(StoreError::DuplicateRange { lba: dup.lba });
        }

        let mut free = records.iter_mut().filter(|r| !r.active);
        for lba in (0..blocks).map(|i| lba_start + i) {
            let Some(slot) = free.next() else {
                tracing::warn!(lba, ?kind, "fault store full");
                return Err(StoreError::OutOfCapacity { lba });
            };
            *slot = FaultRecord {
                lba,
                kind,
                active: true,
            };
        }
        tracing::info!(lba_start, blocks, ?kind, "added fault range");
        Ok(())
    }

    /// The first active record in `[lba_start, lba_start + blocks)` that
    /// passes `filter`.
    pub fn find_overlap(
        &self,
        lba_start: u64,
        blocks: u64,
        filter: impl Into<KindFilter>,
    ) -> Option<FaultRecord> {
        let filter = filter.into();
        self.records
            .lock()
            .iter()
            .find(|r| r.active && filter.matches(r.kind) && in_range(r.lba, lba_start, blocks))
            .copied()
    }

    /// Whether an active record passing `filter` lies in the inclusive range
    /// `[lba_start, lba_start + blocks - 1]`.
    pub fn is_active(&self, lba_start: u64, blocks: u64, filter: impl Into<KindFilter>) -> bool {
        let Some(last) = blocks.checked_sub(1) else {
            return false;
        };
        let lba_end = lba_start.saturating_add(last);
        let filter = filter.into();
        self.records
            .lock()
            .iter()
            .any(|r| r.active && filter.matches(r.kind) && (lba_start..=lba_end).contains(&r.lba))
    }

    /// Deactivates every record in `[lba_start, lba_start + blocks)`.
    /// Returns how many were deactivated.
    pub fn clear(&self, lba_start: u64, blocks: u64) -> usize {
        let mut cleared = 0;
        for r in self
            .records
            .lock()
            .iter_mut()
            .filter(|r| r.active && in_range(r.lba, lba_start, blocks))
        {
            r.active = false;
            cleared += 1;
        }
        if cleared != 0 {
            tracing::info!(lba_start, blocks, cleared, "cleared faults");
        }
        cleared
    }

    /// Every record that has held a fault, active or not.
    pub fn records(&self) -> Vec<FaultRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind != FaultKind::Uninitialized)
            .copied()
            .collect()
    }

    /// Number of active records.
    pub fn active_count(&self) -> usize {
        self.records.lock().iter().filter(|r| r.active).count()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.records.lock().len()
    }
}

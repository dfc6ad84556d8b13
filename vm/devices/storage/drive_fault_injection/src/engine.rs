// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Record-driven protocol error injection.
//!
//! Each [`InjectionRecord`] names a drive, a set of opcodes, an LBA range and
//! the error to report. The engine matches live commands against its records
//! and hands back what to inject. Records exhaust after a number of
//! insertions, and can come back after a cooldown a bounded number of times.
//! Reactivation is checked when a command is matched, not on a timer.

use crate::clock::Clock;
use crate::clock::SystemClock;
use drive_protocol::cdb::CommandDescriptor;
use drive_protocol_defs::AdditionalSenseCode;
use drive_protocol_defs::PortStatus;
use drive_protocol_defs::ScsiOp;
use drive_protocol_defs::SenseKey;
use drive_protocol_defs::sata::FIS_SIZE;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Opcode that matches every command.
pub const ANY_OPCODE: u8 = 0xff;

/// Identifies the drive a record applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(pub u32);

/// Handle to an inserted record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RecordHandle(u64);

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The error a record reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InjectedError {
    /// Check condition with fixed-format sense on a SCSI command.
    Scsi {
        /// Port status reported with the check condition.
        port_status: PortStatus,
        /// Sense key.
        sense_key: SenseKey,
        /// Additional sense code.
        asc: AdditionalSenseCode,
        /// Additional sense code qualifier.
        ascq: u8,
    },
    /// A response frame on a SATA command.
    Fis {
        /// Port status reported with the response.
        port_status: PortStatus,
        /// The device-to-host frame to report.
        response: [u8; FIS_SIZE],
    },
    /// A transport failure on either protocol. The device is never reached.
    Port(PortStatus),
}

impl InjectedError {
    fn applies_to(&self, protocol: Protocol) -> bool {
        match self {
            Self::Scsi { .. } => protocol == Protocol::Scsi,
            Self::Fis { .. } => protocol == Protocol::Sata,
            Self::Port(_) => true,
        }
    }
}

/// Cooldown and limit for bringing an exhausted record back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Reactivation {
    /// Time since exhaustion before the record may fire again.
    pub after: Duration,
    /// How many times the record may be reactivated.
    pub times: u32,
}

/// A fault to inject, and its counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionRecord {
    /// The drive to inject on.
    pub target: TargetId,
    /// Opcodes to match. Empty, or containing [`ANY_OPCODE`], matches all.
    pub opcodes: Vec<u8>,
    /// First block of the range, inclusive.
    pub lba_start: u64,
    /// Last block of the range, inclusive.
    pub lba_end: u64,
    /// What to report.
    pub error: InjectedError,
    /// Insertions before the record is exhausted.
    pub times_to_insert: u32,
    /// Fire on every `frequency`th matching command. Zero and one both mean
    /// every command.
    pub frequency: u32,
    /// Reactivation after exhaustion, if any.
    pub reactivation: Option<Reactivation>,
    /// Swallow matching commands instead of completing them.
    pub drop: bool,
    /// Shorten matching 10 and 16 byte commands by this many blocks and let
    /// them through, simulating an incomplete write. The command completes
    /// with the record's sense.
    pub skip_blocks: Option<u32>,
    /// Each block in range stays faulted until it is reassigned, and the
    /// first faulted block is reported.
    pub media_error: bool,
    /// Blocks reassigned in media error mode.
    pub reassign_count: u32,
    /// Insertions since the last (re)activation.
    pub times_inserted: u32,
    /// Reactivations so far.
    pub times_reset: u32,
}

impl InjectionRecord {
    /// A record that fires once on any command to `target`.
    pub fn new(target: TargetId, error: InjectedError) -> Self {
        Self {
            target,
            opcodes: Vec::new(),
            lba_start: 0,
            lba_end: u64::MAX,
            error,
            times_to_insert: 1,
            frequency: 0,
            reactivation: None,
            drop: false,
            skip_blocks: None,
            media_error: false,
            reassign_count: 0,
            times_inserted: 0,
            times_reset: 0,
        }
    }

    /// Limits the record to `opcodes`.
    pub fn with_opcodes(mut self, opcodes: impl IntoIterator<Item = u8>) -> Self {
        self.opcodes = opcodes.into_iter().collect();
        self
    }

    /// Limits the record to an inclusive block range.
    pub fn with_lba_range(mut self, lba_start: u64, lba_end: u64) -> Self {
        self.lba_start = lba_start;
        self.lba_end = lba_end;
        self
    }

    /// Sets the number of insertions before exhaustion.
    pub fn with_times_to_insert(mut self, times: u32) -> Self {
        self.times_to_insert = times;
        self
    }

    /// Fires on every `frequency`th match.
    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = frequency;
        self
    }

    /// Reactivates `times` times, each `after` exhaustion.
    pub fn with_reactivation(mut self, after: Duration, times: u32) -> Self {
        self.reactivation = Some(Reactivation { after, times });
        self
    }

    /// Swallows matching commands.
    pub fn with_drop(mut self) -> Self {
        self.drop = true;
        self
    }

    /// Shortens matching commands by `blocks`.
    pub fn with_skip_blocks(mut self, blocks: u32) -> Self {
        self.skip_blocks = Some(blocks);
        self
    }

    /// Tracks each block in range separately. A REASSIGN BLOCKS of a block
    /// clears its fault.
    pub fn with_media_error_mode(mut self) -> Self {
        self.media_error = true;
        self
    }

    /// Whether the record has used up its insertions.
    pub fn is_exhausted(&self) -> bool {
        self.times_inserted >= self.times_to_insert
    }

    fn matches_opcode(&self, opcode: u8, protocol: Protocol) -> bool {
        if self.opcodes.is_empty() || self.opcodes.contains(&ANY_OPCODE) {
            return true;
        }
        self.opcodes.iter().any(|&op| {
            op == opcode || (protocol == Protocol::Scsi && long_form(ScsiOp(opcode)) == Some(ScsiOp(op)))
        })
    }

    fn overlaps(&self, command: &CommandDescriptor) -> bool {
        command.lba <= self.lba_end && self.lba_start <= command.last_lba()
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.lba_start > self.lba_end {
            return Err(EngineError::InvalidRecord("lba range is reversed"));
        }
        if self.times_to_insert == 0 {
            return Err(EngineError::InvalidRecord("times_to_insert is zero"));
        }
        if self.skip_blocks.is_some() && !matches!(self.error, InjectedError::Scsi { .. }) {
            return Err(EngineError::InvalidRecord("skip_blocks needs a scsi record"));
        }
        if self.skip_blocks.is_some() && self.drop {
            return Err(EngineError::InvalidRecord("skip_blocks and drop are exclusive"));
        }
        if self.media_error && !matches!(self.error, InjectedError::Scsi { .. }) {
            return Err(EngineError::InvalidRecord("media error mode needs a scsi record"));
        }
        Ok(())
    }
}

/// A record for a 16-byte command also matches its 10-byte form.
fn long_form(op: ScsiOp) -> Option<ScsiOp> {
    let long = match op {
        ScsiOp::READ | ScsiOp::READ16 => ScsiOp::READ16,
        ScsiOp::WRITE | ScsiOp::WRITE16 => ScsiOp::WRITE16,
        ScsiOp::WRITE_SAME | ScsiOp::WRITE_SAME16 => ScsiOp::WRITE_SAME16,
        ScsiOp::WRITE_VERIFY | ScsiOp::WRITE_VERIFY16 => ScsiOp::WRITE_VERIFY16,
        ScsiOp::VERIFY | ScsiOp::VERIFY16 => ScsiOp::VERIFY16,
        _ => return None,
    };
    Some(long)
}

/// Engine operation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `init` has not been called, or `close` has.
    #[error("injection engine is not initialized")]
    NotInitialized,
    /// The record table is full.
    #[error("injection table is full ({0} records)")]
    OutOfCapacity(usize),
    /// No record has this handle.
    #[error("no injection record with handle {0}")]
    InvalidHandle(RecordHandle),
    /// The record is inconsistent.
    #[error("invalid injection record: {0}")]
    InvalidRecord(&'static str),
}

/// Sizing for an [`InjectionEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum number of records.
    pub max_records: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_records: 512 }
    }
}

/// Which command family is being matched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// SCSI command descriptor blocks.
    Scsi,
    /// SATA register frames.
    Sata,
}

/// A command presented for matching.
#[derive(Debug, Copy, Clone)]
pub struct CommandMatch {
    /// The drive the command is for.
    pub target: TargetId,
    /// The command family.
    pub protocol: Protocol,
    /// SCSI or ATA opcode.
    pub opcode: u8,
    /// The addressed range. Commands that address no blocks are never
    /// matched.
    pub range: CommandDescriptor,
    /// The CDB length, for commands whose transfer length can be shortened.
    pub cdb_len: usize,
}

/// What a fired record asks the interceptor to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Injection {
    /// Complete the command with check condition and this sense.
    Sense {
        /// Port status.
        port_status: PortStatus,
        /// Sense key.
        sense_key: SenseKey,
        /// Additional sense code.
        asc: AdditionalSenseCode,
        /// Additional sense code qualifier.
        ascq: u8,
        /// Block to report in the information field.
        bad_lba: u64,
    },
    /// Complete the command with this response frame.
    Fis {
        /// Port status.
        port_status: PortStatus,
        /// The response frame.
        response: [u8; FIS_SIZE],
    },
    /// Complete the command with a transport failure.
    Port(PortStatus),
    /// Swallow the command.
    Drop,
    /// Send the command on with a shorter transfer, then complete it with
    /// check condition and this sense.
    Shorten {
        /// Transfer length to send.
        blocks: u32,
        /// Transfer length to put back on completion.
        restore_blocks: u32,
        /// Port status.
        port_status: PortStatus,
        /// Sense key.
        sense_key: SenseKey,
        /// Additional sense code.
        asc: AdditionalSenseCode,
        /// Additional sense code qualifier.
        ascq: u8,
        /// First block that was not transferred.
        bad_lba: u64,
    },
}

/// A fired record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Fired {
    /// The record that fired.
    pub handle: RecordHandle,
    /// What to do with the command.
    pub injection: Injection,
}

#[derive(Debug)]
struct Slot {
    handle: RecordHandle,
    record: InjectionRecord,
    /// Matches seen while active, for `frequency`.
    hits: u64,
    exhausted_at: Option<Instant>,
    /// Blocks no longer faulted in media error mode.
    reassigned: BTreeSet<u64>,
}

impl Slot {
    /// The first faulted block in `[lo, hi]`.
    fn first_faulted(&self, lo: u64, hi: u64) -> Option<u64> {
        let mut lba = lo;
        for &done in self.reassigned.range(lo..=hi) {
            if done != lba {
                break;
            }
            lba = lba.checked_add(1)?;
        }
        (lba <= hi).then_some(lba)
    }

    fn fire(&mut self, now: Instant) {
        self.record.times_inserted += 1;
        if self.record.is_exhausted() {
            self.exhausted_at = Some(now);
        }
    }

    fn try_reactivate(&mut self, now: Instant) -> bool {
        let (Some(reactivation), Some(exhausted_at)) = (self.record.reactivation, self.exhausted_at)
        else {
            return false;
        };
        if !self.record.is_exhausted()
            || self.record.times_reset >= reactivation.times
            || now.saturating_duration_since(exhausted_at) < reactivation.after
        {
            return false;
        }
        self.record.times_inserted = 0;
        self.record.times_reset += 1;
        self.exhausted_at = None;
        self.hits = 0;
        true
    }
}

#[derive(Debug)]
struct EngineState {
    started: bool,
    next_handle: u64,
    slots: Vec<Slot>,
}

impl EngineState {
    fn slot_mut(&mut self, handle: RecordHandle) -> Result<&mut Slot, EngineError> {
        self.slots
            .iter_mut()
            .find(|s| s.handle == handle)
            .ok_or(EngineError::InvalidHandle(handle))
    }
}

/// The injection record table. All operations take `&self`; one lock guards
/// the table for the duration of each call.
pub struct InjectionEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<EngineState>>,
}

impl fmt::Debug for InjectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectionEngine")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl InjectionEngine {
    /// An uninitialized engine using the system clock.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// An uninitialized engine reading time from `clock`.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(None),
        }
    }

    /// Allocates an empty record table and enables matching. Calling it
    /// again keeps the existing table.
    pub fn init(&self) {
        let mut state = self.state.lock();
        if state.is_some() {
            tracing::debug!("injection engine already initialized");
            return;
        }
        *state = Some(EngineState {
            started: true,
            next_handle: 1,
            slots: Vec::new(),
        });
        tracing::info!(max_records = self.config.max_records, "injection engine initialized");
    }

    /// Drops every record and returns the engine to its uninitialized state.
    /// Succeeds whether or not the engine was initialized.
    pub fn close(&self) {
        if let Some(state) = self.state.lock().take() {
            tracing::info!(records = state.slots.len(), "injection engine closed");
        }
    }

    /// Enables matching.
    pub fn start(&self) -> Result<(), EngineError> {
        self.with_state(|state| state.started = true)?;
        tracing::info!("injection started");
        Ok(())
    }

    /// Disables matching. Records and their counters are kept.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.with_state(|state| state.started = false)?;
        tracing::info!("injection stopped");
        Ok(())
    }

    /// Whether commands are currently matched.
    pub fn is_started(&self) -> bool {
        self.state.lock().as_ref().is_some_and(|s| s.started)
    }

    /// Adds a record. Its counters are reset.
    pub fn insert(&self, mut record: InjectionRecord) -> Result<RecordHandle, EngineError> {
        record.validate()?;
        record.times_inserted = 0;
        record.times_reset = 0;
        record.reassign_count = 0;
        let max_records = self.config.max_records;
        let handle = self.with_state(|state| {
            if state.slots.len() >= max_records {
                return Err(EngineError::OutOfCapacity(max_records));
            }
            let handle = RecordHandle(state.next_handle);
            state.next_handle += 1;
            tracing::info!(
                %handle,
                target = record.target.0,
                lba_start = record.lba_start,
                lba_end = record.lba_end,
                error = ?record.error,
                "inserted injection record"
            );
            state.slots.push(Slot {
                handle,
                record,
                hits: 0,
                exhausted_at: None,
                reassigned: BTreeSet::new(),
            });
            Ok(handle)
        })??;
        Ok(handle)
    }

    /// Removes a record.
    pub fn remove(&self, handle: RecordHandle) -> Result<(), EngineError> {
        self.with_state(|state| {
            let index = state
                .slots
                .iter()
                .position(|s| s.handle == handle)
                .ok_or(EngineError::InvalidHandle(handle))?;
            state.slots.remove(index);
            tracing::info!(%handle, "removed injection record");
            Ok(())
        })?
    }

    /// Removes every record for `target`. Returns how many were removed.
    pub fn remove_all_for_target(&self, target: TargetId) -> Result<usize, EngineError> {
        self.with_state(|state| {
            let before = state.slots.len();
            state.slots.retain(|s| s.record.target != target);
            let removed = before - state.slots.len();
            tracing::info!(target = target.0, removed, "removed injection records for target");
            removed
        })
    }

    /// A snapshot of one record.
    pub fn get_record(&self, handle: RecordHandle) -> Result<InjectionRecord, EngineError> {
        self.with_state(|state| state.slot_mut(handle).map(|s| s.record.clone()))?
    }

    /// A snapshot of every record, in insertion order.
    pub fn records(&self) -> Vec<(RecordHandle, InjectionRecord)> {
        self.state
            .lock()
            .as_ref()
            .map(|state| {
                state
                    .slots
                    .iter()
                    .map(|s| (s.handle, s.record.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of records.
    pub fn record_count(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.slots.len())
    }

    /// Changes how many insertions a record makes before exhaustion. The
    /// insertion count is kept.
    pub fn update_times_to_insert(
        &self,
        handle: RecordHandle,
        times_to_insert: u32,
    ) -> Result<(), EngineError> {
        if times_to_insert == 0 {
            return Err(EngineError::InvalidRecord("times_to_insert is zero"));
        }
        let now = self.clock.now();
        self.with_state(|state| {
            let slot = state.slot_mut(handle)?;
            slot.record.times_to_insert = times_to_insert;
            slot.exhausted_at = slot.record.is_exhausted().then_some(now);
            Ok(())
        })?
    }

    /// Clears the fault on `lba` in every media error record of `target`
    /// that covers it, as a drive does once the block is remapped. Returns
    /// how many records changed.
    pub fn reassign(&self, target: TargetId, lba: u64) -> usize {
        let mut state = self.state.lock();
        let Some(state) = state.as_mut().filter(|s| s.started) else {
            return 0;
        };
        let mut changed = 0;
        for slot in &mut state.slots {
            let record = &slot.record;
            if record.target != target
                || !record.media_error
                || !(record.lba_start..=record.lba_end).contains(&lba)
            {
                continue;
            }
            if slot.reassigned.insert(lba) {
                slot.record.reassign_count += 1;
                changed += 1;
                tracing::info!(
                    handle = %slot.handle,
                    lba,
                    reassign_count = slot.record.reassign_count,
                    "reassign cleared injected media error"
                );
            }
        }
        changed
    }

    /// Matches a command against the records in insertion order and fires
    /// the first one that applies.
    pub fn check(&self, command: &CommandMatch) -> Option<Fired> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let state = state.as_mut().filter(|s| s.started)?;
        let range = &command.range;

        for slot in &mut state.slots {
            let record = &slot.record;
            if record.target != command.target
                || !record.error.applies_to(command.protocol)
                || !record.matches_opcode(command.opcode, command.protocol)
            {
                continue;
            }
            if slot.try_reactivate(now) {
                tracing::info!(handle = %slot.handle, times_reset = slot.record.times_reset, "reactivated injection record");
            }
            let record = &slot.record;
            if record.is_exhausted() || !record.overlaps(range) {
                continue;
            }

            let first_lba = range.lba.max(record.lba_start);
            let bad_lba = if record.media_error {
                let last_lba = range.last_lba().min(record.lba_end);
                let Some(lba) = slot.first_faulted(first_lba, last_lba) else {
                    continue;
                };
                lba
            } else {
                first_lba
            };

            let shorten = match record.skip_blocks {
                Some(skip) => {
                    let Some(blocks) = shortened(command, skip) else {
                        continue;
                    };
                    Some(blocks)
                }
                None => None,
            };

            slot.hits += 1;
            if slot.record.frequency > 1 && slot.hits % u64::from(slot.record.frequency) != 0 {
                continue;
            }

            slot.fire(now);
            let record = &slot.record;
            let injection = match (record.error, shorten) {
                _ if record.drop => Injection::Drop,
                (
                    InjectedError::Scsi {
                        port_status,
                        sense_key,
                        asc,
                        ascq,
                    },
                    Some(blocks),
                ) => Injection::Shorten {
                    blocks,
                    restore_blocks: range.block_count,
                    port_status,
                    sense_key,
                    asc,
                    ascq,
                    bad_lba: range.lba.saturating_add(u64::from(blocks)),
                },
                (
                    InjectedError::Scsi {
                        port_status,
                        sense_key,
                        asc,
                        ascq,
                    },
                    None,
                ) => Injection::Sense {
                    port_status,
                    sense_key,
                    asc,
                    ascq,
                    bad_lba,
                },
                (
                    InjectedError::Fis {
                        port_status,
                        response,
                    },
                    _,
                ) => Injection::Fis {
                    port_status,
                    response,
                },
                (InjectedError::Port(status), _) => Injection::Port(status),
            };
            tracing::debug!(
                handle = %slot.handle,
                target = command.target.0,
                opcode = command.opcode,
                lba = range.lba,
                times_inserted = record.times_inserted,
                ?injection,
                "injecting error"
            );
            return Some(Fired {
                handle: slot.handle,
                injection,
            });
        }
        None
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> Result<R, EngineError> {
        let mut state = self.state.lock();
        let state = state.as_mut().ok_or(EngineError::NotInitialized)?;
        Ok(f(state))
    }
}

/// The transfer length after skipping `skip` blocks, when the command can be
/// shortened.
fn shortened(command: &CommandMatch, skip: u32) -> Option<u32> {
    let blocks = command.range.block_count;
    if !matches!(command.cdb_len, 10 | 16) || blocks <= skip {
        return None;
    }
    Some(blocks - skip)
}

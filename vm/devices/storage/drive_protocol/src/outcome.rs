// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The normalized result of classifying a completion.

use bitfield_struct::bitfield;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// What the issuer should do with the I/O.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoStatus {
    /// The I/O completed; any flags are informational.
    Ok,
    /// The I/O failed and may be retried.
    FailRetry,
    /// The I/O failed and must not be retried.
    FailNoRetry,
}

/// Error categories attached to an outcome. An empty set means no error.
#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct ErrorFlags {
    /// The device recovered the error on its own.
    pub recovered: bool,
    /// Media defect.
    pub media: bool,
    /// Device hardware fault.
    pub hardware: bool,
    /// Link or interface fault between initiator and device.
    pub link: bool,
    /// Data integrity fault.
    pub data: bool,
    /// The device asks for a health check.
    pub healthcheck: bool,
    /// The device remapped the failing block itself.
    pub remapped: bool,
    /// The spindle is stopped.
    pub not_spinning: bool,
    /// The completion could not be interpreted.
    pub unknown: bool,
    /// The device predicts its own failure.
    pub end_of_life: bool,
    /// End of life, with a service call home.
    pub end_of_life_callhome: bool,
    /// The device is unusable.
    pub fatal: bool,
    /// Fatal, with a service call home.
    pub fatal_callhome: bool,
    /// The transport reported the failure, not the device.
    pub port: bool,
    /// The request itself was invalid.
    pub invalid: bool,
    #[bits(17)]
    _reserved: u32,
}

impl ErrorFlags {
    /// The union of two flag sets.
    pub fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }

    /// Whether every flag in `other` is also set in `self`.
    pub fn contains(&self, other: Self) -> bool {
        self.into_bits() & other.into_bits() == other.into_bits()
    }

    /// Whether no flag is set.
    pub fn is_empty(&self) -> bool {
        self.into_bits() == 0
    }
}

/// The result of classifying one completion. Built once, never patched.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ClassificationOutcome {
    /// Retry disposition.
    pub io_status: IoStatus,
    /// Error categories.
    pub error_flags: ErrorFlags,
    /// The failing block, when the device or frame reported one.
    pub bad_lba: Option<u64>,
}

impl ClassificationOutcome {
    /// Success with no flags.
    pub const OK: Self = Self::new(IoStatus::Ok, ErrorFlags::new());

    /// An outcome with no bad LBA.
    pub const fn new(io_status: IoStatus, error_flags: ErrorFlags) -> Self {
        Self {
            io_status,
            error_flags,
            bad_lba: None,
        }
    }

    /// A retryable failure with no flags.
    pub const fn retry() -> Self {
        Self::new(IoStatus::FailRetry, ErrorFlags::new())
    }

    /// Attaches the failing block.
    pub const fn with_bad_lba(self, lba: Option<u64>) -> Self {
        Self {
            bad_lba: lba,
            ..self
        }
    }

    /// Adds flags.
    pub fn with_flags(self, flags: ErrorFlags) -> Self {
        Self {
            error_flags: self.error_flags.union(flags),
            ..self
        }
    }

    /// Whether the I/O completed.
    pub fn is_ok(&self) -> bool {
        self.io_status == IoStatus::Ok
    }
}

impl fmt::Debug for ClassificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ClassificationOutcome");
        s.field("io_status", &self.io_status)
            .field("error_flags", &format_args!("{:#x}", self.error_flags.into_bits()));
        if let Some(lba) = self.bad_lba {
            s.field("bad_lba", &format_args!("{:#x}", lba));
        }
        s.finish()
    }
}

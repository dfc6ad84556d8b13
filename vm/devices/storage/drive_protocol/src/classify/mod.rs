// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Protocol error classification: turns a raw completion into a
//! [`ClassificationOutcome`](crate::ClassificationOutcome).
//!
//! Classification is a pure function of the completion, the drive's
//! [`ExceptionTable`](crate::ExceptionTable) and the
//! [`ClassifierConfig`](crate::ClassifierConfig). It never fails: anything
//! that cannot be interpreted becomes a retryable failure.

mod port;
mod sata;
mod scsi;

pub use port::port_outcome;
pub use sata::FisCompletion;
pub use sata::classify_fis_completion;
pub use scsi::CdbCompletion;
pub use scsi::classify_cdb_completion;

mod flags {
    use crate::outcome::ErrorFlags;

    pub const NONE: ErrorFlags = ErrorFlags::new();
    pub const RECOVERED: ErrorFlags = ErrorFlags::new().with_recovered(true);
    pub const REMAPPED: ErrorFlags = ErrorFlags::new().with_recovered(true).with_remapped(true);
    pub const MEDIA: ErrorFlags = ErrorFlags::new().with_media(true);
    pub const HARDWARE: ErrorFlags = ErrorFlags::new().with_hardware(true);
    pub const LINK: ErrorFlags = ErrorFlags::new().with_link(true);
    pub const NOT_SPINNING: ErrorFlags = ErrorFlags::new().with_not_spinning(true);
    pub const UNKNOWN: ErrorFlags = ErrorFlags::new().with_unknown(true);
    pub const END_OF_LIFE: ErrorFlags = ErrorFlags::new().with_end_of_life(true);
    pub const FATAL: ErrorFlags = ErrorFlags::new().with_fatal(true);
    pub const PORT: ErrorFlags = ErrorFlags::new().with_port(true);
    pub const INVALID: ErrorFlags = ErrorFlags::new().with_invalid(true);
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The drive protocol layer of a disk array: it locates the range a SCSI or
//! SATA command addresses, decodes what the device reported back, and turns
//! each completion into a [`ClassificationOutcome`] the I/O path can act on.
//!
//! Decoding and extraction report malformed input through typed errors.
//! Classification never fails; see [`classify`].

#![forbid(unsafe_code)]

pub mod cdb;
pub mod classify;
pub mod exception;
pub mod fis;
pub mod sense;

mod config;
mod outcome;

pub use classify::CdbCompletion;
pub use classify::FisCompletion;
pub use classify::classify_cdb_completion;
pub use classify::classify_fis_completion;
pub use config::ClassifierConfig;
pub use exception::ExceptionTable;
pub use outcome::ClassificationOutcome;
pub use outcome::ErrorFlags;
pub use outcome::IoStatus;

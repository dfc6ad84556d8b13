// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-drive-category exception tables. An entry that matches a completion
//! decides its outcome before the generic classification rules run.

use crate::fis::FisResponse;
use crate::outcome::ClassificationOutcome;
use crate::outcome::ErrorFlags;
use crate::outcome::IoStatus;
use crate::sense::SenseDescriptor;
use serde::Deserialize;
use serde::Serialize;
use std::ops::RangeInclusive;

/// The outcome an exception entry forces.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionAction {
    /// Retry disposition.
    pub io_status: IoStatus,
    /// Error flags, as their bit representation.
    #[serde(with = "flag_bits")]
    pub error_flags: ErrorFlags,
}

impl ExceptionAction {
    fn outcome(&self) -> ClassificationOutcome {
        ClassificationOutcome::new(self.io_status, self.error_flags)
    }
}

mod flag_bits {
    use crate::outcome::ErrorFlags;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(flags: &ErrorFlags, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(flags.into_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ErrorFlags, D::Error> {
        Ok(ErrorFlags::from_bits(u32::deserialize(d)?))
    }
}

/// Matches SCSI sense by key and inclusive ASC/ASCQ ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiException {
    /// Sense key, matched exactly.
    pub sense_key: u8,
    /// Inclusive ASC range.
    pub asc_range: (u8, u8),
    /// Inclusive ASCQ range.
    pub ascq_range: (u8, u8),
    /// The forced outcome.
    pub action: ExceptionAction,
}

impl ScsiException {
    fn matches(&self, sense: &SenseDescriptor) -> bool {
        sense.sense_key.0 == self.sense_key
            && in_range(self.asc_range, sense.additional_code.0)
            && in_range(self.ascq_range, sense.additional_code_qualifier)
    }
}

/// Matches a SATA response frame by inclusive status and error register
/// ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FisException {
    /// Inclusive status register range.
    pub status_range: (u8, u8),
    /// Inclusive error register range.
    pub error_range: (u8, u8),
    /// The forced outcome.
    pub action: ExceptionAction,
}

impl FisException {
    fn matches(&self, response: &FisResponse) -> bool {
        in_range(self.status_range, response.status.into_bits())
            && in_range(self.error_range, response.error.into_bits())
    }
}

fn in_range((start, end): (u8, u8), v: u8) -> bool {
    RangeInclusive::new(start, end).contains(&v)
}

/// The exception table for one drive category. Entries are searched in
/// insertion order and the first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExceptionTable {
    /// Drive category this table applies to, for diagnostics.
    pub category: String,
    /// SCSI sense exceptions.
    pub scsi: Vec<ScsiException>,
    /// SATA response exceptions.
    pub fis: Vec<FisException>,
}

impl ExceptionTable {
    /// An empty table; every lookup falls through.
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            ..Default::default()
        }
    }

    /// Appends a SCSI entry.
    pub fn with_scsi(
        mut self,
        sense_key: u8,
        asc_range: (u8, u8),
        ascq_range: (u8, u8),
        io_status: IoStatus,
        error_flags: ErrorFlags,
    ) -> Self {
        self.scsi.push(ScsiException {
            sense_key,
            asc_range,
            ascq_range,
            action: ExceptionAction {
                io_status,
                error_flags,
            },
        });
        self
    }

    /// Appends a SATA entry.
    pub fn with_fis(
        mut self,
        status_range: (u8, u8),
        error_range: (u8, u8),
        io_status: IoStatus,
        error_flags: ErrorFlags,
    ) -> Self {
        self.fis.push(FisException {
            status_range,
            error_range,
            action: ExceptionAction {
                io_status,
                error_flags,
            },
        });
        self
    }

    /// The forced outcome for `sense`, or `None` to fall through to the
    /// generic rules. The bad LBA from the sense data is carried over.
    pub fn lookup_scsi(&self, sense: &SenseDescriptor) -> Option<ClassificationOutcome> {
        let entry = self.scsi.iter().find(|e| e.matches(sense))?;
        tracing::debug!(
            category = self.category.as_str(),
            sense = format_args!("{:#010x}", sense.packed()),
            "scsi exception match"
        );
        Some(entry.action.outcome().with_bad_lba(sense.lba()))
    }

    /// The forced outcome for a SATA response, or `None` to fall through.
    pub fn lookup_fis(&self, response: &FisResponse) -> Option<ClassificationOutcome> {
        let entry = self.fis.iter().find(|e| e.matches(response))?;
        tracing::debug!(
            category = self.category.as_str(),
            status = response.status.into_bits(),
            error = response.error.into_bits(),
            "fis exception match"
        );
        Some(entry.action.outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_protocol_defs::AdditionalSenseCode;
    use drive_protocol_defs::SenseKey;
    use drive_protocol_defs::sata::AtaError;
    use drive_protocol_defs::sata::AtaStatus;
    use test_with_tracing::test;

    fn sense(sk: SenseKey, asc: u8, ascq: u8) -> SenseDescriptor {
        SenseDescriptor::new(sk, AdditionalSenseCode(asc), ascq)
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let table = ExceptionTable::new("test").with_scsi(
            3,
            (0x10, 0x12),
            (0, 5),
            IoStatus::FailNoRetry,
            ErrorFlags::new().with_fatal(true),
        );
        assert!(table.lookup_scsi(&sense(SenseKey::MEDIUM_ERROR, 0x10, 0)).is_some());
        assert!(table.lookup_scsi(&sense(SenseKey::MEDIUM_ERROR, 0x12, 5)).is_some());
        assert!(table.lookup_scsi(&sense(SenseKey::MEDIUM_ERROR, 0x13, 0)).is_none());
        assert!(table.lookup_scsi(&sense(SenseKey::MEDIUM_ERROR, 0x11, 6)).is_none());
        assert!(table.lookup_scsi(&sense(SenseKey::HARDWARE_ERROR, 0x11, 0)).is_none());
    }

    #[test]
    fn first_match_wins() {
        let table = ExceptionTable::new("test")
            .with_scsi(1, (0, 0xff), (0, 0xff), IoStatus::FailRetry, ErrorFlags::new())
            .with_scsi(
                1,
                (0x5d, 0x5d),
                (0, 0xff),
                IoStatus::Ok,
                ErrorFlags::new().with_end_of_life(true),
            );
        let outcome = table
            .lookup_scsi(&sense(SenseKey::RECOVERED_ERROR, 0x5d, 0))
            .unwrap();
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
    }

    #[test]
    fn bad_lba_carried_over() {
        let table =
            ExceptionTable::new("test").with_scsi(3, (0, 0xff), (0, 0xff), IoStatus::FailRetry, ErrorFlags::new());
        let outcome = table
            .lookup_scsi(&sense(SenseKey::MEDIUM_ERROR, 0x11, 0).with_bad_lba(42))
            .unwrap();
        assert_eq!(outcome.bad_lba, Some(42));
    }

    #[test]
    fn fis_ranges() {
        let table = ExceptionTable::new("sata").with_fis(
            (0x51, 0x51),
            (0x40, 0x40),
            IoStatus::FailNoRetry,
            ErrorFlags::new().with_media(true),
        );
        let hit = FisResponse {
            status: AtaStatus::from_bits(0x51),
            error: AtaError::from_bits(0x40),
            lba: 0,
        };
        let miss = FisResponse {
            error: AtaError::from_bits(0x04),
            ..hit
        };
        assert!(table.lookup_fis(&hit).is_some());
        assert!(table.lookup_fis(&miss).is_none());
    }

    #[test]
    fn loads_from_json() {
        let table: ExceptionTable = serde_json::from_str(
            r#"{
                "category": "flash",
                "scsi": [{
                    "sense_key": 1,
                    "asc_range": [93, 93],
                    "ascq_range": [0, 255],
                    "action": { "io_status": "Ok", "error_flags": 512 }
                }]
            }"#,
        )
        .unwrap();
        assert!(table.fis.is_empty());
        let outcome = table
            .lookup_scsi(&sense(SenseKey::RECOVERED_ERROR, 0x5d, 0x10))
            .unwrap();
        assert!(outcome.error_flags.end_of_life());
        assert!(outcome.is_ok());
    }
}

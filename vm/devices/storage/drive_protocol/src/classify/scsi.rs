// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Classification of SCSI command completions.

use super::flags;
use super::port::port_outcome;
use crate::cdb::CommandDescriptor;
use crate::cdb::MediaCommand;
use crate::config::ClassifierConfig;
use crate::exception::ExceptionTable;
use crate::outcome::ClassificationOutcome;
use crate::outcome::ErrorFlags;
use crate::outcome::IoStatus;
use crate::sense;
use crate::sense::SenseDescriptor;
use drive_protocol_defs::AdditionalSenseCode as Asc;
use drive_protocol_defs::PortStatus;
use drive_protocol_defs::ScsiOp;
use drive_protocol_defs::ScsiStatus;
use drive_protocol_defs::SenseKey;
use drive_protocol_defs::ascq;

/// A SCSI command as completed by the port.
#[derive(Debug, Copy, Clone)]
pub struct CdbCompletion<'a> {
    /// Transport status.
    pub port_status: PortStatus,
    /// SCSI status byte from the device.
    pub scsi_status: ScsiStatus,
    /// The sense buffer. Only read on check condition.
    pub sense: &'a [u8],
    /// Operation code of the completed command.
    pub opcode: ScsiOp,
    /// The range the command addressed, if it addressed media.
    pub command: Option<CommandDescriptor>,
}

impl<'a> CdbCompletion<'a> {
    /// A completion for a command that addresses no media.
    pub fn new(
        port_status: PortStatus,
        scsi_status: ScsiStatus,
        sense: &'a [u8],
        opcode: ScsiOp,
    ) -> Self {
        Self {
            port_status,
            scsi_status,
            sense,
            opcode,
            command: None,
        }
    }

    /// Attaches the addressed range.
    pub fn with_command(self, command: CommandDescriptor) -> Self {
        Self {
            command: Some(command),
            ..self
        }
    }
}

/// ASC/ASCQ pairs with which a device reports that it recovered the data and
/// reallocated the block on its own.
const AUTO_REALLOCATED: &[(Asc, u8)] = &[
    (Asc::WRITE_ERROR, 0x01),
    (Asc::RECORD_NOT_FOUND, 0x06),
    (Asc::DATA_SYNC_MARK_MISSING, 0x03),
    (Asc::RECOVERED_WITH_RETRIES, 0x06),
    (Asc::RECOVERED_WITH_ECC, 0x02),
];

const fn outcome(io_status: IoStatus, error_flags: ErrorFlags) -> ClassificationOutcome {
    ClassificationOutcome::new(io_status, error_flags)
}

/// Classifies a SCSI completion.
///
/// Transport failures decide the outcome on their own. A successful transport
/// defers to the SCSI status, and check condition to the sense data: first
/// the drive's exception table, then the generic sense key rules.
pub fn classify_cdb_completion(
    completion: &CdbCompletion<'_>,
    overrides: &ExceptionTable,
    config: &ClassifierConfig,
) -> ClassificationOutcome {
    match completion.port_status {
        PortStatus::Success => classify_device_status(completion, overrides, config),
        PortStatus::DataUnderrun if completion.scsi_status == ScsiStatus::CHECK_CONDITION => {
            classify_underrun(completion, overrides, config)
        }
        status => port_outcome(status),
    }
}

fn classify_device_status(
    completion: &CdbCompletion<'_>,
    overrides: &ExceptionTable,
    config: &ClassifierConfig,
) -> ClassificationOutcome {
    match completion.scsi_status {
        ScsiStatus::GOOD => ClassificationOutcome::OK,
        ScsiStatus::CHECK_CONDITION => match decode_sense(completion) {
            Some(sense) => classify_sense(completion, &sense, overrides, config),
            None => outcome(IoStatus::FailRetry, flags::UNKNOWN),
        },
        ScsiStatus::BUSY | ScsiStatus::RESERVATION_CONFLICT => ClassificationOutcome::retry(),
        status => {
            tracing::debug!(?status, opcode = ?completion.opcode, "unexpected scsi status");
            outcome(IoStatus::FailRetry, flags::UNKNOWN)
        }
    }
}

/// A short transfer that also carried sense. The underrun is the real failure
/// unless the sense reports something worse than a recovered error.
fn classify_underrun(
    completion: &CdbCompletion<'_>,
    overrides: &ExceptionTable,
    config: &ClassifierConfig,
) -> ClassificationOutcome {
    let underrun = port_outcome(PortStatus::DataUnderrun);
    let Some(sense) = decode_sense(completion) else {
        return underrun;
    };
    let by_sense = classify_sense(completion, &sense, overrides, config);
    if sense.sense_key == SenseKey::RECOVERED_ERROR
        && by_sense.is_ok()
        && !is_predictive_failure(&sense)
    {
        underrun
    } else {
        by_sense
    }
}

fn decode_sense(completion: &CdbCompletion<'_>) -> Option<SenseDescriptor> {
    match sense::decode(completion.sense) {
        Ok(sense) => Some(sense),
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                opcode = ?completion.opcode,
                "failed to decode sense data"
            );
            None
        }
    }
}

fn classify_sense(
    completion: &CdbCompletion<'_>,
    sense: &SenseDescriptor,
    overrides: &ExceptionTable,
    config: &ClassifierConfig,
) -> ClassificationOutcome {
    if let Some(outcome) = overrides.lookup_scsi(sense) {
        return outcome;
    }

    // The error belongs to an earlier command, and so does its LBA.
    if sense.deferred {
        tracing::debug!(
            sense = format_args!("{:#010x}", sense.packed()),
            "deferred error"
        );
        return ClassificationOutcome::retry();
    }

    let by_key = match sense.sense_key {
        SenseKey::NO_SENSE => ClassificationOutcome::OK,
        SenseKey::RECOVERED_ERROR => recovered_error(sense, config),
        SenseKey::NOT_READY => not_ready(sense),
        SenseKey::MEDIUM_ERROR => medium_error(sense, completion.opcode),
        SenseKey::HARDWARE_ERROR => hardware_error(sense),
        SenseKey::ILLEGAL_REQUEST => outcome(IoStatus::FailRetry, flags::HARDWARE),
        SenseKey::UNIT_ATTENTION => unit_attention(sense),
        SenseKey::ABORTED_COMMAND | SenseKey::VENDOR_SPECIFIC => aborted_command(sense),
        sense_key => {
            tracing::debug!(?sense_key, "unexpected sense key");
            outcome(IoStatus::FailRetry, flags::HARDWARE)
        }
    };

    check_bad_lba_range(completion, by_key.with_bad_lba(sense.lba()), config)
}

/// Whether a recovered error predicts that the drive is wearing out.
fn is_predictive_failure(sense: &SenseDescriptor) -> bool {
    matches!(
        (sense.additional_code, sense.additional_code_qualifier),
        (Asc::FAILURE_PREDICTION, _)
            | (Asc::WARNING, ascq::TEMPERATURE_EXCEEDED)
            | (Asc::DEFECT_LIST_ERROR, _)
            | (Asc::PRIMARY_LIST_MISSING, _)
            | (
                Asc::GENERAL_FIRMWARE_ERROR,
                ascq::SMART_TRIP | ascq::SMART_WEAR_TRIP
            )
    )
}

fn recovered_error(sense: &SenseDescriptor, config: &ClassifierConfig) -> ClassificationOutcome {
    let code = (sense.additional_code, sense.additional_code_qualifier);
    if AUTO_REALLOCATED.contains(&code) {
        return outcome(IoStatus::Ok, flags::REMAPPED);
    }
    if is_predictive_failure(sense) {
        if config.pfa_handling {
            return outcome(IoStatus::Ok, flags::RECOVERED.union(flags::END_OF_LIFE));
        }
        tracing::warn!(
            sense = format_args!("{:#010x}", sense.packed()),
            "predictive failure reported, pfa handling disabled"
        );
    }
    outcome(IoStatus::Ok, flags::RECOVERED)
}

fn not_ready(sense: &SenseDescriptor) -> ClassificationOutcome {
    match (sense.additional_code, sense.additional_code_qualifier) {
        (Asc::LUN_NOT_READY, ascq::BECOMING_READY | ascq::NOTIFY_ENABLE_SPINUP) => {
            ClassificationOutcome::retry()
        }
        (Asc::LUN_NOT_READY, ascq::NOT_SPINNING) => {
            outcome(IoStatus::FailRetry, flags::NOT_SPINNING)
        }
        (Asc::FORMAT_CORRUPTED, _) => outcome(IoStatus::FailNoRetry, flags::FATAL),
        _ => outcome(IoStatus::FailNoRetry, flags::HARDWARE),
    }
}

fn medium_error(sense: &SenseDescriptor, opcode: ScsiOp) -> ClassificationOutcome {
    match sense.additional_code {
        Asc::FORMAT_CORRUPTED
        | Asc::DEFECT_LIST_ERROR
        | Asc::PRIMARY_LIST_MISSING
        | Asc::NO_DEFECT_SPARE => outcome(IoStatus::FailNoRetry, flags::FATAL),
        // A remap that itself hit a media error cannot be retried.
        _ if opcode == ScsiOp::REASSIGN_BLOCKS && sense.lba_valid => {
            outcome(IoStatus::FailNoRetry, flags::FATAL)
        }
        // With or without a valid LBA.
        _ => outcome(IoStatus::FailRetry, flags::MEDIA),
    }
}

fn hardware_error(sense: &SenseDescriptor) -> ClassificationOutcome {
    match sense.additional_code {
        Asc::DEFECT_LIST_ERROR => {
            outcome(IoStatus::FailRetry, flags::HARDWARE.union(flags::END_OF_LIFE))
        }
        Asc::INTERFACE_PARITY_ERROR
        | Asc::GENERAL_FIRMWARE_ERROR
        | Asc::NO_DEFECT_SPARE
        | Asc::SEEK_ERROR
        | Asc::WRITE_FAULT
        | Asc::INTERNAL_TARGET_FAILURE => outcome(IoStatus::FailRetry, flags::HARDWARE),
        asc => {
            tracing::debug!(?asc, "unrecognized hardware error");
            outcome(IoStatus::FailRetry, flags::HARDWARE)
        }
    }
}

fn unit_attention(sense: &SenseDescriptor) -> ClassificationOutcome {
    match (sense.additional_code, sense.additional_code_qualifier) {
        (Asc::POWER_ON_RESET, _) => outcome(IoStatus::FailRetry, flags::LINK),
        (Asc::PARAMETERS_CHANGED, _)
        | (Asc::SPINDLE_SYNC_CHANGE, ascq::SYNC_SUCCESS | ascq::SYNC_FAIL) => {
            ClassificationOutcome::OK
        }
        (Asc::VENDOR_FF, _) => outcome(IoStatus::FailRetry, flags::HARDWARE),
        _ => ClassificationOutcome::OK,
    }
}

fn aborted_command(sense: &SenseDescriptor) -> ClassificationOutcome {
    match sense.additional_code {
        // A bridge in front of the drive reports lost contact with the
        // backend as a communication failure.
        Asc::INTERFACE_PARITY_ERROR | Asc::DATA_PHASE_ERROR | Asc::LUN_COMMUNICATION => {
            outcome(IoStatus::FailRetry, flags::LINK)
        }
        _ => outcome(IoStatus::FailRetry, flags::HARDWARE),
    }
}

/// Remapping a block the write never touched would corrupt unrelated data,
/// so a media error on a write must report an LBA inside the write.
fn check_bad_lba_range(
    completion: &CdbCompletion<'_>,
    outcome: ClassificationOutcome,
    config: &ClassifierConfig,
) -> ClassificationOutcome {
    let (Some(command), Some(bad_lba)) = (completion.command, outcome.bad_lba) else {
        return outcome;
    };
    if !config.check_bad_lba_range || command.contains(bad_lba) {
        return outcome;
    }
    tracing::warn!(
        bad_lba,
        lba = command.lba,
        blocks = command.block_count,
        opcode = ?completion.opcode,
        "bad lba outside the command range"
    );
    let is_write = MediaCommand::from_op(completion.opcode).is_some_and(|c| c.is_write());
    let media_class = outcome.error_flags.media() || outcome.error_flags.recovered();
    if is_write && media_class {
        ClassificationOutcome::new(IoStatus::FailRetry, flags::INVALID)
    } else {
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::Direction;
    use drive_protocol_defs::FixedSenseData;
    use test_with_tracing::test;
    use zerocopy::IntoBytes;

    fn sense(sk: SenseKey, asc: Asc, ascq: u8, lba: Option<u32>) -> Vec<u8> {
        FixedSenseData::new(sk, asc, ascq, lba).as_bytes().to_vec()
    }

    fn check_condition(opcode: ScsiOp, sense: &[u8]) -> CdbCompletion<'_> {
        CdbCompletion::new(
            PortStatus::Success,
            ScsiStatus::CHECK_CONDITION,
            sense,
            opcode,
        )
    }

    fn classify(completion: &CdbCompletion<'_>) -> ClassificationOutcome {
        classify_cdb_completion(
            completion,
            &ExceptionTable::default(),
            &ClassifierConfig::default(),
        )
    }

    fn read_range(lba: u64, blocks: u32) -> CommandDescriptor {
        CommandDescriptor {
            opcode: ScsiOp::READ.0,
            lba,
            block_count: blocks,
            direction: Direction::In,
        }
    }

    fn write_range(lba: u64, blocks: u32) -> CommandDescriptor {
        CommandDescriptor {
            opcode: ScsiOp::WRITE.0,
            lba,
            block_count: blocks,
            direction: Direction::Out,
        }
    }

    #[test]
    fn good_status() {
        let c = CdbCompletion::new(PortStatus::Success, ScsiStatus::GOOD, &[], ScsiOp::READ);
        assert_eq!(classify(&c), ClassificationOutcome::OK);
    }

    #[test]
    fn busy_and_unknown_status() {
        let busy = CdbCompletion::new(PortStatus::Success, ScsiStatus::BUSY, &[], ScsiOp::READ);
        assert_eq!(classify(&busy), ClassificationOutcome::retry());

        let odd = CdbCompletion::new(
            PortStatus::Success,
            ScsiStatus::ACA_ACTIVE,
            &[],
            ScsiOp::READ,
        );
        let outcome = classify(&odd);
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
        assert!(outcome.error_flags.unknown());
    }

    #[test]
    fn medium_error_with_lba() {
        let buf = sense(SenseKey::MEDIUM_ERROR, Asc::WRITE_ERROR, 0, Some(0x1234));
        let c = check_condition(ScsiOp::WRITE, &buf).with_command(write_range(0x1200, 0x100));
        let outcome = classify(&c);
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
        assert!(outcome.error_flags.media());
        assert_eq!(outcome.bad_lba, Some(0x1234));
    }

    #[test]
    fn medium_error_without_lba_still_media() {
        let buf = sense(SenseKey::MEDIUM_ERROR, Asc::UNRECOVERED_READ_ERROR, 0, None);
        let outcome = classify(&check_condition(ScsiOp::READ, &buf));
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
        assert!(outcome.error_flags.media());
        assert_eq!(outcome.bad_lba, None);
    }

    #[test]
    fn medium_error_on_reassign_is_fatal() {
        let buf = sense(SenseKey::MEDIUM_ERROR, Asc::UNRECOVERED_READ_ERROR, 0, Some(9));
        let outcome = classify(&check_condition(ScsiOp::REASSIGN_BLOCKS, &buf));
        assert_eq!(outcome.io_status, IoStatus::FailNoRetry);
        assert!(outcome.error_flags.fatal());

        let buf = sense(SenseKey::MEDIUM_ERROR, Asc::NO_DEFECT_SPARE, 0, None);
        let outcome = classify(&check_condition(ScsiOp::READ, &buf));
        assert_eq!(outcome.io_status, IoStatus::FailNoRetry);
    }

    #[test]
    fn auto_reallocation() {
        let buf = sense(SenseKey::RECOVERED_ERROR, Asc::RECOVERED_WITH_RETRIES, 0x06, None);
        let outcome = classify(&check_condition(ScsiOp::READ, &buf));
        assert!(outcome.is_ok());
        assert_eq!(outcome.error_flags, flags::REMAPPED);
    }

    #[test]
    fn plain_recovered_error() {
        let buf = sense(SenseKey::RECOVERED_ERROR, Asc::RECOVERED_WITH_ECC, 0, Some(5));
        let c = check_condition(ScsiOp::READ, &buf).with_command(read_range(0, 8));
        let outcome = classify(&c);
        assert!(outcome.is_ok());
        assert_eq!(outcome.error_flags, flags::RECOVERED);
        assert_eq!(outcome.bad_lba, Some(5));
    }

    #[test]
    fn predictive_failure_needs_config() {
        let buf = sense(SenseKey::RECOVERED_ERROR, Asc::FAILURE_PREDICTION, 0x10, None);
        let c = check_condition(ScsiOp::READ, &buf);
        let outcome = classify(&c);
        assert!(outcome.is_ok());
        assert!(!outcome.error_flags.end_of_life());

        let config = ClassifierConfig {
            pfa_handling: true,
            ..Default::default()
        };
        let outcome = classify_cdb_completion(&c, &ExceptionTable::default(), &config);
        assert!(outcome.is_ok());
        assert!(outcome.error_flags.end_of_life());
        assert!(outcome.error_flags.recovered());
    }

    #[test]
    fn not_ready_variants() {
        let cases = [
            (Asc::LUN_NOT_READY, ascq::BECOMING_READY, IoStatus::FailRetry, flags::NONE),
            (Asc::LUN_NOT_READY, ascq::NOTIFY_ENABLE_SPINUP, IoStatus::FailRetry, flags::NONE),
            (Asc::LUN_NOT_READY, ascq::NOT_SPINNING, IoStatus::FailRetry, flags::NOT_SPINNING),
            (Asc::FORMAT_CORRUPTED, 0, IoStatus::FailNoRetry, flags::FATAL),
            (Asc::LUN_NOT_READY, ascq::FORMAT_IN_PROGRESS, IoStatus::FailNoRetry, flags::HARDWARE),
        ];
        for (asc, q, io_status, error_flags) in cases {
            let buf = sense(SenseKey::NOT_READY, asc, q, None);
            let outcome = classify(&check_condition(ScsiOp::READ, &buf));
            assert_eq!(outcome.io_status, io_status, "{asc:?}/{q:#x}");
            assert_eq!(outcome.error_flags, error_flags, "{asc:?}/{q:#x}");
        }
    }

    #[test]
    fn hardware_defect_list_is_end_of_life() {
        let buf = sense(SenseKey::HARDWARE_ERROR, Asc::DEFECT_LIST_ERROR, 0, None);
        let outcome = classify(&check_condition(ScsiOp::READ, &buf));
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
        assert!(outcome.error_flags.hardware());
        assert!(outcome.error_flags.end_of_life());

        let buf = sense(SenseKey::HARDWARE_ERROR, Asc::SEEK_ERROR, 0, None);
        let outcome = classify(&check_condition(ScsiOp::READ, &buf));
        assert_eq!(outcome.error_flags, flags::HARDWARE);
    }

    #[test]
    fn unit_attention_variants() {
        let buf = sense(SenseKey::UNIT_ATTENTION, Asc::POWER_ON_RESET, 0, None);
        let outcome = classify(&check_condition(ScsiOp::READ, &buf));
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
        assert!(outcome.error_flags.link());

        let buf = sense(SenseKey::UNIT_ATTENTION, Asc::PARAMETERS_CHANGED, 1, None);
        assert!(classify(&check_condition(ScsiOp::READ, &buf)).is_ok());

        let buf = sense(SenseKey::UNIT_ATTENTION, Asc::VENDOR_FF, 0, None);
        let outcome = classify(&check_condition(ScsiOp::READ, &buf));
        assert!(outcome.error_flags.hardware());

        let buf = sense(SenseKey::UNIT_ATTENTION, Asc::ILLEGAL_BLOCK, 0, None);
        assert!(classify(&check_condition(ScsiOp::READ, &buf)).is_ok());
    }

    #[test]
    fn aborted_command_link_or_hardware() {
        for sk in [SenseKey::ABORTED_COMMAND, SenseKey::VENDOR_SPECIFIC] {
            for asc in [
                Asc::INTERFACE_PARITY_ERROR,
                Asc::DATA_PHASE_ERROR,
                Asc::LUN_COMMUNICATION,
            ] {
                let buf = sense(sk, asc, 0, None);
                let outcome = classify(&check_condition(ScsiOp::READ, &buf));
                assert_eq!(outcome.io_status, IoStatus::FailRetry);
                assert_eq!(outcome.error_flags, flags::LINK);
            }

            let buf = sense(sk, Asc::NO_ADDITIONAL_SENSE, 0, None);
            let outcome = classify(&check_condition(ScsiOp::READ, &buf));
            assert_eq!(outcome.error_flags, flags::HARDWARE);
        }
    }

    #[test]
    fn unexpected_sense_key_is_never_success() {
        for sk in [SenseKey::ILLEGAL_REQUEST, SenseKey::DATA_PROTECT, SenseKey::MISCOMPARE] {
            let buf = sense(sk, Asc::NO_ADDITIONAL_SENSE, 0, None);
            let outcome = classify(&check_condition(ScsiOp::READ, &buf));
            assert_eq!(outcome.io_status, IoStatus::FailRetry);
            assert!(outcome.error_flags.hardware());
        }
    }

    #[test]
    fn undecodable_sense_retries() {
        let c = check_condition(ScsiOp::READ, &[0x55; 18]);
        let outcome = classify(&c);
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
        assert!(outcome.error_flags.unknown());
    }

    #[test]
    fn deferred_sense_retries_without_lba() {
        let mut buf = sense(SenseKey::MEDIUM_ERROR, Asc::WRITE_ERROR, 0, Some(3));
        buf[0] = 0x80 | 0x71;
        let outcome = classify(&check_condition(ScsiOp::WRITE, &buf));
        assert_eq!(outcome, ClassificationOutcome::retry());
    }

    #[test]
    fn port_status_wins_over_sense() {
        let buf = sense(SenseKey::MEDIUM_ERROR, Asc::WRITE_ERROR, 0, Some(1));
        let c = CdbCompletion::new(
            PortStatus::SelectionTimeout,
            ScsiStatus::CHECK_CONDITION,
            &buf,
            ScsiOp::READ,
        );
        let outcome = classify(&c);
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
        assert!(outcome.error_flags.link());
        assert_eq!(outcome.bad_lba, None);
    }

    #[test]
    fn underrun_with_recovered_error() {
        let buf = sense(SenseKey::RECOVERED_ERROR, Asc::RECOVERED_WITH_ECC, 0, None);
        let c = CdbCompletion::new(
            PortStatus::DataUnderrun,
            ScsiStatus::CHECK_CONDITION,
            &buf,
            ScsiOp::READ,
        );
        assert_eq!(classify(&c), port_outcome(PortStatus::DataUnderrun));

        let buf = sense(SenseKey::RECOVERED_ERROR, Asc::FAILURE_PREDICTION, 0, None);
        let c = CdbCompletion { sense: &buf, ..c };
        let outcome = classify(&c);
        assert!(outcome.is_ok());
        assert!(outcome.error_flags.recovered());

        let buf = sense(SenseKey::MEDIUM_ERROR, Asc::UNRECOVERED_READ_ERROR, 0, Some(2));
        let c = CdbCompletion { sense: &buf, ..c };
        assert!(classify(&c).error_flags.media());
    }

    #[test]
    fn underrun_without_sense_is_link() {
        let c = CdbCompletion::new(PortStatus::DataUnderrun, ScsiStatus::GOOD, &[], ScsiOp::READ);
        assert!(classify(&c).error_flags.link());
    }

    #[test]
    fn exception_table_first() {
        let table = ExceptionTable::new("test").with_scsi(
            SenseKey::MEDIUM_ERROR.0,
            (0x0c, 0x0c),
            (0, 0xff),
            IoStatus::FailNoRetry,
            flags::MEDIA,
        );
        let buf = sense(SenseKey::MEDIUM_ERROR, Asc::WRITE_ERROR, 0, Some(7));
        let c = check_condition(ScsiOp::WRITE, &buf);
        let outcome = classify_cdb_completion(&c, &table, &ClassifierConfig::default());
        assert_eq!(outcome.io_status, IoStatus::FailNoRetry);
        assert_eq!(outcome.bad_lba, Some(7));
    }

    #[test]
    fn write_media_error_outside_range_is_invalid() {
        let buf = sense(SenseKey::MEDIUM_ERROR, Asc::WRITE_ERROR, 0, Some(0x5000));
        let c = check_condition(ScsiOp::WRITE, &buf).with_command(write_range(0x100, 8));
        let outcome = classify(&c);
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
        assert_eq!(outcome.error_flags, flags::INVALID);
        assert_eq!(outcome.bad_lba, None);

        // Reads keep the media outcome.
        let c = check_condition(ScsiOp::READ, &buf).with_command(read_range(0x100, 8));
        assert!(classify(&c).error_flags.media());

        // And the check can be turned off.
        let c = check_condition(ScsiOp::WRITE, &buf).with_command(write_range(0x100, 8));
        let config = ClassifierConfig {
            check_bad_lba_range: false,
            ..Default::default()
        };
        let outcome = classify_cdb_completion(&c, &ExceptionTable::default(), &config);
        assert!(outcome.error_flags.media());
        assert_eq!(outcome.bad_lba, Some(0x5000));
    }
}

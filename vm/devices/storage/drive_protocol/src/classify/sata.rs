// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Classification of SATA command completions.

use super::flags;
use super::port::port_outcome;
use crate::cdb::Direction;
use crate::exception::ExceptionTable;
use crate::fis;
use crate::fis::AtaErrorKind;
use crate::fis::FisResponse;
use crate::outcome::ClassificationOutcome;
use crate::outcome::IoStatus;
use drive_protocol_defs::PortStatus;

/// A SATA command as completed by the port.
#[derive(Debug, Copy, Clone)]
pub struct FisCompletion<'a> {
    /// Transport status.
    pub port_status: PortStatus,
    /// The host-to-device command frame that was issued.
    pub command: &'a [u8],
    /// The device-to-host response frame.
    pub response: &'a [u8],
}

/// Classifies a SATA completion.
///
/// A successful transport defers to the response frame. A data underrun is
/// treated the same way, since the device reports real errors through its
/// error register. [`PortStatus::SataNcqError`] means a queued command failed
/// and the response frame holds the device error even when the status error
/// bit is clear.
pub fn classify_fis_completion(
    completion: &FisCompletion<'_>,
    overrides: &ExceptionTable,
) -> ClassificationOutcome {
    match completion.port_status {
        PortStatus::Success | PortStatus::DataUnderrun => {
            let Some(response) = decode_response(completion) else {
                return ClassificationOutcome::new(IoStatus::FailRetry, flags::UNKNOWN);
            };
            if let Some(outcome) = overrides.lookup_fis(&response) {
                return outcome;
            }
            match response.error_kind() {
                None => ClassificationOutcome::OK,
                Some(kind) => device_error(completion, kind, &response),
            }
        }
        PortStatus::SataNcqError => {
            let Some(response) = decode_response(completion) else {
                return port_outcome(PortStatus::SataNcqError);
            };
            if let Some(outcome) = overrides.lookup_fis(&response) {
                return outcome;
            }
            device_error(completion, FisResponse::kind_of(response.error), &response)
        }
        status => port_outcome(status),
    }
}

fn decode_response(completion: &FisCompletion<'_>) -> Option<FisResponse> {
    match fis::decode_response(completion.response) {
        Ok(response) => Some(response),
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                port_status = ?completion.port_status,
                "failed to decode response frame"
            );
            None
        }
    }
}

fn device_error(
    completion: &FisCompletion<'_>,
    kind: AtaErrorKind,
    response: &FisResponse,
) -> ClassificationOutcome {
    let (io_status, error_flags) = match kind {
        AtaErrorKind::Uncorrectable => {
            // Only a queued read reports the failing address in the response.
            if is_queued_read(completion.command) {
                return ClassificationOutcome::new(IoStatus::FailNoRetry, flags::MEDIA)
                    .with_bad_lba(Some(response.lba));
            }
            (IoStatus::FailRetry, flags::LINK)
        }
        AtaErrorKind::InterfaceCrc => (IoStatus::FailRetry, flags::HARDWARE),
        AtaErrorKind::Aborted => (IoStatus::FailRetry, flags::LINK),
        AtaErrorKind::IdNotFound => (IoStatus::FailRetry, flags::NONE),
        AtaErrorKind::Other => {
            tracing::debug!(
                status = response.status.into_bits(),
                error = response.error.into_bits(),
                "unrecognized ata error"
            );
            (IoStatus::FailRetry, flags::UNKNOWN)
        }
    };
    ClassificationOutcome::new(io_status, error_flags)
}

fn is_queued_read(command: &[u8]) -> bool {
    fis::is_queued(command)
        && fis::extract(command).is_ok_and(|command| command.direction == Direction::In)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_protocol_defs::sata::AtaCommand;
    use drive_protocol_defs::sata::AtaError;
    use test_with_tracing::test;

    fn classify(port_status: PortStatus, command: &[u8], response: &[u8]) -> ClassificationOutcome {
        classify_fis_completion(
            &FisCompletion {
                port_status,
                command,
                response,
            },
            &ExceptionTable::default(),
        )
    }

    #[test]
    fn clean_response_is_ok() {
        let command = fis::build_command(AtaCommand::READ_DMA_EXT, 0, 8, 0);
        let response = fis::build_response(AtaError::new(), 0);
        assert_eq!(
            classify(PortStatus::Success, &command, &response),
            ClassificationOutcome::OK
        );
        assert_eq!(
            classify(PortStatus::DataUnderrun, &command, &response),
            ClassificationOutcome::OK
        );
    }

    #[test]
    fn ncq_uncorrectable_on_queued_read() {
        let command = fis::build_command(AtaCommand::READ_FPDMA_QUEUED, 0x0102_0304_0506, 8, 3);
        let mut response = fis::build_response(AtaError::new().with_unc(true), 0);
        fis::mirror_lba(&command, &mut response);
        let outcome = classify(PortStatus::SataNcqError, &command, &response);
        assert_eq!(outcome.io_status, IoStatus::FailNoRetry);
        assert_eq!(outcome.error_flags, flags::MEDIA);
        assert_eq!(outcome.bad_lba, Some(0x0102_0304_0506));
    }

    #[test]
    fn ncq_uncorrectable_on_queued_write() {
        let command = fis::build_command(AtaCommand::WRITE_FPDMA_QUEUED, 100, 8, 0);
        let response = fis::build_response(AtaError::new().with_unc(true), 100);
        let outcome = classify(PortStatus::SataNcqError, &command, &response);
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
        assert_eq!(outcome.error_flags, flags::LINK);
        assert_eq!(outcome.bad_lba, None);
    }

    #[test]
    fn error_register_bits() {
        let command = fis::build_command(AtaCommand::READ_FPDMA_QUEUED, 0, 1, 0);
        let cases = [
            (AtaError::new().with_icrc(true), flags::HARDWARE),
            (AtaError::new().with_abrt(true), flags::LINK),
            (AtaError::new().with_idnf(true), flags::NONE),
            (AtaError::new().with_amnf(true), flags::UNKNOWN),
        ];
        for (error, expected) in cases {
            for port_status in [PortStatus::Success, PortStatus::SataNcqError] {
                let response = fis::build_response(error, 0);
                let outcome = classify(port_status, &command, &response);
                assert_eq!(outcome.io_status, IoStatus::FailRetry, "{error:?}");
                assert_eq!(outcome.error_flags, expected, "{error:?}");
            }
        }
    }

    #[test]
    fn transport_failures() {
        let command = fis::build_command(AtaCommand::READ_DMA_EXT, 0, 1, 0);
        let outcome = classify(PortStatus::SelectionTimeout, &command, &[]);
        assert_eq!(outcome.io_status, IoStatus::FailRetry);
        assert!(outcome.error_flags.link());

        let outcome = classify(PortStatus::SataNcqError, &command, &[0; 4]);
        assert!(outcome.error_flags.link());
        assert!(outcome.error_flags.port());

        let outcome = classify(PortStatus::Success, &command, &command);
        assert!(outcome.error_flags.unknown());
    }

    #[test]
    fn exception_table_first() {
        let table = ExceptionTable::new("sata").with_fis(
            (0, 0xff),
            (0x80, 0x80),
            IoStatus::FailNoRetry,
            flags::HARDWARE,
        );
        let command = fis::build_command(AtaCommand::READ_DMA_EXT, 0, 1, 0);
        let response = fis::build_response(AtaError::new().with_icrc(true), 0);
        let outcome = classify_fis_completion(
            &FisCompletion {
                port_status: PortStatus::Success,
                command: &command,
                response: &response,
            },
            &table,
        );
        assert_eq!(outcome.io_status, IoStatus::FailNoRetry);
    }
}

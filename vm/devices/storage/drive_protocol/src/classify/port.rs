// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Outcomes decided by the transport alone.

use super::flags;
use crate::outcome::ClassificationOutcome;
use crate::outcome::IoStatus;
use drive_protocol_defs::PortStatus;

/// The outcome decided by a port status alone.
///
/// The protocol classifiers look at device status before consulting this
/// table for [`PortStatus::Success`], [`PortStatus::DataUnderrun`] and
/// [`PortStatus::SataNcqError`]; the entries for those apply only when the
/// device status adds nothing.
pub fn port_outcome(status: PortStatus) -> ClassificationOutcome {
    let (io_status, error_flags) = match status {
        PortStatus::Success => (IoStatus::Ok, flags::NONE),
        PortStatus::InvalidRequest => (IoStatus::FailRetry, flags::INVALID.union(flags::PORT)),
        PortStatus::InsufficientResources | PortStatus::Busy => (IoStatus::FailRetry, flags::PORT),
        PortStatus::NotLoggedIn
        | PortStatus::ProtocolError
        | PortStatus::AbortTimeout
        | PortStatus::SelectionTimeout
        | PortStatus::TransientError
        | PortStatus::DataOverrun
        | PortStatus::DataUnderrun
        | PortStatus::AbortedBySoftware
        | PortStatus::AbortedByDevice
        | PortStatus::IncidentalAbort
        | PortStatus::SataNcqError => (IoStatus::FailRetry, flags::LINK.union(flags::PORT)),
        // A key problem does not clear on retry.
        PortStatus::EncryptionNotEnabled
        | PortStatus::EncryptionBadHandle
        | PortStatus::EncryptionKeyWrapError => (IoStatus::FailNoRetry, flags::PORT),
    };
    ClassificationOutcome::new(io_status, error_flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn success_alone_is_ok() {
        assert_eq!(port_outcome(PortStatus::Success), ClassificationOutcome::OK);
    }

    #[test]
    fn link_failures_retry() {
        for status in [
            PortStatus::SelectionTimeout,
            PortStatus::AbortTimeout,
            PortStatus::IncidentalAbort,
            PortStatus::NotLoggedIn,
        ] {
            let outcome = port_outcome(status);
            assert_eq!(outcome.io_status, IoStatus::FailRetry, "{status:?}");
            assert!(outcome.error_flags.link(), "{status:?}");
            assert!(outcome.error_flags.port(), "{status:?}");
        }
    }

    #[test]
    fn encryption_failures_do_not_retry() {
        let outcome = port_outcome(PortStatus::EncryptionBadHandle);
        assert_eq!(outcome.io_status, IoStatus::FailNoRetry);
        assert!(!outcome.error_flags.link());
    }
}

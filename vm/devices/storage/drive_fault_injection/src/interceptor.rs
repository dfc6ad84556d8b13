// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The inline hook on the outbound command path.
//!
//! The interceptor borrows a [`FaultStore`] and an [`InjectionEngine`] for
//! one command. When either has a fault for the command, the interceptor
//! fills in the completion fields of the request the way a failing drive
//! would and the command goes no further. Commands that address no blocks
//! are never intercepted.

use crate::engine::CommandMatch;
use crate::engine::Injection;
use crate::engine::InjectionEngine;
use crate::engine::Protocol;
use crate::engine::TargetId;
use crate::store::FaultKind;
use crate::store::FaultStore;
use crate::store::KindFilter;
use drive_protocol::cdb;
use drive_protocol::cdb::CommandDescriptor;
use drive_protocol::cdb::ExtractError;
use drive_protocol::cdb::MediaCommand;
use drive_protocol::fis;
use drive_protocol_defs::AdditionalSenseCode;
use drive_protocol_defs::DescriptorSenseHeader;
use drive_protocol_defs::FixedSenseData;
use drive_protocol_defs::InformationDescriptor;
use drive_protocol_defs::PortStatus;
use drive_protocol_defs::ScsiOp;
use drive_protocol_defs::ScsiStatus;
use drive_protocol_defs::SenseDescriptorType;
use drive_protocol_defs::SenseKey;
use drive_protocol_defs::SenseResponseCode;
use drive_protocol_defs::sata::AtaError;
use zerocopy::IntoBytes;

/// What the interceptor did with a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Intercept {
    /// Send the command on to the drive unchanged.
    Forward,
    /// Send the rewritten command on to the drive, and call
    /// [`ShortenedWrite::complete`] when it completes.
    ForwardShortened(ShortenedWrite),
    /// The completion fields hold the injected result. Do not send the
    /// command.
    Completed,
    /// Swallow the command. It never completes.
    Dropped,
}

/// A command sent with fewer blocks than the initiator asked for. On
/// completion the original transfer length is put back and the command
/// fails with the record's sense, the way a drive reports an incomplete
/// write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShortenedWrite {
    /// The transfer length the initiator asked for.
    pub restore_blocks: u32,
    /// Port status of the completion.
    pub port_status: PortStatus,
    /// Sense key.
    pub sense_key: SenseKey,
    /// Additional sense code.
    pub asc: AdditionalSenseCode,
    /// Additional sense code qualifier.
    pub ascq: u8,
    /// First block that was not transferred.
    pub bad_lba: u64,
}

impl ShortenedWrite {
    /// Restores the CDB and overwrites the completion fields of `request`
    /// after the drive has completed it.
    pub fn complete(&self, request: &mut ScsiRequest<'_>) {
        if !cdb::set_transfer_blocks(request.cdb, request.cdb_len, self.restore_blocks) {
            tracing::warn!(
                blocks = self.restore_blocks,
                "could not restore transfer length"
            );
        }
        request.port_status = self.port_status;
        request.scsi_status = ScsiStatus::CHECK_CONDITION;
        write_sense(
            request.sense,
            self.sense_key,
            self.asc,
            self.ascq,
            self.bad_lba,
        );
    }
}

/// A SCSI command on its way to a drive, with the completion fields the
/// interceptor fills in.
#[derive(Debug)]
pub struct ScsiRequest<'a> {
    /// The drive.
    pub target: TargetId,
    /// The CDB. Rewritten in place while a record shortens the transfer.
    pub cdb: &'a mut [u8],
    /// The declared CDB length.
    pub cdb_len: usize,
    /// First scatter-list element of the data-out buffer, if any.
    pub data_out: Option<&'a [u8]>,
    /// Transport status of the completion.
    pub port_status: PortStatus,
    /// SCSI status of the completion.
    pub scsi_status: ScsiStatus,
    /// Sense buffer of the completion.
    pub sense: &'a mut [u8],
}

/// A SATA command on its way to a drive.
#[derive(Debug)]
pub struct FisRequest<'a> {
    /// The drive.
    pub target: TargetId,
    /// Host-to-device register frame.
    pub command: &'a [u8],
    /// Transport status of the completion.
    pub port_status: PortStatus,
    /// Device-to-host response frame of the completion.
    pub response: &'a mut [u8],
}

/// The fault sources consulted for one command. The store is consulted
/// first.
#[derive(Debug, Default, Copy, Clone)]
pub struct Interceptor<'a> {
    store: Option<&'a FaultStore>,
    engine: Option<&'a InjectionEngine>,
}

impl<'a> Interceptor<'a> {
    /// An interceptor that forwards everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consults the faulted blocks of the request's drive.
    pub fn with_store(mut self, store: &'a FaultStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Consults the injection records.
    pub fn with_engine(mut self, engine: &'a InjectionEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Runs a SCSI command past the fault sources.
    pub fn intercept_scsi(&self, request: &mut ScsiRequest<'_>) -> Intercept {
        let Some(&opcode) = request.cdb.first() else {
            return Intercept::Forward;
        };
        let descriptor = match cdb::extract(request.cdb, request.cdb_len, request.data_out) {
            Ok(descriptor) => descriptor,
            Err(ExtractError::NotAddressable(_)) => return Intercept::Forward,
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    opcode,
                    "not intercepting command"
                );
                return Intercept::Forward;
            }
        };

        if let Some(store) = self.store {
            if let Some(intercept) = store_scsi(store, request, &descriptor) {
                return intercept;
            }
        }

        let Some(engine) = self.engine else {
            return Intercept::Forward;
        };
        if MediaCommand::from_op(ScsiOp(opcode)) == Some(MediaCommand::ReassignBlocks) {
            engine.reassign(request.target, descriptor.lba);
        }
        let Some(fired) = engine.check(&CommandMatch {
            target: request.target,
            protocol: Protocol::Scsi,
            opcode,
            range: descriptor,
            cdb_len: request.cdb_len,
        }) else {
            return Intercept::Forward;
        };

        match fired.injection {
            Injection::Sense {
                port_status,
                sense_key,
                asc,
                ascq,
                bad_lba,
            } => {
                request.port_status = port_status;
                request.scsi_status = ScsiStatus::CHECK_CONDITION;
                write_sense(request.sense, sense_key, asc, ascq, bad_lba);
                Intercept::Completed
            }
            Injection::Port(status) => {
                request.port_status = status;
                Intercept::Completed
            }
            Injection::Drop => Intercept::Dropped,
            Injection::Shorten {
                blocks,
                restore_blocks,
                port_status,
                sense_key,
                asc,
                ascq,
                bad_lba,
            } => {
                if !cdb::set_transfer_blocks(request.cdb, request.cdb_len, blocks) {
                    tracing::warn!(handle = %fired.handle, blocks, "could not shorten command");
                    return Intercept::Forward;
                }
                Intercept::ForwardShortened(ShortenedWrite {
                    restore_blocks,
                    port_status,
                    sense_key,
                    asc,
                    ascq,
                    bad_lba,
                })
            }
            // Response frames only fire on SATA commands.
            Injection::Fis { .. } => Intercept::Forward,
        }
    }

    /// Runs a SATA command past the fault sources.
    pub fn intercept_fis(&self, request: &mut FisRequest<'_>) -> Intercept {
        let descriptor = match fis::extract(request.command) {
            Ok(descriptor) => descriptor,
            Err(ExtractError::NotAddressable(_)) => return Intercept::Forward,
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "not intercepting frame"
                );
                return Intercept::Forward;
            }
        };

        if let Some(store) = self.store {
            if let Some(intercept) = store_fis(store, request, &descriptor) {
                return intercept;
            }
        }

        let Some(engine) = self.engine else {
            return Intercept::Forward;
        };
        let Some(fired) = engine.check(&CommandMatch {
            target: request.target,
            protocol: Protocol::Sata,
            opcode: descriptor.opcode,
            range: descriptor,
            cdb_len: 0,
        }) else {
            return Intercept::Forward;
        };

        match fired.injection {
            Injection::Fis {
                port_status,
                response,
            } => {
                request.port_status = port_status;
                copy_into(request.response, &response);
                if port_status == PortStatus::SataNcqError {
                    fis::mirror_lba(request.command, request.response);
                }
                Intercept::Completed
            }
            Injection::Port(status) => {
                request.port_status = status;
                Intercept::Completed
            }
            Injection::Drop => Intercept::Dropped,
            Injection::Sense { .. } | Injection::Shorten { .. } => Intercept::Forward,
        }
    }
}

fn store_scsi(
    store: &FaultStore,
    request: &mut ScsiRequest<'_>,
    descriptor: &CommandDescriptor,
) -> Option<Intercept> {
    let op = ScsiOp(descriptor.opcode);
    if MediaCommand::from_op(op) == Some(MediaCommand::ReassignBlocks) {
        // The drive remaps the block, so the fault is gone.
        if store.clear(descriptor.lba, 1) != 0 {
            tracing::info!(
                target = request.target.0,
                lba = descriptor.lba,
                "reassign cleared faulted block"
            );
        }
        return None;
    }

    let record = store.find_overlap(
        descriptor.lba,
        u64::from(descriptor.block_count),
        KindFilter::AllKinds,
    )?;
    let (sense_key, asc, ascq) = record.kind.sense()?;
    tracing::debug!(
        target = request.target.0,
        lba = record.lba,
        kind = ?record.kind,
        "faulted block accessed"
    );
    request.port_status = PortStatus::Success;
    request.scsi_status = ScsiStatus::CHECK_CONDITION;
    write_sense(request.sense, sense_key, asc, ascq, record.lba);
    Some(Intercept::Completed)
}

/// ATA has no recovered-error report, so soft media faults pass through.
fn store_fis(
    store: &FaultStore,
    request: &mut FisRequest<'_>,
    descriptor: &CommandDescriptor,
) -> Option<Intercept> {
    let record = store.find_overlap(
        descriptor.lba,
        u64::from(descriptor.block_count),
        KindFilter::AllKinds,
    )?;
    let error = match record.kind {
        FaultKind::HardMedia => AtaError::new().with_unc(true),
        FaultKind::NotReady => AtaError::new().with_abrt(true),
        FaultKind::SoftMedia | FaultKind::Uninitialized => return None,
    };
    tracing::debug!(
        target = request.target.0,
        lba = record.lba,
        kind = ?record.kind,
        "faulted block accessed"
    );
    request.port_status = if fis::is_queued(request.command) {
        PortStatus::SataNcqError
    } else {
        PortStatus::Success
    };
    copy_into(request.response, &fis::build_response(error, record.lba));
    Some(Intercept::Completed)
}

/// Writes current sense reporting `lba`. Fixed format is used when the
/// address fits its four-byte information field, descriptor format
/// otherwise.
fn write_sense(
    buf: &mut [u8],
    sense_key: SenseKey,
    asc: AdditionalSenseCode,
    ascq: u8,
    lba: u64,
) {
    buf.fill(0);
    match u32::try_from(lba) {
        Ok(lba) => {
            let sense = FixedSenseData::new(sense_key, asc, ascq, Some(lba));
            copy_into(buf, sense.as_bytes());
        }
        Err(_) => {
            let information = InformationDescriptor {
                descriptor_type: SenseDescriptorType::INFORMATION,
                additional_length: InformationDescriptor::ADDITIONAL_LENGTH,
                valid: 0x80,
                reserved: 0,
                information: lba.into(),
            };
            let header = DescriptorSenseHeader {
                response_code: SenseResponseCode::DESCRIPTOR_CURRENT.0,
                sense_key: sense_key.0 & 0xf,
                additional_sense_code: asc,
                additional_sense_code_qualifier: ascq,
                reserved: [0; 3],
                additional_sense_length: size_of::<InformationDescriptor>() as u8,
            };
            let len = copy_into(buf, header.as_bytes());
            if let Some(rest) = buf.get_mut(len..) {
                copy_into(rest, information.as_bytes());
            }
        }
    }
}

/// Copies as much of `src` as fits. Returns the number of bytes copied.
fn copy_into(dst: &mut [u8], src: &[u8]) -> usize {
    let len = dst.len().min(src.len());
    dst[..len].copy_from_slice(&src[..len]);
    len
}

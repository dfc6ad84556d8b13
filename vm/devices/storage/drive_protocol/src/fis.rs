// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SATA register frames: address extraction from command frames and decoding
//! of response frames.

use crate::cdb::CommandDescriptor;
use crate::cdb::Direction;
use crate::cdb::ExtractError;
use crate::sense::DecodeError;
use drive_protocol_defs::sata::AtaCommand;
use drive_protocol_defs::sata::AtaError;
use drive_protocol_defs::sata::AtaStatus;
use drive_protocol_defs::sata::FIS_SIZE;
use drive_protocol_defs::sata::FisType;
use drive_protocol_defs::sata::H2dFlags;
use drive_protocol_defs::sata::RegisterD2h;
use drive_protocol_defs::sata::RegisterH2d;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Device register bit selecting LBA addressing.
const DEVICE_LBA: u8 = 0x40;

#[derive(Copy, Clone, PartialEq, Eq)]
enum Addressing {
    /// 28-bit LBA, 8-bit count, LBA 27:24 in the device register.
    Lba28,
    /// 48-bit LBA, 16-bit count.
    Lba48,
    /// 48-bit LBA, 16-bit count in the features registers.
    Queued,
}

fn media_command(command: AtaCommand) -> Option<(Addressing, Direction)> {
    let v = match command {
        AtaCommand::READ_DMA => (Addressing::Lba28, Direction::In),
        AtaCommand::WRITE_DMA => (Addressing::Lba28, Direction::Out),
        AtaCommand::READ_DMA_EXT => (Addressing::Lba48, Direction::In),
        AtaCommand::WRITE_DMA_EXT => (Addressing::Lba48, Direction::Out),
        AtaCommand::READ_VERIFY_SECTORS_EXT => (Addressing::Lba48, Direction::None),
        AtaCommand::WRITE_UNCORRECTABLE_EXT => (Addressing::Lba48, Direction::None),
        AtaCommand::READ_FPDMA_QUEUED => (Addressing::Queued, Direction::In),
        AtaCommand::WRITE_FPDMA_QUEUED => (Addressing::Queued, Direction::Out),
        _ => return None,
    };
    Some(v)
}

fn read_h2d(fis: &[u8]) -> Result<RegisterH2d, ExtractError> {
    let (frame, _) = RegisterH2d::read_from_prefix(fis).map_err(|_| ExtractError::Truncated {
        needed: FIS_SIZE,
        len: fis.len(),
    })?;
    if frame.fis_type != FisType::REGISTER_H2D {
        return Err(ExtractError::NotCommandFrame(frame.fis_type.0));
    }
    Ok(frame)
}

/// Extracts the addressed range from a host-to-device register FIS.
pub fn extract(fis: &[u8]) -> Result<CommandDescriptor, ExtractError> {
    let frame = read_h2d(fis)?;
    let (addressing, direction) =
        media_command(frame.command).ok_or(ExtractError::NotAddressable(frame.command.0))?;

    let (lba, block_count) = match addressing {
        Addressing::Lba28 => {
            let lba = u64::from_le_bytes([
                frame.lba_low,
                frame.lba_mid,
                frame.lba_high,
                frame.device & 0x0f,
                0,
                0,
                0,
                0,
            ]);
            let count = match frame.count {
                0 => 256,
                n => u32::from(n),
            };
            (lba, count)
        }
        Addressing::Lba48 | Addressing::Queued => {
            let lba = u64::from_le_bytes([
                frame.lba_low,
                frame.lba_mid,
                frame.lba_high,
                frame.lba_low_exp,
                frame.lba_mid_exp,
                frame.lba_high_exp,
                0,
                0,
            ]);
            let raw = if addressing == Addressing::Queued {
                u16::from_le_bytes([frame.features, frame.features_exp])
            } else {
                u16::from_le_bytes([frame.count, frame.count_exp])
            };
            let count = match raw {
                0 => 65536,
                n => u32::from(n),
            };
            (lba, count)
        }
    };

    Ok(CommandDescriptor {
        opcode: frame.command.0,
        lba,
        block_count,
        direction,
    })
}

/// Whether the frame is a native-command-queuing command.
pub fn is_queued(fis: &[u8]) -> bool {
    read_h2d(fis).is_ok_and(|frame| frame.command.is_queued())
}

/// Builds a 48-bit host-to-device command frame. For queued commands the
/// count goes in the features registers and `tag` in count bits 7:3.
pub fn build_command(command: AtaCommand, lba: u64, count: u16, tag: u8) -> [u8; FIS_SIZE] {
    let lba = lba.to_le_bytes();
    let [count_lo, count_hi] = count.to_le_bytes();
    let mut frame = RegisterH2d {
        fis_type: FisType::REGISTER_H2D,
        flags: H2dFlags::new().with_command(true),
        command,
        lba_low: lba[0],
        lba_mid: lba[1],
        lba_high: lba[2],
        device: DEVICE_LBA,
        lba_low_exp: lba[3],
        lba_mid_exp: lba[4],
        lba_high_exp: lba[5],
        ..FromZeros::new_zeroed()
    };
    if command.is_queued() {
        frame.features = count_lo;
        frame.features_exp = count_hi;
        frame.count = tag << 3;
    } else {
        frame.count = count_lo;
        frame.count_exp = count_hi;
    }
    let mut bytes = [0; FIS_SIZE];
    bytes.copy_from_slice(frame.as_bytes());
    bytes
}

/// The error register bit that decides a failed completion, in precedence
/// order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AtaErrorKind {
    /// UNC: uncorrectable data.
    Uncorrectable,
    /// ICRC: interface CRC error.
    InterfaceCrc,
    /// ABRT: command aborted.
    Aborted,
    /// IDNF: address not found.
    IdNotFound,
    /// ERR set with none of the above.
    Other,
}

/// A decoded device-to-host response frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FisResponse {
    /// Status register.
    pub status: AtaStatus,
    /// Error register.
    pub error: AtaError,
    /// The 48-bit LBA from the six address registers.
    pub lba: u64,
}

impl FisResponse {
    /// `None` when the error bit in status is clear.
    pub fn error_kind(&self) -> Option<AtaErrorKind> {
        if !self.status.err() {
            return None;
        }
        Some(Self::kind_of(self.error))
    }

    /// Picks the deciding bit of an error register.
    pub fn kind_of(error: AtaError) -> AtaErrorKind {
        if error.unc() {
            AtaErrorKind::Uncorrectable
        } else if error.icrc() {
            AtaErrorKind::InterfaceCrc
        } else if error.abrt() {
            AtaErrorKind::Aborted
        } else if error.idnf() {
            AtaErrorKind::IdNotFound
        } else {
            AtaErrorKind::Other
        }
    }
}

/// Decodes a device-to-host register FIS.
pub fn decode_response(frame: &[u8]) -> Result<FisResponse, DecodeError> {
    let (d2h, _) = RegisterD2h::read_from_prefix(frame).map_err(|_| DecodeError::Truncated {
        needed: FIS_SIZE,
        len: frame.len(),
    })?;
    if d2h.fis_type != FisType::REGISTER_D2H {
        return Err(DecodeError::WrongFisType(d2h.fis_type.0));
    }
    Ok(FisResponse {
        status: d2h.status,
        error: d2h.error,
        lba: d2h.lba(),
    })
}

/// Builds a response frame. The error bit in status is set when `error` is
/// non-zero.
pub fn build_response(error: AtaError, lba: u64) -> [u8; FIS_SIZE] {
    let lba = lba.to_le_bytes();
    let status = AtaStatus::new()
        .with_drdy(true)
        .with_dsc(true)
        .with_err(error.into_bits() != 0);
    let d2h = RegisterD2h {
        fis_type: FisType::REGISTER_D2H,
        flags: 0x40,
        status,
        error,
        lba_low: lba[0],
        lba_mid: lba[1],
        lba_high: lba[2],
        device: DEVICE_LBA,
        lba_low_exp: lba[3],
        lba_mid_exp: lba[4],
        lba_high_exp: lba[5],
        ..FromZeros::new_zeroed()
    };
    let mut bytes = [0; FIS_SIZE];
    bytes.copy_from_slice(d2h.as_bytes());
    bytes
}

/// Copies the six LBA registers of a command frame into a response frame at
/// the same offsets. Both frames use bytes 4-6 and 8-10 for the address.
pub fn mirror_lba(command: &[u8], response: &mut [u8]) {
    for range in [4..7, 8..11] {
        if let (Some(src), Some(dst)) = (command.get(range.clone()), response.get_mut(range)) {
            dst.copy_from_slice(src);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn queued_read_extraction() {
        let fis = build_command(AtaCommand::READ_FPDMA_QUEUED, 0x1234_5678_9abc, 16, 5);
        let d = extract(&fis).unwrap();
        assert_eq!(d.lba, 0x1234_5678_9abc);
        assert_eq!(d.block_count, 16);
        assert_eq!(d.direction, Direction::In);
        assert_eq!(fis[12], 5 << 3);
        assert!(is_queued(&fis));
    }

    #[test]
    fn ext_write_extraction() {
        let fis = build_command(AtaCommand::WRITE_DMA_EXT, 77, 0, 0);
        let d = extract(&fis).unwrap();
        assert_eq!(d.lba, 77);
        assert_eq!(d.block_count, 65536);
        assert_eq!(d.direction, Direction::Out);
        assert!(!is_queued(&fis));
    }

    #[test]
    fn lba28_extraction() {
        let mut fis = [0u8; FIS_SIZE];
        fis[0] = 0x27;
        fis[1] = 0x80;
        fis[2] = AtaCommand::READ_DMA.0;
        fis[4..7].copy_from_slice(&[0x01, 0x02, 0x03]);
        fis[7] = 0x40 | 0x0a;
        fis[12] = 8;
        let d = extract(&fis).unwrap();
        assert_eq!(d.lba, 0x0a03_0201);
        assert_eq!(d.block_count, 8);
    }

    #[test]
    fn non_media_commands() {
        let fis = build_command(AtaCommand::IDENTIFY_DEVICE, 0, 1, 0);
        assert_eq!(extract(&fis), Err(ExtractError::NotAddressable(0xec)));
        let mut not_h2d = fis;
        not_h2d[0] = 0x34;
        assert_eq!(extract(&not_h2d), Err(ExtractError::NotCommandFrame(0x34)));
        assert!(matches!(
            extract(&fis[..10]),
            Err(ExtractError::Truncated { .. })
        ));
    }

    #[test]
    fn response_error_precedence() {
        let frame = build_response(AtaError::new().with_unc(true).with_abrt(true), 9);
        let r = decode_response(&frame).unwrap();
        assert_eq!(r.error_kind(), Some(AtaErrorKind::Uncorrectable));
        assert_eq!(r.lba, 9);

        let frame = build_response(AtaError::new().with_icrc(true).with_abrt(true), 0);
        let r = decode_response(&frame).unwrap();
        assert_eq!(r.error_kind(), Some(AtaErrorKind::InterfaceCrc));

        let frame = build_response(AtaError::new(), 0);
        assert_eq!(decode_response(&frame).unwrap().error_kind(), None);
    }

    #[test]
    fn response_wrong_type() {
        let frame = build_command(AtaCommand::READ_DMA_EXT, 0, 1, 0);
        assert_eq!(decode_response(&frame), Err(DecodeError::WrongFisType(0x27)));
    }

    #[test]
    fn mirror_copies_address() {
        let command = build_command(AtaCommand::READ_FPDMA_QUEUED, 0xaabb_ccdd_eeff, 1, 0);
        let mut response = build_response(AtaError::new().with_unc(true), 0);
        mirror_lba(&command, &mut response);
        assert_eq!(decode_response(&response).unwrap().lba, 0xaabb_ccdd_eeff);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Extraction of the addressed range from SCSI command descriptor blocks, and
//! builders for the read/write family.

use drive_protocol_defs::Cdb6ReadWrite;
use drive_protocol_defs::Cdb10;
use drive_protocol_defs::Cdb16;
use drive_protocol_defs::CdbReassignBlocks;
use drive_protocol_defs::ReassignBlocksFlags;
use drive_protocol_defs::ReassignBlocksHeader;
use drive_protocol_defs::ScsiOp;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Data transfer direction of a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
    /// No data phase.
    None,
}

/// The address range and direction of a media command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Operation code, SCSI or ATA depending on the protocol.
    pub opcode: u8,
    /// First block addressed.
    pub lba: u64,
    /// Number of blocks addressed.
    pub block_count: u32,
    /// Transfer direction.
    pub direction: Direction,
}

impl CommandDescriptor {
    /// The last block addressed, inclusive. Equal to `lba` for zero-length
    /// commands.
    pub fn last_lba(&self) -> u64 {
        self.lba
            .saturating_add(u64::from(self.block_count.max(1)))
            .saturating_sub(1)
    }

    /// Whether `lba` lies in `[self.lba, self.lba + block_count)`.
    pub fn contains(&self, lba: u64) -> bool {
        lba >= self.lba && lba - self.lba < u64::from(self.block_count)
    }
}

/// Failure to extract an address from a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// The declared CDB length is not 6, 10 or 16.
    #[error("unsupported cdb length {0}")]
    UnsupportedLength(usize),
    /// The buffer is shorter than the declared length.
    #[error("cdb buffer too short: need {needed} bytes, have {len}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        len: usize,
    },
    /// The command carries its address in a data buffer that was not given.
    #[error("command needs a data buffer to locate its address")]
    NoScatterList,
    /// The command does not address media.
    #[error("opcode {0:#x} does not address media")]
    NotAddressable(u8),
    /// A SATA frame that is not a host-to-device register FIS.
    #[error("fis type {0:#x} is not a command frame")]
    NotCommandFrame(u8),
}

/// The media command families the extractor understands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MediaCommand {
    /// READ(6/10/16).
    Read,
    /// WRITE(6/10/16).
    Write,
    /// VERIFY(10/16).
    Verify,
    /// WRITE AND VERIFY(10/16).
    WriteVerify,
    /// WRITE SAME(10/16).
    WriteSame,
    /// REASSIGN BLOCKS. The address is in the parameter list.
    ReassignBlocks,
}

impl MediaCommand {
    /// Maps an opcode to its family; `None` for status and administrative
    /// commands.
    pub fn from_op(op: ScsiOp) -> Option<Self> {
        let command = match op {
            ScsiOp::READ6 | ScsiOp::READ | ScsiOp::READ16 => Self::Read,
            ScsiOp::WRITE6 | ScsiOp::WRITE | ScsiOp::WRITE16 => Self::Write,
            ScsiOp::VERIFY | ScsiOp::VERIFY16 => Self::Verify,
            ScsiOp::WRITE_VERIFY | ScsiOp::WRITE_VERIFY16 => Self::WriteVerify,
            ScsiOp::WRITE_SAME | ScsiOp::WRITE_SAME16 => Self::WriteSame,
            ScsiOp::REASSIGN_BLOCKS => Self::ReassignBlocks,
            _ => return None,
        };
        Some(command)
    }

    /// Data direction for the family.
    pub fn direction(&self) -> Direction {
        match self {
            Self::Read => Direction::In,
            Self::Write | Self::WriteVerify | Self::WriteSame | Self::ReassignBlocks => {
                Direction::Out
            }
            Self::Verify => Direction::None,
        }
    }

    /// Whether the command writes to the media.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write | Self::WriteVerify | Self::WriteSame)
    }
}

/// Extracts the addressed range from a CDB.
///
/// `cdb` holds at least `cdb_len` bytes. `data_out` is the first element of
/// the command's scatter list, needed only for REASSIGN BLOCKS, whose address
/// is the first defect list entry (four or eight bytes big-endian, chosen by
/// the `long_lba` bit of the CDB).
pub fn extract(
    cdb: &[u8],
    cdb_len: usize,
    data_out: Option<&[u8]>,
) -> Result<CommandDescriptor, ExtractError> {
    let cdb = cdb.get(..cdb_len).ok_or(ExtractError::Truncated {
        needed: cdb_len,
        len: cdb.len(),
    })?;
    let op = ScsiOp(*cdb.first().ok_or(ExtractError::UnsupportedLength(0))?);
    let command = MediaCommand::from_op(op).ok_or(ExtractError::NotAddressable(op.0))?;
    if op.cdb_len() != Some(cdb_len) {
        return Err(ExtractError::UnsupportedLength(cdb_len));
    }

    let (lba, block_count) = if command == MediaCommand::ReassignBlocks {
        reassign_address(cdb, data_out)?
    } else {
        match cdb_len {
            6 => {
                let cdb = Cdb6ReadWrite::read_from_prefix(cdb)
                    .map_err(|_| ExtractError::UnsupportedLength(cdb_len))?
                    .0;
                let lba = (u64::from(cdb.logical_block_msb & 0x1f) << 16)
                    | u64::from(cdb.logical_block.get());
                // A zero transfer length means 256 blocks.
                let blocks = match cdb.transfer_blocks {
                    0 => 256,
                    n => u32::from(n),
                };
                (lba, blocks)
            }
            10 => {
                let cdb = Cdb10::read_from_prefix(cdb)
                    .map_err(|_| ExtractError::UnsupportedLength(cdb_len))?
                    .0;
                (
                    cdb.logical_block.get().into(),
                    cdb.transfer_blocks.get().into(),
                )
            }
            16 => {
                let cdb = Cdb16::read_from_prefix(cdb)
                    .map_err(|_| ExtractError::UnsupportedLength(cdb_len))?
                    .0;
                (cdb.logical_block.get(), cdb.transfer_blocks.get())
            }
            len => return Err(ExtractError::UnsupportedLength(len)),
        }
    };

    Ok(CommandDescriptor {
        opcode: op.0,
        lba,
        block_count,
        direction: command.direction(),
    })
}

fn reassign_address(cdb: &[u8], data_out: Option<&[u8]>) -> Result<(u64, u32), ExtractError> {
    let (header, _) = CdbReassignBlocks::read_from_prefix(cdb).map_err(|_| ExtractError::Truncated {
        needed: size_of::<CdbReassignBlocks>(),
        len: cdb.len(),
    })?;
    let data = data_out.ok_or(ExtractError::NoScatterList)?;
    let entry_offset = size_of::<ReassignBlocksHeader>();
    let entry_len = if header.flags.long_lba() { 8 } else { 4 };
    let entry = data
        .get(entry_offset..entry_offset + entry_len)
        .ok_or(ExtractError::Truncated {
            needed: entry_offset + entry_len,
            len: data.len(),
        })?;
    let lba = entry
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    Ok((lba, 1))
}

/// Failure to encode a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The opcode is not a read/write family opcode for any CDB length.
    #[error("opcode {0:#x} cannot be encoded as a read/write cdb")]
    UnsupportedOpcode(u8),
    /// The range does not fit the CDB chosen by the opcode.
    #[error("lba {lba:#x} with {blocks} blocks does not fit a {len} byte cdb")]
    OutOfRange {
        /// Requested LBA.
        lba: u64,
        /// Requested block count.
        blocks: u32,
        /// CDB length.
        len: usize,
    },
}

/// An encoded read/write CDB.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Cdb {
    bytes: [u8; 16],
    len: usize,
}

impl std::fmt::Debug for Cdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cdb").field(&self.as_bytes()).finish()
    }
}

impl Cdb {
    /// Encodes `op` with the range. The opcode's group decides the CDB
    /// length.
    pub fn new(op: ScsiOp, lba: u64, blocks: u32) -> Result<Self, EncodeError> {
        let len = match MediaCommand::from_op(op) {
            Some(MediaCommand::ReassignBlocks) | None => {
                return Err(EncodeError::UnsupportedOpcode(op.0));
            }
            Some(_) => op.cdb_len().ok_or(EncodeError::UnsupportedOpcode(op.0))?,
        };
        let out_of_range = EncodeError::OutOfRange { lba, blocks, len };
        let mut bytes = [0; 16];
        match len {
            6 => {
                if lba > Cdb6ReadWrite::MAX_LBA || blocks == 0 || blocks > 256 {
                    return Err(out_of_range);
                }
                let cdb = Cdb6ReadWrite {
                    operation_code: op,
                    logical_block_msb: (lba >> 16) as u8,
                    logical_block: (lba as u16).into(),
                    transfer_blocks: blocks as u8,
                    control: 0,
                };
                bytes[..6].copy_from_slice(cdb.as_bytes());
            }
            10 => {
                let lba = u32::try_from(lba).map_err(|_| out_of_range.clone())?;
                let blocks = u16::try_from(blocks).map_err(|_| out_of_range)?;
                let cdb = Cdb10 {
                    operation_code: op,
                    logical_block: lba.into(),
                    transfer_blocks: blocks.into(),
                    ..FromZeros::new_zeroed()
                };
                bytes[..10].copy_from_slice(cdb.as_bytes());
            }
            16 => {
                let cdb = Cdb16 {
                    operation_code: op,
                    logical_block: lba.into(),
                    transfer_blocks: blocks.into(),
                    ..FromZeros::new_zeroed()
                };
                bytes.copy_from_slice(cdb.as_bytes());
            }
            _ => return Err(EncodeError::UnsupportedOpcode(op.0)),
        }
        Ok(Self { bytes, len })
    }

    /// Encodes a read or write using the shortest CDB that can hold the
    /// range.
    pub fn read_write(direction: Direction, lba: u64, blocks: u32) -> Result<Self, EncodeError> {
        let ops = match direction {
            Direction::In => [ScsiOp::READ6, ScsiOp::READ, ScsiOp::READ16],
            Direction::Out => [ScsiOp::WRITE6, ScsiOp::WRITE, ScsiOp::WRITE16],
            Direction::None => [ScsiOp::VERIFY, ScsiOp::VERIFY, ScsiOp::VERIFY16],
        };
        let mut last = Err(EncodeError::UnsupportedOpcode(ops[0].0));
        for op in ops {
            last = Self::new(op, lba, blocks);
            if last.is_ok() {
                break;
            }
        }
        last
    }

    /// A REASSIGN BLOCKS CDB.
    pub fn reassign_blocks(long_lba: bool) -> Self {
        let mut bytes = [0; 16];
        bytes[0] = ScsiOp::REASSIGN_BLOCKS.0;
        bytes[1] = ReassignBlocksFlags::new()
            .with_long_lba(long_lba)
            .into_bits();
        Self { bytes, len: 6 }
    }

    /// The encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The CDB length.
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Rewrites the transfer length of a 10 or 16 byte CDB in place. Returns
/// false, leaving the CDB untouched, for other lengths or if `blocks` does
/// not fit.
pub fn set_transfer_blocks(cdb: &mut [u8], cdb_len: usize, blocks: u32) -> bool {
    match cdb_len {
        10 => match (u16::try_from(blocks), cdb.get_mut(7..9)) {
            (Ok(blocks), Some(field)) => {
                field.copy_from_slice(&blocks.to_be_bytes());
                true
            }
            _ => false,
        },
        16 => match cdb.get_mut(10..14) {
            Some(field) => {
                field.copy_from_slice(&blocks.to_be_bytes());
                true
            }
            None => false,
        },
        _ => false,
    }
}

/// The defect list parameter data for a single-entry REASSIGN BLOCKS.
pub fn reassign_parameter_list(lba: u64, long_lba: bool) -> Vec<u8> {
    let bytes = lba.to_be_bytes();
    let entry = if long_lba { &bytes[..] } else { &bytes[4..] };
    let header = ReassignBlocksHeader {
        reserved: [0; 2],
        defect_list_length: (entry.len() as u16).into(),
    };
    let mut data = header.as_bytes().to_vec();
    data.extend_from_slice(entry);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    fn check_round_trip(direction: Direction, lba: u64, blocks: u32, expected_len: usize) {
        let cdb = Cdb::read_write(direction, lba, blocks).unwrap();
        assert_eq!(cdb.len(), expected_len);
        let d = extract(cdb.as_bytes(), cdb.len(), None).unwrap();
        assert_eq!((d.lba, d.block_count, d.direction), (lba, blocks, direction));
    }

    #[test]
    fn six_byte_limits() {
        check_round_trip(Direction::In, Cdb6ReadWrite::MAX_LBA, 256, 6);
        check_round_trip(Direction::Out, 0, 1, 6);
        // One past the 21-bit limit moves to ten bytes.
        check_round_trip(Direction::In, Cdb6ReadWrite::MAX_LBA + 1, 1, 10);
    }

    #[test]
    fn ten_and_sixteen_byte_limits() {
        check_round_trip(Direction::Out, u32::MAX.into(), u16::MAX.into(), 10);
        check_round_trip(Direction::In, 0, u32::from(u16::MAX) + 1, 16);
        check_round_trip(Direction::In, u64::MAX, u32::MAX, 16);
        check_round_trip(Direction::None, 0x1_0000_0000, 8, 16);
    }

    #[test]
    fn six_byte_zero_length_is_256() {
        let cdb = [ScsiOp::READ6.0, 0x01, 0x02, 0x03, 0, 0];
        let d = extract(&cdb, 6, None).unwrap();
        assert_eq!(d.lba, 0x010203);
        assert_eq!(d.block_count, 256);
    }

    #[test]
    fn six_byte_ignores_reserved_lba_bits() {
        let cdb = [ScsiOp::WRITE6.0, 0xe1, 0x00, 0x00, 4, 0];
        assert_eq!(extract(&cdb, 6, None).unwrap().lba, 0x10000);
    }

    #[test]
    fn administrative_commands_are_not_addressable() {
        let cdb = [ScsiOp::INQUIRY.0, 0, 0, 0, 36, 0];
        assert_eq!(
            extract(&cdb, 6, None),
            Err(ExtractError::NotAddressable(0x12))
        );
        let cdb = [ScsiOp::TEST_UNIT_READY.0, 0, 0, 0, 0, 0];
        assert!(matches!(
            extract(&cdb, 6, None),
            Err(ExtractError::NotAddressable(_))
        ));
    }

    #[test]
    fn bad_lengths() {
        let cdb = [ScsiOp::READ.0; 12];
        assert_eq!(
            extract(&cdb, 12, None),
            Err(ExtractError::UnsupportedLength(12))
        );
        assert_eq!(
            extract(&cdb[..8], 10, None),
            Err(ExtractError::Truncated { needed: 10, len: 8 })
        );
    }

    #[test]
    fn reassign_reads_first_defect_entry() {
        for long_lba in [false, true] {
            let cdb = Cdb::reassign_blocks(long_lba);
            let data = reassign_parameter_list(0x0bad_cafe, long_lba);
            let d = extract(cdb.as_bytes(), cdb.len(), Some(&data)).unwrap();
            assert_eq!(d.lba, 0x0bad_cafe);
            assert_eq!(d.block_count, 1);
            assert_eq!(d.opcode, ScsiOp::REASSIGN_BLOCKS.0);
        }
    }

    #[test]
    fn reassign_without_data() {
        let cdb = Cdb::reassign_blocks(false);
        assert_eq!(
            extract(cdb.as_bytes(), cdb.len(), None),
            Err(ExtractError::NoScatterList)
        );
        let short = [0u8; 6];
        assert!(matches!(
            extract(cdb.as_bytes(), cdb.len(), Some(&short)),
            Err(ExtractError::Truncated { .. })
        ));
    }

    #[test]
    fn transfer_rewrite() {
        let mut cdb = Cdb::new(ScsiOp::WRITE, 100, 8).unwrap();
        let mut bytes = cdb.as_bytes().to_vec();
        assert!(set_transfer_blocks(&mut bytes, 10, 5));
        assert_eq!(extract(&bytes, 10, None).unwrap().block_count, 5);
        assert!(!set_transfer_blocks(&mut bytes, 10, 0x1_0000));

        cdb = Cdb::new(ScsiOp::WRITE16, 100, 8).unwrap();
        let mut bytes = cdb.as_bytes().to_vec();
        assert!(set_transfer_blocks(&mut bytes, 16, 3));
        assert_eq!(extract(&bytes, 16, None).unwrap().block_count, 3);
    }

    #[test]
    fn descriptor_ranges() {
        let d = CommandDescriptor {
            opcode: ScsiOp::READ.0,
            lba: 10,
            block_count: 4,
            direction: Direction::In,
        };
        assert_eq!(d.last_lba(), 13);
        assert!(d.contains(10));
        assert!(d.contains(13));
        assert!(!d.contains(14));
        assert!(!d.contains(9));
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the drive protocol layer: SCSI command blocks, sense
//! data layouts and the SATA register frames in [`sata`].

#![forbid(unsafe_code)]

/// Declares an open wire value: a transparent newtype over an integer with
/// named constants. Values with no name are still representable and print
/// as hex.
macro_rules! open_wire_enum {
    (
        $(#[$attr:meta])*
        $vis:vis enum $name:ident: $repr:ty {
            $($variant:ident = $value:expr,)*
        }
    ) => {
        $(#[$attr])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        $vis struct $name(pub $repr);

        impl $name {
            $(
                #[doc = concat!("`", stringify!($variant), "`")]
                pub const $variant: Self = Self($value);
            )*

            /// The constant name for this value, if it has one.
            pub fn name(&self) -> Option<&'static str> {
                $(
                    if *self == Self::$variant {
                        return Some(stringify!($variant));
                    }
                )*
                None
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self.name() {
                    Some(name) => f.write_str(name),
                    None => write!(f, "{}({:#x})", stringify!($name), self.0),
                }
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }
    };
}

pub mod sata;

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

type U16BE = zerocopy::byteorder::U16<zerocopy::byteorder::BigEndian>;
type U32BE = zerocopy::byteorder::U32<zerocopy::byteorder::BigEndian>;
type U64BE = zerocopy::byteorder::U64<zerocopy::byteorder::BigEndian>;

/// Size of the sense buffer attached to every command. Sense data longer than
/// this is malformed.
pub const SENSE_BUFFER_SIZE: usize = 48;

open_wire_enum! {
    /// SCSI operation codes the drive layer issues or inspects.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum ScsiOp: u8 {
        TEST_UNIT_READY = 0x00,
        REQUEST_SENSE = 0x03,
        FORMAT_UNIT = 0x04,
        REASSIGN_BLOCKS = 0x07,
        READ6 = 0x08,
        WRITE6 = 0x0A,
        INQUIRY = 0x12,
        MODE_SELECT = 0x15,
        MODE_SENSE = 0x1A,
        START_STOP_UNIT = 0x1B,
        RECEIVE_DIAGNOSTIC = 0x1C,
        SEND_DIAGNOSTIC = 0x1D,
        READ_CAPACITY = 0x25,
        READ = 0x28,
        WRITE = 0x2A,
        WRITE_VERIFY = 0x2E,
        VERIFY = 0x2F,
        SYNCHRONIZE_CACHE = 0x35,
        WRITE_DATA_BUFF = 0x3B,
        READ_DATA_BUFF = 0x3C,
        WRITE_SAME = 0x41,
        LOG_SELECT = 0x4C,
        LOG_SENSE = 0x4D,
        MODE_SELECT10 = 0x55,
        MODE_SENSE10 = 0x5A,
        READ16 = 0x88,
        WRITE16 = 0x8A,
        WRITE_VERIFY16 = 0x8E,
        VERIFY16 = 0x8F,
        WRITE_SAME16 = 0x93,
        SERVICE_ACTION_IN16 = 0x9E,
        REPORT_LUNS = 0xA0,
        READ12 = 0xA8,
        WRITE12 = 0xAA,
    }
}

impl ScsiOp {
    /// The CDB length implied by the opcode's group code, for the groups that
    /// have a fixed length.
    pub fn cdb_len(&self) -> Option<usize> {
        match self.0 >> 5 {
            0 => Some(6),
            1 | 2 => Some(10),
            4 => Some(16),
            5 => Some(12),
            _ => None,
        }
    }
}

open_wire_enum! {
    /// SCSI status byte returned with a completion.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum ScsiStatus: u8 {
        GOOD = 0x00,
        CHECK_CONDITION = 0x02,
        CONDITION_MET = 0x04,
        BUSY = 0x08,
        INTERMEDIATE = 0x10,
        INTERMEDIATE_COND_MET = 0x14,
        RESERVATION_CONFLICT = 0x18,
        COMMAND_TERMINATED = 0x22,
        TASK_SET_FULL = 0x28,
        ACA_ACTIVE = 0x30,
        TASK_ABORTED = 0x40,
    }
}

/// Request status reported by the port (transport) for a command, before
/// any device status is considered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PortStatus {
    /// The command reached the device and the device answered.
    Success,
    /// The port rejected the request as malformed.
    InvalidRequest,
    /// The port ran out of resources to issue the request.
    InsufficientResources,
    /// The target is not logged in.
    NotLoggedIn,
    /// The port is busy.
    Busy,
    /// A transport protocol violation.
    ProtocolError,
    /// Aborting a timed-out command itself timed out.
    AbortTimeout,
    /// The target did not respond to selection.
    SelectionTimeout,
    /// A transient transport failure.
    TransientError,
    /// The device returned more data than requested.
    DataOverrun,
    /// The device returned less data than requested.
    DataUnderrun,
    /// The host aborted the command.
    AbortedBySoftware,
    /// The device or expander aborted the command.
    AbortedByDevice,
    /// The command was aborted as a side effect of another abort.
    IncidentalAbort,
    /// The command required encryption that is not enabled on the port.
    EncryptionNotEnabled,
    /// The encryption key handle is invalid.
    EncryptionBadHandle,
    /// Unwrapping the encryption key failed.
    EncryptionKeyWrapError,
    /// A queued SATA command failed; the device error is in the response
    /// frame.
    SataNcqError,
}

open_wire_enum! {
    /// Sense key, the primary classification field of sense data.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum SenseKey: u8 {
        NO_SENSE = 0x00,
        RECOVERED_ERROR = 0x01,
        NOT_READY = 0x02,
        MEDIUM_ERROR = 0x03,
        HARDWARE_ERROR = 0x04,
        ILLEGAL_REQUEST = 0x05,
        UNIT_ATTENTION = 0x06,
        DATA_PROTECT = 0x07,
        BLANK_CHECK = 0x08,
        VENDOR_SPECIFIC = 0x09,
        COPY_ABORTED = 0x0A,
        ABORTED_COMMAND = 0x0B,
        EQUAL = 0x0C,
        VOL_OVERFLOW = 0x0D,
        MISCOMPARE = 0x0E,
        RESERVED = 0x0F,
    }
}

open_wire_enum! {
    /// Response code in byte 0 of sense data, with the valid bit masked off.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum SenseResponseCode: u8 {
        FIXED_CURRENT = 0x70,
        FIXED_DEFERRED = 0x71,
        DESCRIPTOR_CURRENT = 0x72,
        DESCRIPTOR_DEFERRED = 0x73,
    }
}

impl SenseResponseCode {
    /// Bit 7 of byte 0 in fixed format: the information field is valid.
    pub const VALID: u8 = 0x80;
    /// Mask selecting the response code from byte 0.
    pub const MASK: u8 = 0x7f;

    /// Whether this is one of the descriptor format codes.
    pub fn is_descriptor(&self) -> bool {
        *self == Self::DESCRIPTOR_CURRENT || *self == Self::DESCRIPTOR_DEFERRED
    }

    /// Whether the error is deferred, i.e. it belongs to an earlier command.
    pub fn is_deferred(&self) -> bool {
        *self == Self::FIXED_DEFERRED || *self == Self::DESCRIPTOR_DEFERRED
    }
}

open_wire_enum! {
    /// Additional sense codes the classifiers distinguish.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum AdditionalSenseCode: u8 {
        NO_ADDITIONAL_SENSE = 0x00,
        WRITE_FAULT = 0x03,
        LUN_NOT_READY = 0x04,
        LUN_COMMUNICATION = 0x08,
        WARNING = 0x0B,
        WRITE_ERROR = 0x0C,
        ID_CRC_ERROR = 0x10,
        UNRECOVERED_READ_ERROR = 0x11,
        ID_ADDRESS_MARK_MISSING = 0x12,
        RECORD_NOT_FOUND = 0x14,
        SEEK_ERROR = 0x15,
        DATA_SYNC_MARK_MISSING = 0x16,
        RECOVERED_WITH_RETRIES = 0x17,
        RECOVERED_WITH_ECC = 0x18,
        DEFECT_LIST_ERROR = 0x19,
        PRIMARY_LIST_MISSING = 0x1C,
        ILLEGAL_COMMAND = 0x20,
        ILLEGAL_BLOCK = 0x21,
        INVALID_CDB = 0x24,
        INVALID_LUN = 0x25,
        WRITE_PROTECT = 0x27,
        POWER_ON_RESET = 0x29,
        PARAMETERS_CHANGED = 0x2A,
        COMMAND_SEQUENCE_ERROR = 0x2C,
        FORMAT_CORRUPTED = 0x31,
        NO_DEFECT_SPARE = 0x32,
        LOGICAL_UNIT_FAILURE = 0x3E,
        INTERNAL_TARGET_FAILURE = 0x44,
        INTERFACE_PARITY_ERROR = 0x47,
        DATA_PHASE_ERROR = 0x4B,
        LUN_FAILED_SELF_CONFIGURATION = 0x4C,
        SPINDLE_SYNC_CHANGE = 0x5C,
        FAILURE_PREDICTION = 0x5D,
        GENERAL_FIRMWARE_ERROR = 0x80,
        VENDOR_FF = 0xFF,
    }
}

/// Additional sense code qualifiers, grouped by the ASC they qualify.
pub mod ascq {
    /// Qualifier zero, used as "no further detail" for every ASC.
    pub const GENERAL: u8 = 0x00;

    /// LUN_NOT_READY: in process of becoming ready.
    pub const BECOMING_READY: u8 = 0x01;
    /// LUN_NOT_READY: initializing command required (spindle stopped).
    pub const NOT_SPINNING: u8 = 0x02;
    /// LUN_NOT_READY: format in progress.
    pub const FORMAT_IN_PROGRESS: u8 = 0x04;
    /// LUN_NOT_READY: notify (enable spinup) required.
    pub const NOTIFY_ENABLE_SPINUP: u8 = 0x11;

    /// WARNING: specified temperature exceeded.
    pub const TEMPERATURE_EXCEEDED: u8 = 0x01;

    /// SPINDLE_SYNC_CHANGE: spindles synchronized.
    pub const SYNC_SUCCESS: u8 = 0x01;
    /// SPINDLE_SYNC_CHANGE: spindles not synchronized.
    pub const SYNC_FAIL: u8 = 0x02;

    /// VENDOR_FF: selection id error variant.
    pub const SELECTION_ID_ERROR: u8 = 0xFE;

    /// GENERAL_FIRMWARE_ERROR: SMART trip reported by flash drives.
    pub const SMART_TRIP: u8 = 0x33;
    /// GENERAL_FIRMWARE_ERROR: wear-out SMART trip reported by flash drives.
    pub const SMART_WEAR_TRIP: u8 = 0x4B;
}

/// Header of fixed-format sense data.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FixedSenseData {
    /// Response code with [`SenseResponseCode::VALID`] in the high bit.
    pub response_code: u8,
    /// Obsolete segment number.
    pub segment_number: u8,
    /// Sense key in the low nibble; filemark, EOM and ILI above it.
    pub flags_sense_key: u8,
    /// Information field, the failing LBA for media errors.
    pub information: U32BE,
    /// Number of bytes that follow this field.
    pub additional_sense_length: u8,
    /// Command specific information.
    pub command_specific_information: [u8; 4],
    /// Additional sense code.
    pub additional_sense_code: AdditionalSenseCode,
    /// Additional sense code qualifier.
    pub additional_sense_code_qualifier: u8,
    /// Field replaceable unit code.
    pub field_replaceable_unit_code: u8,
    /// Sense key specific bytes.
    pub sense_key_specific: [u8; 3],
}

const_assert_eq!(size_of::<FixedSenseData>(), 18);

impl FixedSenseData {
    /// Builds current fixed-format sense. When `information` is provided the
    /// valid bit is set and the value is stored in the information field.
    pub fn new(
        sense_key: SenseKey,
        additional_sense_code: AdditionalSenseCode,
        additional_sense_code_qualifier: u8,
        information: Option<u32>,
    ) -> Self {
        let valid = if information.is_some() {
            SenseResponseCode::VALID
        } else {
            0
        };
        FixedSenseData {
            response_code: SenseResponseCode::FIXED_CURRENT.0 | valid,
            segment_number: 0,
            flags_sense_key: sense_key.0 & 0xf,
            information: information.unwrap_or(0).into(),
            additional_sense_length: (size_of::<Self>() - 8) as u8,
            command_specific_information: [0; 4],
            additional_sense_code,
            additional_sense_code_qualifier,
            field_replaceable_unit_code: 0,
            sense_key_specific: [0; 3],
        }
    }

    /// The sense key nibble.
    pub fn sense_key(&self) -> SenseKey {
        SenseKey(self.flags_sense_key & 0xf)
    }
}

/// Header of descriptor-format sense data. The descriptor chain follows.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DescriptorSenseHeader {
    /// Response code (0x72 or 0x73).
    pub response_code: u8,
    /// Sense key in the low nibble.
    pub sense_key: u8,
    /// Additional sense code.
    pub additional_sense_code: AdditionalSenseCode,
    /// Additional sense code qualifier.
    pub additional_sense_code_qualifier: u8,
    /// Reserved.
    pub reserved: [u8; 3],
    /// Total length of the descriptor chain.
    pub additional_sense_length: u8,
}

const_assert_eq!(size_of::<DescriptorSenseHeader>(), 8);

open_wire_enum! {
    /// Descriptor types found in descriptor-format sense data.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum SenseDescriptorType: u8 {
        INFORMATION = 0x00,
        COMMAND_SPECIFIC = 0x01,
        SENSE_KEY_SPECIFIC = 0x02,
        FIELD_REPLACEABLE_UNIT = 0x03,
        BLOCK_COMMANDS = 0x05,
        ATA_STATUS_RETURN = 0x09,
    }
}

/// The information descriptor, which carries the failing LBA.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InformationDescriptor {
    /// [`SenseDescriptorType::INFORMATION`].
    pub descriptor_type: SenseDescriptorType,
    /// Bytes following this field, 0x0A.
    pub additional_length: u8,
    /// Bit 7 marks the information field valid.
    pub valid: u8,
    /// Reserved.
    pub reserved: u8,
    /// The information field.
    pub information: U64BE,
}

const_assert_eq!(size_of::<InformationDescriptor>(), 12);

impl InformationDescriptor {
    /// Bytes following the additional length field.
    pub const ADDITIONAL_LENGTH: u8 = 0x0A;
}

/// Six-byte read/write CDB. The LBA is 21 bits.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb6ReadWrite {
    /// Operation code.
    pub operation_code: ScsiOp,
    /// Bits 20:16 of the LBA in the low five bits.
    pub logical_block_msb: u8,
    /// Bits 15:0 of the LBA.
    pub logical_block: U16BE,
    /// Transfer length; zero means 256 blocks.
    pub transfer_blocks: u8,
    /// Control byte.
    pub control: u8,
}

impl Cdb6ReadWrite {
    /// The largest LBA a six-byte CDB can carry.
    pub const MAX_LBA: u64 = 0x1f_ffff;
}

/// Ten-byte CDB for read, write, verify and friends.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb10 {
    /// Operation code.
    pub operation_code: ScsiOp,
    /// Flags.
    pub flags: CdbFlags,
    /// LBA.
    pub logical_block: U32BE,
    /// Group number.
    pub group: u8,
    /// Transfer length in blocks.
    pub transfer_blocks: U16BE,
    /// Control byte.
    pub control: u8,
}

/// Sixteen-byte CDB for read, write, verify and friends.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb16 {
    /// Operation code.
    pub operation_code: ScsiOp,
    /// Flags.
    pub flags: CdbFlags,
    /// LBA.
    pub logical_block: U64BE,
    /// Transfer length in blocks.
    pub transfer_blocks: U32BE,
    /// Group number.
    pub group: u8,
    /// Control byte.
    pub control: u8,
}

/// Byte 1 of ten- and sixteen-byte read/write CDBs.
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbFlags {
    #[bits(1)]
    _reserved0: u8,
    /// Byte check for verify commands.
    pub byte_check: bool,
    #[bits(1)]
    _reserved1: u8,
    /// Force unit access.
    pub fua: bool,
    /// Disable page out.
    pub dpo: bool,
    /// Protection information handling.
    #[bits(3)]
    pub protection: u8,
}

/// REASSIGN BLOCKS CDB. The addresses to reassign travel in the data-out
/// buffer, not in the CDB.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbReassignBlocks {
    /// [`ScsiOp::REASSIGN_BLOCKS`].
    pub operation_code: ScsiOp,
    /// List format flags.
    pub flags: ReassignBlocksFlags,
    /// Reserved.
    pub reserved: [u8; 3],
    /// Control byte.
    pub control: u8,
}

/// Byte 1 of the REASSIGN BLOCKS CDB.
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReassignBlocksFlags {
    /// The defect list length in the header is four bytes rather than two.
    pub long_list: bool,
    /// Each defect list entry is an eight-byte LBA rather than four.
    pub long_lba: bool,
    #[bits(6)]
    _reserved: u8,
}

/// Header of the REASSIGN BLOCKS parameter list when `long_list` is clear.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReassignBlocksHeader {
    /// Reserved.
    pub reserved: [u8; 2],
    /// Length of the defect list in bytes.
    pub defect_list_length: U16BE,
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SATA register frame layouts and ATA command/status definitions.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Size of a register FIS in either direction.
pub const FIS_SIZE: usize = 20;

open_wire_enum! {
    /// FIS type byte.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum FisType: u8 {
        REGISTER_H2D = 0x27,
        REGISTER_D2H = 0x34,
        DMA_ACTIVATE = 0x39,
        DMA_SETUP = 0x41,
        DATA = 0x46,
        BIST = 0x58,
        PIO_SETUP = 0x5F,
        SET_DEVICE_BITS = 0xA1,
    }
}

open_wire_enum! {
    /// ATA command opcodes carried in a host-to-device register FIS.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum AtaCommand: u8 {
        NOP = 0x00,
        READ_DMA_EXT = 0x25,
        READ_LOG_EXT = 0x2F,
        WRITE_DMA_EXT = 0x35,
        READ_VERIFY_SECTORS_EXT = 0x42,
        WRITE_UNCORRECTABLE_EXT = 0x45,
        READ_FPDMA_QUEUED = 0x60,
        WRITE_FPDMA_QUEUED = 0x61,
        EXECUTE_DEVICE_DIAGNOSTIC = 0x90,
        DOWNLOAD_MICROCODE = 0x92,
        SMART = 0xB0,
        READ_DMA = 0xC8,
        WRITE_DMA = 0xCA,
        CHECK_POWER_MODE = 0xE5,
        FLUSH_CACHE_EXT = 0xEA,
        IDENTIFY_DEVICE = 0xEC,
        SET_FEATURES = 0xEF,
        READ_NATIVE_MAX_ADDRESS_EXT = 0x27,
    }
}

impl AtaCommand {
    /// Whether the command is a native-command-queuing (FPDMA) command. These
    /// carry the transfer count in the features registers and the tag in the
    /// count register.
    pub fn is_queued(&self) -> bool {
        *self == Self::READ_FPDMA_QUEUED || *self == Self::WRITE_FPDMA_QUEUED
    }
}

/// Host-to-device register FIS.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RegisterH2d {
    /// [`FisType::REGISTER_H2D`].
    pub fis_type: FisType,
    /// Port multiplier port and the command bit.
    pub flags: H2dFlags,
    /// Command register.
    pub command: AtaCommand,
    /// Features 7:0. Count 7:0 for queued commands.
    pub features: u8,
    /// LBA 7:0.
    pub lba_low: u8,
    /// LBA 15:8.
    pub lba_mid: u8,
    /// LBA 23:16.
    pub lba_high: u8,
    /// Device register. Bit 6 selects LBA addressing.
    pub device: u8,
    /// LBA 31:24.
    pub lba_low_exp: u8,
    /// LBA 39:32.
    pub lba_mid_exp: u8,
    /// LBA 47:40.
    pub lba_high_exp: u8,
    /// Features 15:8. Count 15:8 for queued commands.
    pub features_exp: u8,
    /// Count 7:0. The NCQ tag in bits 7:3 for queued commands.
    pub count: u8,
    /// Count 15:8.
    pub count_exp: u8,
    /// Isochronous command completion.
    pub icc: u8,
    /// Device control register.
    pub control: u8,
    /// Auxiliary field.
    pub auxiliary: [u8; 4],
}

const_assert_eq!(size_of::<RegisterH2d>(), FIS_SIZE);

/// Byte 1 of the host-to-device register FIS.
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct H2dFlags {
    /// Port multiplier port.
    #[bits(4)]
    pub pm_port: u8,
    #[bits(3)]
    _reserved: u8,
    /// The frame updates the command register rather than device control.
    pub command: bool,
}

/// Device-to-host register FIS, the response frame for a completed command.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RegisterD2h {
    /// [`FisType::REGISTER_D2H`].
    pub fis_type: FisType,
    /// Port multiplier port and the interrupt bit.
    pub flags: u8,
    /// Status register.
    pub status: AtaStatus,
    /// Error register, meaningful when `status.err()` is set.
    pub error: AtaError,
    /// LBA 7:0.
    pub lba_low: u8,
    /// LBA 15:8.
    pub lba_mid: u8,
    /// LBA 23:16.
    pub lba_high: u8,
    /// Device register.
    pub device: u8,
    /// LBA 31:24.
    pub lba_low_exp: u8,
    /// LBA 39:32.
    pub lba_mid_exp: u8,
    /// LBA 47:40.
    pub lba_high_exp: u8,
    /// Reserved.
    pub reserved0: u8,
    /// Count 7:0.
    pub count: u8,
    /// Count 15:8.
    pub count_exp: u8,
    /// Reserved.
    pub reserved1: [u8; 6],
}

const_assert_eq!(size_of::<RegisterD2h>(), FIS_SIZE);

impl RegisterD2h {
    /// The 48-bit LBA assembled from the six address registers.
    pub fn lba(&self) -> u64 {
        u64::from_le_bytes([
            self.lba_low,
            self.lba_mid,
            self.lba_high,
            self.lba_low_exp,
            self.lba_mid_exp,
            self.lba_high_exp,
            0,
            0,
        ])
    }
}

/// ATA status register.
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct AtaStatus {
    /// An error occurred; see the error register.
    pub err: bool,
    /// Obsolete index bit.
    pub idx: bool,
    /// Obsolete corrected data bit.
    pub corr: bool,
    /// Data request.
    pub drq: bool,
    /// Deferred write error, or seek complete on older devices.
    pub dsc: bool,
    /// Device fault.
    pub df: bool,
    /// Device ready.
    pub drdy: bool,
    /// Busy.
    pub bsy: bool,
}

/// ATA error register.
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct AtaError {
    /// Address mark not found / command completion time out.
    pub amnf: bool,
    /// Track 0 not found / end of media.
    pub tk0nf: bool,
    /// Command aborted.
    pub abrt: bool,
    /// Media change request.
    pub mcr: bool,
    /// ID (address) not found.
    pub idnf: bool,
    /// Media changed.
    pub mc: bool,
    /// Uncorrectable data error.
    pub unc: bool,
    /// Interface CRC error.
    pub icrc: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn d2h_offsets() {
        let mut bytes = [0u8; FIS_SIZE];
        bytes[0] = 0x34;
        bytes[2] = 0x51;
        bytes[3] = 0x40;
        bytes[4..7].copy_from_slice(&[0x11, 0x22, 0x33]);
        bytes[8..11].copy_from_slice(&[0x44, 0x55, 0x66]);
        let fis = RegisterD2h::read_from_bytes(&bytes[..]).unwrap();
        assert!(fis.status.err());
        assert!(fis.error.unc());
        assert_eq!(fis.lba(), 0x6655_4433_2211);
    }

    #[test]
    fn error_register_bits() {
        assert_eq!(AtaError::new().with_unc(true).into_bits(), 0x40);
        assert_eq!(AtaError::new().with_icrc(true).into_bits(), 0x80);
        assert_eq!(AtaError::new().with_abrt(true).into_bits(), 0x04);
        assert_eq!(AtaError::new().with_idnf(true).into_bits(), 0x10);
    }
}

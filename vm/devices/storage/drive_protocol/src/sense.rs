// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Decoding of SCSI sense data, in both fixed and descriptor format.

use drive_protocol_defs::AdditionalSenseCode;
use drive_protocol_defs::DescriptorSenseHeader;
use drive_protocol_defs::FixedSenseData;
use drive_protocol_defs::InformationDescriptor;
use drive_protocol_defs::SENSE_BUFFER_SIZE;
use drive_protocol_defs::SenseDescriptorType;
use drive_protocol_defs::SenseKey;
use drive_protocol_defs::SenseResponseCode;
use thiserror::Error;
use zerocopy::FromBytes;

/// Offset of the ASCQ byte in fixed format; a fixed buffer must reach it.
const FIXED_MIN_LEN: usize = 14;

/// Failure to decode sense data or a response frame. Distinct from every
/// sense key: a buffer that fails to decode never reads as "no sense".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends before a required field.
    #[error("buffer too short: need {needed} bytes, have {len}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        len: usize,
    },
    /// The declared sense length exceeds the sense buffer.
    #[error("sense length {0} exceeds the {SENSE_BUFFER_SIZE} byte sense buffer")]
    SenseTooLong(usize),
    /// Byte 0 holds neither a fixed nor a descriptor format response code.
    #[error("unknown sense response code {0:#x}")]
    UnknownResponseCode(u8),
    /// A descriptor's declared length would not move the scan forward.
    #[error("sense descriptor at offset {offset} does not advance the scan")]
    DescriptorStalled {
        /// Offset of the offending descriptor.
        offset: usize,
    },
    /// A descriptor runs past the end of the sense data.
    #[error("sense descriptor at offset {offset} overruns sense length {len}")]
    DescriptorOverrun {
        /// Offset of the offending descriptor.
        offset: usize,
        /// Total sense length.
        len: usize,
    },
    /// An information descriptor with the wrong length.
    #[error("information descriptor at offset {offset} has length {len:#x}")]
    BadInformationDescriptor {
        /// Offset of the descriptor.
        offset: usize,
        /// Its declared additional length.
        len: u8,
    },
    /// A response frame with the wrong FIS type.
    #[error("unexpected FIS type {0:#x}")]
    WrongFisType(u8),
}

/// Which sense layout a buffer used.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SenseFormat {
    /// Fixed format (response codes 0x70 and 0x71).
    Fixed,
    /// Descriptor format (response codes 0x72 and 0x73).
    Descriptor,
}

/// The fields of decoded sense data that classification needs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SenseDescriptor {
    /// Sense key.
    pub sense_key: SenseKey,
    /// Additional sense code.
    pub additional_code: AdditionalSenseCode,
    /// Additional sense code qualifier.
    pub additional_code_qualifier: u8,
    /// Whether `bad_lba` was reported by the device.
    pub lba_valid: bool,
    /// The information field. Zero unless `lba_valid`.
    pub bad_lba: u64,
    /// The error belongs to an earlier command.
    pub deferred: bool,
    /// Layout the sense data was decoded from.
    pub format: SenseFormat,
}

impl SenseDescriptor {
    /// Builds a descriptor without an LBA, as found in current fixed sense.
    pub fn new(sense_key: SenseKey, asc: AdditionalSenseCode, ascq: u8) -> Self {
        Self {
            sense_key,
            additional_code: asc,
            additional_code_qualifier: ascq,
            lba_valid: false,
            bad_lba: 0,
            deferred: false,
            format: SenseFormat::Fixed,
        }
    }

    /// Attaches a valid bad LBA.
    pub fn with_bad_lba(self, lba: u64) -> Self {
        Self {
            lba_valid: true,
            bad_lba: lba,
            ..self
        }
    }

    /// The bad LBA if the device reported one.
    pub fn lba(&self) -> Option<u64> {
        self.lba_valid.then_some(self.bad_lba)
    }

    /// Sense key, ASC and ASCQ packed as `sk << 24 | asc << 16 | ascq << 8`,
    /// the form error logs record.
    pub fn packed(&self) -> u32 {
        (u32::from(self.sense_key.0 & 0xf) << 24)
            | (u32::from(self.additional_code.0) << 16)
            | (u32::from(self.additional_code_qualifier) << 8)
    }
}

/// Decodes a sense buffer.
///
/// The format is chosen from the response code in byte 0. The declared sense
/// length (eight header bytes plus the additional sense length) must fit both
/// the supplied buffer and the [`SENSE_BUFFER_SIZE`] limit.
pub fn decode(buf: &[u8]) -> Result<SenseDescriptor, DecodeError> {
    let first = *buf.first().ok_or(DecodeError::Truncated {
        needed: 1,
        len: 0,
    })?;
    let code = SenseResponseCode(first & SenseResponseCode::MASK);
    if code.is_descriptor() {
        decode_descriptor(buf, code)
    } else if code == SenseResponseCode::FIXED_CURRENT || code == SenseResponseCode::FIXED_DEFERRED
    {
        decode_fixed(buf, code)
    } else {
        Err(DecodeError::UnknownResponseCode(first))
    }
}

fn decode_fixed(buf: &[u8], code: SenseResponseCode) -> Result<SenseDescriptor, DecodeError> {
    if buf.len() < FIXED_MIN_LEN {
        return Err(DecodeError::Truncated {
            needed: FIXED_MIN_LEN,
            len: buf.len(),
        });
    }

    // Devices commonly return fewer than 18 bytes; the missing tail reads as
    // zero.
    let mut raw = [0u8; size_of::<FixedSenseData>()];
    let n = buf.len().min(raw.len());
    raw[..n].copy_from_slice(&buf[..n]);
    let (sense, _) = FixedSenseData::read_from_prefix(&raw[..]).map_err(|_| DecodeError::Truncated {
        needed: raw.len(),
        len: n,
    })?;

    let total = 8 + usize::from(sense.additional_sense_length);
    if total > SENSE_BUFFER_SIZE {
        return Err(DecodeError::SenseTooLong(total));
    }

    let lba_valid = sense.response_code & SenseResponseCode::VALID != 0;
    Ok(SenseDescriptor {
        sense_key: sense.sense_key(),
        additional_code: sense.additional_sense_code,
        additional_code_qualifier: sense.additional_sense_code_qualifier,
        lba_valid,
        bad_lba: if lba_valid {
            sense.information.get().into()
        } else {
            0
        },
        deferred: code.is_deferred(),
        format: SenseFormat::Fixed,
    })
}

fn decode_descriptor(
    buf: &[u8],
    code: SenseResponseCode,
) -> Result<SenseDescriptor, DecodeError> {
    let (header, _) =
        DescriptorSenseHeader::read_from_prefix(buf).map_err(|_| DecodeError::Truncated {
            needed: size_of::<DescriptorSenseHeader>(),
            len: buf.len(),
        })?;

    let total = size_of::<DescriptorSenseHeader>() + usize::from(header.additional_sense_length);
    if total > SENSE_BUFFER_SIZE {
        return Err(DecodeError::SenseTooLong(total));
    }
    if total > buf.len() {
        return Err(DecodeError::Truncated {
            needed: total,
            len: buf.len(),
        });
    }

    let mut descriptor = SenseDescriptor {
        sense_key: SenseKey(header.sense_key & 0xf),
        additional_code: header.additional_sense_code,
        additional_code_qualifier: header.additional_sense_code_qualifier,
        lba_valid: false,
        bad_lba: 0,
        deferred: code.is_deferred(),
        format: SenseFormat::Descriptor,
    };

    let mut cursor = DescriptorCursor::new(&buf[..total], size_of::<DescriptorSenseHeader>());
    while let Some((offset, descriptor_type, body)) = cursor.next_descriptor()? {
        if descriptor_type != SenseDescriptorType::INFORMATION {
            continue;
        }
        // `body` excludes the two-byte type/length prefix.
        if body.len() != usize::from(InformationDescriptor::ADDITIONAL_LENGTH) {
            return Err(DecodeError::BadInformationDescriptor {
                offset,
                len: body.len() as u8,
            });
        }
        let (info, _) = InformationDescriptor::read_from_prefix(&buf[offset..total]).map_err(
            |_| DecodeError::DescriptorOverrun { offset, len: total },
        )?;
        descriptor.lba_valid = info.valid & 0x80 != 0;
        if descriptor.lba_valid {
            descriptor.bad_lba = info.information.get();
        }
        break;
    }

    Ok(descriptor)
}

/// Walks a descriptor chain. The cursor only moves forward and never past the
/// end of its buffer; a step that would not move it is an error.
struct DescriptorCursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorCursor<'a> {
    fn new(buf: &'a [u8], offset: usize) -> Self {
        Self { buf, offset }
    }

    /// Returns the next descriptor as `(offset, type, body)`, or `None` at
    /// the end of the chain.
    fn next_descriptor(
        &mut self,
    ) -> Result<Option<(usize, SenseDescriptorType, &'a [u8])>, DecodeError> {
        let offset = self.offset;
        let rest = &self.buf[offset.min(self.buf.len())..];
        let (descriptor_type, len) = match rest {
            [] => return Ok(None),
            [descriptor_type, len, ..] => (*descriptor_type, usize::from(*len)),
            [_] => {
                return Err(DecodeError::DescriptorOverrun {
                    offset,
                    len: self.buf.len(),
                });
            }
        };
        // A zero length descriptor carries nothing and every defined
        // descriptor has a body; treat it as a chain that has stopped moving.
        if len == 0 {
            return Err(DecodeError::DescriptorStalled { offset });
        }
        let body = rest
            .get(2..2 + len)
            .ok_or(DecodeError::DescriptorOverrun {
                offset,
                len: self.buf.len(),
            })?;
        self.advance(2 + len)?;
        Ok(Some((offset, SenseDescriptorType(descriptor_type), body)))
    }

    fn advance(&mut self, n: usize) -> Result<(), DecodeError> {
        let next = self.offset + n;
        if next <= self.offset {
            return Err(DecodeError::DescriptorStalled {
                offset: self.offset,
            });
        }
        if next > self.buf.len() {
            return Err(DecodeError::DescriptorOverrun {
                offset: self.offset,
                len: self.buf.len(),
            });
        }
        self.offset = next;
        Ok(())
    }
}

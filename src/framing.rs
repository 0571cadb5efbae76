// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream framing.
//!
//! NAL units reach us either delimited by start codes (Annex B, as produced by most RTSP
//! depacketizers and elementary-stream files) or prefixed by a big-endian length field (the
//! "box" format used by MP4-style containers and required by hardware decoders). This module
//! detects which one a buffer uses and iterates over the NAL units of both.

use byteorder::BigEndian;
use byteorder::ByteOrder;
use thiserror::Error;

/// Location of an Annex B start code inside a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StartCode {
    /// Offset of the first byte of the start code.
    pub offset: usize,
    /// Either 3 (`00 00 01`) or 4 (`00 00 00 01`).
    pub len: usize,
}

impl StartCode {
    /// Offset of the first byte following the start code.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// How the NAL units of a buffer are delimited.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Framing {
    /// Start-code delimited. Carries the first start code found.
    AnnexB(StartCode),
    /// No start code anywhere in the buffer.
    LengthPrefixed,
}

/// Finds the first start code located at or after `from`.
///
/// A `00 00 01` pattern preceded by a zero byte inside the searched range is reported as a
/// 4-byte start code.
pub fn find_start_code(data: &[u8], from: usize) -> Option<StartCode> {
    let pos = from
        + data
            .get(from..)?
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])?;

    if pos > from && data[pos - 1] == 0x00 {
        Some(StartCode {
            offset: pos - 1,
            len: 4,
        })
    } else {
        Some(StartCode {
            offset: pos,
            len: 3,
        })
    }
}

/// Classifies `data`, scanning the whole buffer since configuration blobs may have leading
/// bytes before their first start code.
pub fn detect(data: &[u8]) -> Framing {
    match find_start_code(data, 0) {
        Some(start_code) => Framing::AnnexB(start_code),
        None => Framing::LengthPrefixed,
    }
}

/// Iterator over the NAL units of an Annex B buffer.
///
/// Yields the NAL payloads without their start codes. Bytes preceding the first start code,
/// trailing zero bytes and empty units are skipped.
pub struct AnnexBNalus<'a> {
    data: &'a [u8],
    next: Option<StartCode>,
}

impl<'a> AnnexBNalus<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next: find_start_code(data, 0),
        }
    }
}

impl<'a> Iterator for AnnexBNalus<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let start = self.next.take()?.end();
            let following = find_start_code(self.data, start);

            let mut end = following.map_or(self.data.len(), |sc| sc.offset);
            // Discard trailing_zero_8bits
            while end > start && self.data[end - 1] == 0x00 {
                end -= 1;
            }

            self.next = following;

            if end > start {
                return Some(&self.data[start..end]);
            }
        }
    }
}

/// Number of bytes encoding each NAL unit length in length-prefixed framing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum NalLengthSize {
    One = 1,
    Two = 2,
    #[default]
    Four = 4,
}

impl NalLengthSize {
    /// Builds the size from a `lengthSizeMinusOne` configuration record field.
    pub fn from_minus_one(value: u8) -> Option<Self> {
        Self::from_bytes(usize::from(value) + 1)
    }

    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Largest NAL unit whose length can be encoded with this size.
    pub fn max_nalu_len(self) -> usize {
        match self {
            Self::One => u8::MAX as usize,
            Self::Two => u16::MAX as usize,
            Self::Four => u32::MAX as usize,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("length field at offset {offset} is truncated")]
    TruncatedLength { offset: usize },
    #[error("NAL unit at offset {offset} is empty")]
    EmptyNalu { offset: usize },
    #[error("NAL unit at offset {offset} declares {declared} bytes but only {remaining} remain")]
    TruncatedNalu {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
}

/// Iterator over the NAL units of a length-prefixed buffer.
///
/// Zero lengths are errors: no encoder emits empty NAL units, while the zero bytes of Annex B
/// start codes read as such with 1- and 2-byte length fields. Stops after yielding the first
/// error.
pub struct LengthPrefixedNalus<'a> {
    data: &'a [u8],
    pos: usize,
    length_size: NalLengthSize,
    failed: bool,
}

impl<'a> LengthPrefixedNalus<'a> {
    pub fn new(data: &'a [u8], length_size: NalLengthSize) -> Self {
        Self {
            data,
            pos: 0,
            length_size,
            failed: false,
        }
    }
}

impl<'a> Iterator for LengthPrefixedNalus<'a> {
    type Item = Result<&'a [u8], FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }

        let offset = self.pos;
        let size = self.length_size.bytes();
        let Some(field) = self.data.get(offset..offset + size) else {
            self.failed = true;
            return Some(Err(FramingError::TruncatedLength { offset }));
        };

        let declared = BigEndian::read_uint(field, size) as usize;
        if declared == 0 {
            self.failed = true;
            return Some(Err(FramingError::EmptyNalu { offset }));
        }

        let start = offset + size;
        let remaining = self.data.len() - start;
        if declared > remaining {
            self.failed = true;
            return Some(Err(FramingError::TruncatedNalu {
                offset,
                declared,
                remaining,
            }));
        }

        self.pos = start + declared;
        Some(Ok(&self.data[start..self.pos]))
    }
}

/// Whether `data` is a well-formed sequence of length-prefixed NAL units.
pub fn is_length_prefixed(data: &[u8], length_size: NalLengthSize) -> bool {
    !data.is_empty() && LengthPrefixedNalus::new(data, length_size).all(|nalu| nalu.is_ok())
}

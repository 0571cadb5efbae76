// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conversion of access units to the length-prefixed framing expected by hardware decoders.

use byteorder::BigEndian;
use byteorder::ByteOrder;
use thiserror::Error;

use crate::framing::find_start_code;
use crate::framing::is_length_prefixed;
use crate::framing::AnnexBNalus;
use crate::framing::NalLengthSize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("access unit is empty")]
    Empty,
    #[error("no NAL unit found in Annex B access unit")]
    NoNalUnits,
    #[error("NAL unit of {len} bytes does not fit a {size}-byte length field")]
    NaluTooLarge { len: usize, size: usize },
}

/// Returns a copy of `data` in which every NAL unit is prefixed by its big-endian length
/// encoded on `length_size` bytes.
///
/// Access units that already are a well-formed sequence of `length_size` prefixed NAL units are
/// copied unchanged. Otherwise the whole buffer is probed for start codes, since some transports
/// prepend bytes before the first one; a buffer without any start code is assumed to be length
/// prefixed already and copied as well.
pub fn normalize(data: &[u8], length_size: NalLengthSize) -> Result<Vec<u8>, NormalizeError> {
    if data.is_empty() {
        return Err(NormalizeError::Empty);
    }

    // Checked first: a 4-byte length between 256 and 511 starts with `00 00 01`. Start codes
    // never parse as length-prefixed data since that takes non-empty units.
    if is_length_prefixed(data, length_size) || find_start_code(data, 0).is_none() {
        return Ok(data.to_vec());
    }

    annexb_to_length_prefixed(data, length_size)
}

/// Rewrites every start-code delimited NAL unit of `data` as `[length][NAL unit]`, in order.
/// Empty units are skipped.
pub fn annexb_to_length_prefixed(
    data: &[u8],
    length_size: NalLengthSize,
) -> Result<Vec<u8>, NormalizeError> {
    let size = length_size.bytes();
    let mut out = Vec::with_capacity(data.len() + size);
    let mut num_nalus = 0;

    for nalu in AnnexBNalus::new(data) {
        if nalu.len() > length_size.max_nalu_len() {
            return Err(NormalizeError::NaluTooLarge {
                len: nalu.len(),
                size,
            });
        }

        let mut field = [0u8; 4];
        BigEndian::write_uint(&mut field[..size], nalu.len() as u64, size);
        out.extend_from_slice(&field[..size]);
        out.extend_from_slice(nalu);
        num_nalus += 1;
    }

    if num_nalus == 0 {
        return Err(NormalizeError::NoNalUnits);
    }

    Ok(out)
}

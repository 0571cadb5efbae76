// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec tables.
//!
//! The pipeline handles H.264 and H.265 with the same code. Whatever differs between the two
//! (NAL header layout, the type numbers of parameter sets) is looked up through [`CodecKind`].

pub mod h264;
pub mod h265;

use std::fmt;
use std::str::FromStr;

/// The compressed format of a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecKind {
    H264,
    H265,
}

impl FromStr for CodecKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" | "avc" => Ok(CodecKind::H264),
            "h265" | "H265" | "hevc" => Ok(CodecKind::H265),
            _ => Err("unrecognized codec. Valid values: h264, h265"),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecKind::H264 => write!(f, "H.264"),
            CodecKind::H265 => write!(f, "H.265"),
        }
    }
}

/// The out-of-band parameter sets a decode session is created from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ParameterSetKind {
    Vps,
    Sps,
    Pps,
}

impl CodecKind {
    /// Size of the NAL unit header in bytes.
    pub fn nalu_header_len(self) -> usize {
        match self {
            CodecKind::H264 => 1,
            CodecKind::H265 => 2,
        }
    }

    /// Whether a session for this codec needs a video parameter set.
    pub fn requires_vps(self) -> bool {
        matches!(self, CodecKind::H265)
    }

    /// Returns the raw NAL unit type of `nalu`, which must start with its header.
    pub fn nalu_type(self, nalu: &[u8]) -> Option<u8> {
        let first = *nalu.first()?;
        match self {
            CodecKind::H264 => Some(first & 0x1f),
            CodecKind::H265 => Some((first & 0x7e) >> 1),
        }
    }

    /// Classifies a NAL unit given its raw type number.
    pub fn parameter_set_kind_of_type(self, nalu_type: u8) -> Option<ParameterSetKind> {
        match self {
            CodecKind::H264 => match h264::NaluType::n(nalu_type)? {
                h264::NaluType::Sps => Some(ParameterSetKind::Sps),
                h264::NaluType::Pps => Some(ParameterSetKind::Pps),
                _ => None,
            },
            CodecKind::H265 => match h265::NaluType::n(nalu_type)? {
                h265::NaluType::VpsNut => Some(ParameterSetKind::Vps),
                h265::NaluType::SpsNut => Some(ParameterSetKind::Sps),
                h265::NaluType::PpsNut => Some(ParameterSetKind::Pps),
                _ => None,
            },
        }
    }

    /// Classifies `nalu` as one of the parameter sets, if it is one.
    pub fn parameter_set_kind(self, nalu: &[u8]) -> Option<ParameterSetKind> {
        if nalu.len() < self.nalu_header_len() {
            return None;
        }

        self.parameter_set_kind_of_type(self.nalu_type(nalu)?)
    }

    /// Whether `nalu` carries coded picture data.
    pub fn is_vcl(self, nalu: &[u8]) -> bool {
        let Some(type_) = self.nalu_type(nalu) else {
            return false;
        };

        match self {
            CodecKind::H264 => h264::NaluType::n(type_).is_some_and(|t| t.is_slice()),
            CodecKind::H265 => type_ < h265::NaluType::VpsNut as u8,
        }
    }

    /// Whether `nalu` is the first slice of a picture, i.e. starts a new access unit.
    ///
    /// Both `first_mb_in_slice == 0` (coded as a single `1` bit) and
    /// `first_slice_segment_in_pic_flag` are the first bit after the NAL unit header.
    pub fn is_first_slice(self, nalu: &[u8]) -> bool {
        self.is_vcl(nalu)
            && nalu
                .get(self.nalu_header_len())
                .is_some_and(|byte| byte & 0x80 != 0)
    }
}

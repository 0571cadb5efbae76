// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter set extraction.
//!
//! Codec configuration data (the "extradata" of a demuxer) comes in one of two shapes:
//!
//! * a configuration record as stored in MP4 `avcC`/`hvcC` boxes (ISO/IEC 14496-15), which also
//!   specifies the size of the length fields used by the access units of the stream;
//! * a plain Annex B sequence of parameter set NAL units, in which case the access units are
//!   normalized to 4-byte length fields.
//!
//! [`ParameterSets::extract`] handles both and tries the other shape when the expected one does
//! not yield a usable set.

use bytes::Buf;
use bytes::BufMut;
use thiserror::Error;

use crate::codec::CodecKind;
use crate::codec::ParameterSetKind;
use crate::framing::AnnexBNalus;
use crate::framing::NalLengthSize;

/// First byte of both `avcC` and `hvcC` records.
const CONFIGURATION_VERSION: u8 = 1;

/// Size of the fixed part of an `hvcC` record, up to and including `lengthSizeMinusOne`.
const HVCC_HEADER_LEN: usize = 22;

/// `numOfSequenceParameterSets` is a 5-bit field.
const AVCC_MAX_SPS_COUNT: usize = 31;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParameterSetError {
    #[error("configuration record is truncated")]
    Truncated,
    #[error("unsupported configuration record version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid NAL length size field ({0} bytes)")]
    InvalidLengthSize(u8),
    #[error("insufficient parameter sets for {codec}: {vps} VPS, {sps} SPS, {pps} PPS")]
    Insufficient {
        codec: CodecKind,
        vps: usize,
        sps: usize,
        pps: usize,
    },
    #[error("cannot store {0} parameter sets of one kind in a configuration record")]
    TooMany(usize),
    #[error("cannot store a {0} bytes parameter set in a configuration record")]
    TooLarge(usize),
}

pub type Result<T> = std::result::Result<T, ParameterSetError>;

/// The out-of-band parameter sets of a stream, in encounter order.
///
/// Each entry is a complete NAL unit, header included, without start code or length prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterSets {
    pub codec: CodecKind,
    /// Video parameter sets. Always empty for H.264.
    pub vps: Vec<Vec<u8>>,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
    /// Length field size used by the access units decoded with these parameter sets.
    pub nal_length_size: NalLengthSize,
}

impl ParameterSets {
    pub fn new(codec: CodecKind) -> Self {
        Self {
            codec,
            vps: Vec::new(),
            sps: Vec::new(),
            pps: Vec::new(),
            nal_length_size: NalLengthSize::default(),
        }
    }

    /// Parses `extradata` into a complete set of parameter sets.
    ///
    /// Data starting with `0x01` is parsed as a configuration record first, anything else as
    /// Annex B first. If the first attempt fails the other one is tried, and the error of the
    /// first attempt is returned if both fail.
    pub fn extract(codec: CodecKind, extradata: &[u8]) -> Result<Self> {
        let boxed = extradata.first() == Some(&CONFIGURATION_VERSION);

        let primary = if boxed {
            Self::from_record(codec, extradata)
        } else {
            Self::from_annexb(codec, extradata)
        };

        let err = match primary {
            Ok(sets) => return Ok(sets),
            Err(err) => err,
        };

        log::debug!(
            "{} extradata is not a valid {}: {}, trying the alternate framing",
            codec,
            if boxed { "configuration record" } else { "Annex B blob" },
            err
        );

        let alternate = if boxed {
            Self::from_annexb(codec, extradata)
        } else {
            Self::from_record(codec, extradata)
        };

        alternate.map_err(|_| err)
    }

    /// Parses an `avcC` or `hvcC` configuration record, depending on `codec`.
    pub fn from_record(codec: CodecKind, data: &[u8]) -> Result<Self> {
        let sets = match codec {
            CodecKind::H264 => Self::parse_avcc(data)?,
            CodecKind::H265 => Self::parse_hvcc(data)?,
        };

        sets.check_complete()?;
        Ok(sets)
    }

    /// Collects the parameter sets of an Annex B blob. The NAL length size is set to 4.
    pub fn from_annexb(codec: CodecKind, data: &[u8]) -> Result<Self> {
        let sets = Self::from_nalus(codec, AnnexBNalus::new(data));
        sets.check_complete()?;
        Ok(sets)
    }

    /// Collects the parameter sets found in `nalus`, ignoring every other NAL unit. The result
    /// may be incomplete.
    pub fn from_nalus<'a, I>(codec: CodecKind, nalus: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut sets = Self::new(codec);

        for nalu in nalus {
            if let Some(kind) = codec.parameter_set_kind(nalu) {
                sets.push(kind, nalu.to_vec());
            }
        }

        sets
    }

    fn parse_avcc(data: &[u8]) -> Result<Self> {
        let mut buf = data;

        // configurationVersion, AVCProfileIndication, profile_compatibility,
        // AVCLevelIndication, lengthSizeMinusOne, numOfSequenceParameterSets.
        if buf.remaining() < 6 {
            return Err(ParameterSetError::Truncated);
        }

        let version = buf.get_u8();
        if version != CONFIGURATION_VERSION {
            return Err(ParameterSetError::UnsupportedVersion(version));
        }
        buf.advance(3);

        let mut sets = Self::new(CodecKind::H264);
        sets.nal_length_size = read_length_size(buf.get_u8())?;

        let num_sps = buf.get_u8() & 0x1f;
        for _ in 0..num_sps {
            sets.push(ParameterSetKind::Sps, read_parameter_set(&mut buf)?);
        }

        if !buf.has_remaining() {
            return Err(ParameterSetError::Truncated);
        }

        let num_pps = buf.get_u8();
        for _ in 0..num_pps {
            sets.push(ParameterSetKind::Pps, read_parameter_set(&mut buf)?);
        }

        // Any remaining bytes are the high profile extension, which we do not need.
        Ok(sets)
    }

    fn parse_hvcc(data: &[u8]) -> Result<Self> {
        if data.len() <= HVCC_HEADER_LEN {
            return Err(ParameterSetError::Truncated);
        }

        if data[0] != CONFIGURATION_VERSION {
            return Err(ParameterSetError::UnsupportedVersion(data[0]));
        }

        let mut sets = Self::new(CodecKind::H265);
        sets.nal_length_size = read_length_size(data[HVCC_HEADER_LEN - 1])?;

        let mut buf = &data[HVCC_HEADER_LEN..];
        let num_arrays = buf.get_u8();
        for _ in 0..num_arrays {
            if buf.remaining() < 3 {
                return Err(ParameterSetError::Truncated);
            }

            // array_completeness, reserved, NAL_unit_type
            let nalu_type = buf.get_u8() & 0x3f;
            let num_nalus = buf.get_u16();
            let kind = CodecKind::H265.parameter_set_kind_of_type(nalu_type);

            for _ in 0..num_nalus {
                let nalu = read_parameter_set(&mut buf)?;
                match kind {
                    Some(kind) => sets.push(kind, nalu),
                    None => log::debug!("skipping hvcC array entry of NAL type {}", nalu_type),
                }
            }
        }

        Ok(sets)
    }

    /// Appends `nalu` to the list of parameter sets of kind `kind`. Empty units are ignored.
    pub fn push(&mut self, kind: ParameterSetKind, nalu: Vec<u8>) {
        if nalu.is_empty() {
            return;
        }

        match kind {
            ParameterSetKind::Vps => self.vps.push(nalu),
            ParameterSetKind::Sps => self.sps.push(nalu),
            ParameterSetKind::Pps => self.pps.push(nalu),
        }
    }

    /// Whether a decode session can be created from these parameter sets.
    pub fn is_complete(&self) -> bool {
        self.check_complete().is_ok()
    }

    pub fn check_complete(&self) -> Result<()> {
        let vps_ok = !self.codec.requires_vps() || !self.vps.is_empty();

        if vps_ok && !self.sps.is_empty() && !self.pps.is_empty() {
            Ok(())
        } else {
            Err(ParameterSetError::Insufficient {
                codec: self.codec,
                vps: self.vps.len(),
                sps: self.sps.len(),
                pps: self.pps.len(),
            })
        }
    }

    /// Iterates over all parameter sets in the order a format description expects them: VPS,
    /// then SPS, then PPS.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.vps
            .iter()
            .chain(self.sps.iter())
            .chain(self.pps.iter())
            .map(Vec::as_slice)
    }

    /// Whether every parameter set of `other` is already part of `self`.
    pub fn covers(&self, other: &Self) -> bool {
        fn contains_all(ours: &[Vec<u8>], theirs: &[Vec<u8>]) -> bool {
            theirs.iter().all(|nalu| ours.contains(nalu))
        }

        self.codec == other.codec
            && contains_all(&self.vps, &other.vps)
            && contains_all(&self.sps, &other.sps)
            && contains_all(&self.pps, &other.pps)
    }

    /// Encodes these parameter sets as an `avcC` configuration record.
    pub fn to_avcc(&self) -> Result<Vec<u8>> {
        if self.sps.len() > AVCC_MAX_SPS_COUNT {
            return Err(ParameterSetError::TooMany(self.sps.len()));
        }
        if self.pps.len() > u8::MAX as usize {
            return Err(ParameterSetError::TooMany(self.pps.len()));
        }

        // profile_idc, constraint flags and level_idc follow the SPS NAL header.
        let profile = self
            .sps
            .first()
            .and_then(|sps| sps.get(1..4))
            .unwrap_or(&[0, 0, 0]);

        let mut out = Vec::new();
        out.put_u8(CONFIGURATION_VERSION);
        out.put_slice(profile);
        out.put_u8(0xfc | (self.nal_length_size.bytes() as u8 - 1));
        out.put_u8(0xe0 | self.sps.len() as u8);
        for sps in &self.sps {
            write_parameter_set(&mut out, sps)?;
        }
        out.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            write_parameter_set(&mut out, pps)?;
        }

        Ok(out)
    }

    /// Encodes these parameter sets as an `hvcC` configuration record.
    ///
    /// The general profile, tier and level fields are copied from the first SPS as they appear
    /// in the bitstream; the remaining informative fields are left at their neutral values.
    pub fn to_hvcc(&self) -> Result<Vec<u8>> {
        // profile_tier_level() starts after the 2-byte NAL header and one byte of SPS fields.
        let ptl = self
            .sps
            .first()
            .and_then(|sps| sps.get(3..15))
            .unwrap_or(&[0; 12]);

        let mut out = Vec::new();
        out.put_u8(CONFIGURATION_VERSION);
        out.put_slice(ptl);
        // min_spatial_segmentation_idc
        out.put_u16(0xf000);
        // parallelismType
        out.put_u8(0xfc);
        // chromaFormat: 4:2:0
        out.put_u8(0xfd);
        // bitDepthLumaMinus8, bitDepthChromaMinus8
        out.put_u8(0xf8);
        out.put_u8(0xf8);
        // avgFrameRate
        out.put_u16(0);
        // constantFrameRate, numTemporalLayers, temporalIdNested, lengthSizeMinusOne
        out.put_u8(self.nal_length_size.bytes() as u8 - 1);

        let arrays = [(32u8, &self.vps), (33, &self.sps), (34, &self.pps)];
        out.put_u8(arrays.iter().filter(|(_, list)| !list.is_empty()).count() as u8);

        for (nalu_type, list) in arrays.iter().filter(|(_, list)| !list.is_empty()) {
            if list.len() > u16::MAX as usize {
                return Err(ParameterSetError::TooMany(list.len()));
            }

            // array_completeness is set: all parameter sets of this type are in the array.
            out.put_u8(0x80 | nalu_type);
            out.put_u16(list.len() as u16);
            for nalu in list.iter() {
                write_parameter_set(&mut out, nalu)?;
            }
        }

        Ok(out)
    }

    /// Encodes these parameter sets as the configuration record matching their codec.
    pub fn to_record(&self) -> Result<Vec<u8>> {
        match self.codec {
            CodecKind::H264 => self.to_avcc(),
            CodecKind::H265 => self.to_hvcc(),
        }
    }
}

fn read_length_size(field: u8) -> Result<NalLengthSize> {
    let minus_one = field & 0x03;
    NalLengthSize::from_minus_one(minus_one)
        .ok_or(ParameterSetError::InvalidLengthSize(minus_one + 1))
}

/// Reads a 2-byte length prefixed parameter set.
fn read_parameter_set(buf: &mut impl Buf) -> Result<Vec<u8>> {
    if buf.remaining() < 2 {
        return Err(ParameterSetError::Truncated);
    }

    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(ParameterSetError::Truncated);
    }

    Ok(buf.copy_to_bytes(len).to_vec())
}

fn write_parameter_set(out: &mut impl BufMut, nalu: &[u8]) -> Result<()> {
    let len = u16::try_from(nalu.len()).map_err(|_| ParameterSetError::TooLarge(nalu.len()))?;
    out.put_u16(len);
    out.put_slice(nalu);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS_0: &[u8] = &[0x67, 0x42, 0xc0, 0x1e, 0xda, 0x02, 0x80, 0xbf, 0xe5];
    const SPS_1: &[u8] = &[0x67, 0x4d, 0x40, 0x28, 0x95, 0xa0];
    const PPS_0: &[u8] = &[0x68, 0xce, 0x3c, 0x80];

    const VPS_H265: &[u8] = &[0x40, 0x01, 0x0c, 0x01, 0xff, 0xff];
    const SPS_H265: &[u8] = &[
        0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00, 0x00,
        0x5d, 0xa0,
    ];
    const PPS_H265: &[u8] = &[0x44, 0x01, 0xc1, 0x72, 0xb4];

    fn avcc(length_size_minus_one: u8, sps: &[&[u8]], pps: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![0x01, 0x42, 0xc0, 0x1e, 0xfc | length_size_minus_one];
        out.push(0xe0 | sps.len() as u8);
        for nalu in sps {
            out.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
            out.extend_from_slice(nalu);
        }
        out.push(pps.len() as u8);
        for nalu in pps {
            out.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
            out.extend_from_slice(nalu);
        }
        out
    }

    fn h265_sets(nal_length_size: NalLengthSize) -> ParameterSets {
        ParameterSets {
            codec: CodecKind::H265,
            vps: vec![VPS_H265.to_vec()],
            sps: vec![SPS_H265.to_vec()],
            pps: vec![PPS_H265.to_vec()],
            nal_length_size,
        }
    }

    #[test]
    fn avcc_with_two_sps() {
        let record = avcc(3, &[SPS_0, SPS_1], &[PPS_0]);
        let sets = ParameterSets::extract(CodecKind::H264, &record).unwrap();

        assert_eq!(sets.sps, vec![SPS_0.to_vec(), SPS_1.to_vec()]);
        assert_eq!(sets.pps, vec![PPS_0.to_vec()]);
        assert!(sets.vps.is_empty());
        assert_eq!(sets.nal_length_size, NalLengthSize::Four);
    }

    #[test]
    fn avcc_length_size() {
        let record = avcc(1, &[SPS_0], &[PPS_0]);
        let sets = ParameterSets::extract(CodecKind::H264, &record).unwrap();
        assert_eq!(sets.nal_length_size, NalLengthSize::Two);

        let record = avcc(2, &[SPS_0], &[PPS_0]);
        assert_eq!(
            ParameterSets::from_record(CodecKind::H264, &record),
            Err(ParameterSetError::InvalidLengthSize(3))
        );
    }

    #[test]
    fn avcc_truncated() {
        let mut record = avcc(3, &[SPS_0], &[PPS_0]);
        record.truncate(record.len() - 2);
        assert_eq!(
            ParameterSets::extract(CodecKind::H264, &record),
            Err(ParameterSetError::Truncated)
        );
    }

    #[test]
    fn avcc_without_pps() {
        let record = avcc(3, &[SPS_0], &[]);
        assert_eq!(
            ParameterSets::extract(CodecKind::H264, &record),
            Err(ParameterSetError::Insufficient {
                codec: CodecKind::H264,
                vps: 0,
                sps: 1,
                pps: 0
            })
        );
    }

    #[test]
    fn annexb_extradata() {
        let mut extradata = vec![0x00, 0x00, 0x00, 0x01];
        extradata.extend_from_slice(SPS_0);
        extradata.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        extradata.extend_from_slice(PPS_0);

        let sets = ParameterSets::extract(CodecKind::H264, &extradata).unwrap();
        assert_eq!(sets.sps, vec![SPS_0.to_vec()]);
        assert_eq!(sets.pps, vec![PPS_0.to_vec()]);
        assert_eq!(sets.nal_length_size, NalLengthSize::Four);
    }

    #[test]
    fn annexb_extradata_with_leading_bytes() {
        let mut extradata = vec![0x01, 0x00, 0x00, 0x01];
        extradata.extend_from_slice(SPS_0);
        extradata.extend_from_slice(&[0x00, 0x00, 0x01]);
        extradata.extend_from_slice(PPS_0);

        // Starts with 0x01, is not a valid record, and is then found to be Annex B.
        let sets = ParameterSets::extract(CodecKind::H264, &extradata).unwrap();
        assert_eq!(sets.sps.len(), 1);
        assert_eq!(sets.pps.len(), 1);
    }

    #[test]
    fn annexb_extradata_missing_pps() {
        let mut extradata = vec![0x00, 0x00, 0x00, 0x01];
        extradata.extend_from_slice(SPS_0);

        assert!(matches!(
            ParameterSets::extract(CodecKind::H264, &extradata),
            Err(ParameterSetError::Insufficient { sps: 1, pps: 0, .. })
        ));
        assert!(ParameterSets::extract(CodecKind::H264, &[]).is_err());
    }

    #[test]
    fn hvcc_extradata() {
        let sets = h265_sets(NalLengthSize::Four);
        let record = sets.to_hvcc().unwrap();
        assert_eq!(record[0], 0x01);
        assert_eq!(record[21] & 0x03, 3);
        assert_eq!(record[22], 3);

        let parsed = ParameterSets::extract(CodecKind::H265, &record).unwrap();
        assert_eq!(parsed, sets);
    }

    #[test]
    fn hvcc_skips_unknown_arrays() {
        let mut record = h265_sets(NalLengthSize::Four).to_hvcc().unwrap();
        // Announce one more array, holding a prefix SEI.
        record[22] += 1;
        record.extend_from_slice(&[0x80 | 39, 0x00, 0x01, 0x00, 0x03, 0x4e, 0x01, 0x05]);

        let parsed = ParameterSets::extract(CodecKind::H265, &record).unwrap();
        assert_eq!(parsed, h265_sets(NalLengthSize::Four));
    }

    #[test]
    fn hvcc_requires_vps() {
        let mut sets = h265_sets(NalLengthSize::Four);
        sets.vps.clear();
        let record = sets.to_hvcc().unwrap();

        assert!(matches!(
            ParameterSets::extract(CodecKind::H265, &record),
            Err(ParameterSetError::Insufficient { vps: 0, sps: 1, pps: 1, .. })
        ));
    }

    #[test]
    fn annexb_h265_extradata() {
        let mut extradata = Vec::new();
        for nalu in [VPS_H265, SPS_H265, PPS_H265] {
            extradata.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
            extradata.extend_from_slice(nalu);
        }

        let sets = ParameterSets::extract(CodecKind::H265, &extradata).unwrap();
        assert_eq!(sets, h265_sets(NalLengthSize::Four));
    }

    #[test]
    fn record_round_trip_any_length_size() {
        for nal_length_size in [NalLengthSize::One, NalLengthSize::Two, NalLengthSize::Four] {
            let h264 = ParameterSets {
                codec: CodecKind::H264,
                vps: vec![],
                sps: vec![SPS_0.to_vec(), SPS_1.to_vec()],
                pps: vec![PPS_0.to_vec()],
                nal_length_size,
            };
            let record = h264.to_record().unwrap();
            assert_eq!(ParameterSets::extract(CodecKind::H264, &record).unwrap(), h264);

            let h265 = h265_sets(nal_length_size);
            let record = h265.to_record().unwrap();
            assert_eq!(ParameterSets::extract(CodecKind::H265, &record).unwrap(), h265);
        }
    }

    #[test]
    fn covers_subsets() {
        let full = ParameterSets {
            codec: CodecKind::H264,
            vps: vec![],
            sps: vec![SPS_0.to_vec(), SPS_1.to_vec()],
            pps: vec![PPS_0.to_vec()],
            nal_length_size: NalLengthSize::Four,
        };

        let mut repeated = ParameterSets::new(CodecKind::H264);
        repeated.push(ParameterSetKind::Sps, SPS_1.to_vec());
        repeated.push(ParameterSetKind::Pps, PPS_0.to_vec());
        assert!(full.covers(&repeated));
        assert!(!repeated.covers(&full));

        let mut changed = repeated.clone();
        changed.pps[0].push(0x80);
        assert!(!full.covers(&changed));

        let mut other_codec = repeated.clone();
        other_codec.codec = CodecKind::H265;
        assert!(!full.covers(&other_codec));
    }

    #[test]
    fn iterate_in_format_order() {
        let sets = h265_sets(NalLengthSize::Four);
        let all = sets.iter().collect::<Vec<_>>();
        assert_eq!(all, vec![VPS_H265, SPS_H265, PPS_H265]);
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-accelerated decoding of H.264 and H.265 streams.
//!
//! This crate takes the access units and codec configuration data produced by a demuxer, in
//! whichever NAL framing they come, and feeds them to an asynchronous hardware decoder:
//!
//! * [`framing`] detects Annex B start codes and iterates over NAL units;
//! * [`params`] extracts the parameter sets from `avcC`/`hvcC` records or Annex B blobs;
//! * [`normalize`] rewrites access units to the length-prefixed framing hardware decoders take;
//! * [`decoder`] manages the lifetime of the decode session and matches asynchronous
//!   completions with the timing of the access units they decode;
//! * [`backend`] abstracts the hardware decoder itself.

pub mod backend;
pub mod codec;
pub mod decoder;
pub mod framing;
pub mod normalize;
pub mod params;
pub mod timing;

use std::str::FromStr;

use anyhow::anyhow;

pub use codec::CodecKind;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Pixel format of decoded pictures.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            _ => Err("unrecognized output format. Valid values: nv12, i420"),
        }
    }
}

/// Returns the size required to store a frame of `format` with size `width`x`height`, without any
/// padding. This is the minimum size of the destination buffer passed to `copy_planes`.
pub fn decoded_frame_size(format: DecodedFormat, width: usize, height: usize) -> usize {
    match format {
        DecodedFormat::I420 | DecodedFormat::NV12 => {
            let y_size = width * height;
            // U and V planes need to be aligned to 2.
            let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;

            y_size + uv_size
        }
    }
}

/// Copies `height` rows of `width` bytes from `src` into the start of `dst`. Returns the number
/// of bytes written.
fn copy_plane(
    src: &[u8],
    stride: usize,
    dst: &mut [u8],
    width: usize,
    height: usize,
) -> anyhow::Result<usize> {
    if width == 0 || height == 0 {
        return Ok(0);
    }

    if stride < width || src.len() < stride * (height - 1) + width {
        return Err(anyhow!(
            "plane of {} bytes too small for {} rows of {} bytes with stride {}",
            src.len(),
            height,
            width,
            stride
        ));
    }

    let size = width * height;
    let dst = dst
        .get_mut(..size)
        .ok_or_else(|| anyhow!("destination buffer too small"))?;

    for (dst_row, src_row) in dst.chunks_exact_mut(width).zip(src.chunks(stride)) {
        dst_row.copy_from_slice(&src_row[..width]);
    }

    Ok(size)
}

/// Copies the planes of a picture of `format` into `dst`, removing any extra padding.
///
/// `planes` holds the data and stride of each plane: Y and interleaved UV for NV12, Y, U and V
/// for I420.
pub fn copy_planes(
    format: DecodedFormat,
    planes: &[(&[u8], usize)],
    dst: &mut [u8],
    resolution: Resolution,
) -> anyhow::Result<()> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    // Chroma planes are aligned to 2.
    let chroma_width = (width + 1) / 2;
    let chroma_height = (height + 1) / 2;

    let layout: &[(usize, usize)] = match format {
        DecodedFormat::NV12 => &[(width, height), (chroma_width * 2, chroma_height)],
        DecodedFormat::I420 => &[
            (width, height),
            (chroma_width, chroma_height),
            (chroma_width, chroma_height),
        ],
    };

    if planes.len() != layout.len() {
        return Err(anyhow!(
            "{:?} picture has {} planes, got {}",
            format,
            layout.len(),
            planes.len()
        ));
    }

    let mut offset = 0;
    for (&(src, stride), &(plane_width, plane_height)) in planes.iter().zip(layout) {
        let dst = dst
            .get_mut(offset..)
            .ok_or_else(|| anyhow!("destination buffer too small"))?;
        offset += copy_plane(src, stride, dst, plane_width, plane_height)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoded_format_from_str() {
        assert_eq!("nv12".parse(), Ok(DecodedFormat::NV12));
        assert_eq!("I420".parse(), Ok(DecodedFormat::I420));
        assert!("yuyv".parse::<DecodedFormat>().is_err());
    }

    #[test]
    fn frame_size_with_odd_dimensions() {
        assert_eq!(decoded_frame_size(DecodedFormat::NV12, 4, 2), 8 + 4);
        assert_eq!(decoded_frame_size(DecodedFormat::I420, 3, 3), 9 + 8);
    }

    #[test]
    fn nv12_copy_removes_padding() {
        // 4x2 picture, stride 6.
        let y = [1u8, 2, 3, 4, 0, 0, 5, 6, 7, 8, 0, 0];
        let uv = [9u8, 10, 11, 12, 0, 0];
        let mut dst = vec![0u8; decoded_frame_size(DecodedFormat::NV12, 4, 2)];

        copy_planes(
            DecodedFormat::NV12,
            &[(&y[..], 6), (&uv[..], 6)],
            &mut dst,
            Resolution::from((4, 2)),
        )
        .unwrap();
        assert_eq!(dst, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn i420_copy_odd_size() {
        // 3x1 picture, chroma planes of 2x1.
        let y = [1u8, 2, 3, 0];
        let u = [4u8, 5];
        let v = [6u8, 7];
        let mut dst = vec![0u8; 3 + 4];

        copy_planes(
            DecodedFormat::I420,
            &[(&y[..], 4), (&u[..], 2), (&v[..], 2)],
            &mut dst,
            Resolution::from((3, 1)),
        )
        .unwrap();
        assert_eq!(dst, [1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn copy_rejects_short_planes() {
        let y = [0u8; 7];
        let uv = [0u8; 4];
        let mut dst = vec![0u8; 12];

        assert!(copy_planes(
            DecodedFormat::NV12,
            &[(&y[..], 4), (&uv[..], 4)],
            &mut dst,
            Resolution::from((4, 2)),
        )
        .is_err());
        assert!(copy_planes(
            DecodedFormat::NV12,
            &[(&y[..], 4)],
            &mut dst,
            Resolution::from((4, 2)),
        )
        .is_err());
    }
}

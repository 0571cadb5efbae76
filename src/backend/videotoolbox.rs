// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VideoToolbox backend.
//!
//! Format descriptions are built with `CMVideoFormatDescriptionCreateFrom{H264,HEVC}ParameterSets`
//! and samples are submitted to a `VTDecompressionSession` with asynchronous decoding enabled.
//! The [`FrameToken`] of each submission is boxed and passed as the source frame reference of
//! the decode call; the output callback takes it back and completes it with the retained
//! image buffer.

use std::ffi::c_int;
use std::ffi::c_void;
use std::ptr;

use anyhow::anyhow;
use core_foundation_sys::base::kCFAllocatorDefault;
use core_foundation_sys::base::CFAllocatorRef;
use core_foundation_sys::base::CFRelease;
use core_foundation_sys::base::CFTypeRef;
use core_foundation_sys::base::OSStatus;
use core_foundation_sys::dictionary::kCFTypeDictionaryKeyCallBacks;
use core_foundation_sys::dictionary::kCFTypeDictionaryValueCallBacks;
use core_foundation_sys::dictionary::CFDictionaryCreate;
use core_foundation_sys::dictionary::CFDictionaryRef;
use core_foundation_sys::number::kCFNumberSInt32Type;
use core_foundation_sys::number::CFNumberCreate;
use core_foundation_sys::string::CFStringRef;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::CompressedSample;
use crate::backend::DecoderBackend;
use crate::codec::CodecKind;
use crate::decoder::reconciler::FrameToken;
use crate::params::ParameterSets;
use crate::timing::FrameTiming;
use crate::timing::Rational;
use crate::DecodedFormat;
use crate::Resolution;

type CMFormatDescriptionRef = *const c_void;
type CMBlockBufferRef = *mut c_void;
type CMSampleBufferRef = *mut c_void;
type CVImageBufferRef = *mut c_void;
type VTDecompressionSessionRef = *mut c_void;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct CMTime {
    value: i64,
    timescale: i32,
    flags: u32,
    epoch: i64,
}

const K_CM_TIME_FLAGS_VALID: u32 = 1 << 0;

impl CMTime {
    const INVALID: Self = Self {
        value: 0,
        timescale: 0,
        flags: 0,
        epoch: 0,
    };

    /// Expresses `ticks` of `timebase` as a `CMTime`, if representable.
    fn from_ticks(ticks: Option<i64>, timebase: Rational) -> Self {
        let value = ticks.and_then(|ticks| ticks.checked_mul(timebase.num));
        match (value, i32::try_from(timebase.den)) {
            (Some(value), Ok(timescale)) if timescale > 0 => Self {
                value,
                timescale,
                flags: K_CM_TIME_FLAGS_VALID,
                epoch: 0,
            },
            _ => Self::INVALID,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct CMSampleTimingInfo {
    duration: CMTime,
    presentation_time_stamp: CMTime,
    decode_time_stamp: CMTime,
}

impl From<&FrameTiming> for CMSampleTimingInfo {
    fn from(timing: &FrameTiming) -> Self {
        let timebase = timing.clock.timebase;
        let duration = (timing.duration != 0).then_some(timing.duration);

        Self {
            duration: CMTime::from_ticks(duration, timebase),
            presentation_time_stamp: CMTime::from_ticks(timing.pts, timebase),
            decode_time_stamp: CMTime::from_ticks(timing.dts, timebase),
        }
    }
}

type VTDecompressionOutputCallback = extern "C" fn(
    decompression_output_ref_con: *mut c_void,
    source_frame_ref_con: *mut c_void,
    status: OSStatus,
    info_flags: u32,
    image_buffer: CVImageBufferRef,
    presentation_time_stamp: CMTime,
    presentation_duration: CMTime,
);

#[repr(C)]
struct VTDecompressionOutputCallbackRecord {
    decompression_output_callback: VTDecompressionOutputCallback,
    decompression_output_ref_con: *mut c_void,
}

const K_CM_BLOCK_BUFFER_ASSURE_MEMORY_NOW_FLAG: u32 = 1 << 0;
const K_VT_DECODE_FRAME_ENABLE_ASYNCHRONOUS_DECOMPRESSION: u32 = 1 << 0;
const K_VT_INVALID_SESSION_ERR: OSStatus = -12903;

/// '420v'
const K_CV_PIXEL_FORMAT_TYPE_420_YP_CB_CR_8_BI_PLANAR_VIDEO_RANGE: u32 = 0x34323076;
/// 'y420'
const K_CV_PIXEL_FORMAT_TYPE_420_YP_CB_CR_8_PLANAR: u32 = 0x79343230;

#[link(name = "CoreMedia", kind = "framework")]
extern "C" {
    fn CMVideoFormatDescriptionCreateFromH264ParameterSets(
        allocator: CFAllocatorRef,
        parameter_set_count: usize,
        parameter_set_pointers: *const *const u8,
        parameter_set_sizes: *const usize,
        nal_unit_header_length: c_int,
        format_description_out: *mut CMFormatDescriptionRef,
    ) -> OSStatus;

    fn CMVideoFormatDescriptionCreateFromHEVCParameterSets(
        allocator: CFAllocatorRef,
        parameter_set_count: usize,
        parameter_set_pointers: *const *const u8,
        parameter_set_sizes: *const usize,
        nal_unit_header_length: c_int,
        extensions: CFDictionaryRef,
        format_description_out: *mut CMFormatDescriptionRef,
    ) -> OSStatus;

    fn CMBlockBufferCreateWithMemoryBlock(
        allocator: CFAllocatorRef,
        memory_block: *mut c_void,
        block_length: usize,
        block_allocator: CFAllocatorRef,
        custom_block_source: *const c_void,
        offset_to_data: usize,
        data_length: usize,
        flags: u32,
        block_buffer_out: *mut CMBlockBufferRef,
    ) -> OSStatus;

    fn CMBlockBufferReplaceDataBytes(
        source_bytes: *const c_void,
        destination_buffer: CMBlockBufferRef,
        offset_into_destination: usize,
        data_length: usize,
    ) -> OSStatus;

    fn CMSampleBufferCreate(
        allocator: CFAllocatorRef,
        data_buffer: CMBlockBufferRef,
        data_ready: bool,
        make_data_ready_callback: *const c_void,
        make_data_ready_refcon: *const c_void,
        format_description: CMFormatDescriptionRef,
        num_samples: isize,
        num_sample_timing_entries: isize,
        sample_timing_array: *const CMSampleTimingInfo,
        num_sample_size_entries: isize,
        sample_size_array: *const usize,
        sample_buffer_out: *mut CMSampleBufferRef,
    ) -> OSStatus;
}

#[link(name = "CoreVideo", kind = "framework")]
extern "C" {
    static kCVPixelBufferPixelFormatTypeKey: CFStringRef;

    fn CVPixelBufferRetain(pixel_buffer: CVImageBufferRef) -> CVImageBufferRef;
    fn CVPixelBufferRelease(pixel_buffer: CVImageBufferRef);
    fn CVPixelBufferGetWidth(pixel_buffer: CVImageBufferRef) -> usize;
    fn CVPixelBufferGetHeight(pixel_buffer: CVImageBufferRef) -> usize;
    fn CVPixelBufferGetPixelFormatType(pixel_buffer: CVImageBufferRef) -> u32;
    fn CVPixelBufferGetPlaneCount(pixel_buffer: CVImageBufferRef) -> usize;
    fn CVPixelBufferGetBaseAddressOfPlane(
        pixel_buffer: CVImageBufferRef,
        plane_index: usize,
    ) -> *mut c_void;
    fn CVPixelBufferGetBytesPerRowOfPlane(
        pixel_buffer: CVImageBufferRef,
        plane_index: usize,
    ) -> usize;
    fn CVPixelBufferGetHeightOfPlane(pixel_buffer: CVImageBufferRef, plane_index: usize)
        -> usize;
    fn CVPixelBufferLockBaseAddress(pixel_buffer: CVImageBufferRef, lock_flags: u64) -> i32;
    fn CVPixelBufferUnlockBaseAddress(pixel_buffer: CVImageBufferRef, unlock_flags: u64) -> i32;
}

#[link(name = "VideoToolbox", kind = "framework")]
extern "C" {
    fn VTDecompressionSessionCreate(
        allocator: CFAllocatorRef,
        video_format_description: CMFormatDescriptionRef,
        video_decoder_specification: CFDictionaryRef,
        destination_image_buffer_attributes: CFDictionaryRef,
        output_callback: *const VTDecompressionOutputCallbackRecord,
        decompression_session_out: *mut VTDecompressionSessionRef,
    ) -> OSStatus;

    fn VTDecompressionSessionDecodeFrame(
        session: VTDecompressionSessionRef,
        sample_buffer: CMSampleBufferRef,
        decode_flags: u32,
        source_frame_ref_con: *mut c_void,
        info_flags_out: *mut u32,
    ) -> OSStatus;

    fn VTDecompressionSessionWaitForAsynchronousFrames(
        session: VTDecompressionSessionRef,
    ) -> OSStatus;

    fn VTDecompressionSessionInvalidate(session: VTDecompressionSessionRef);
}

/// Owned reference to a CoreFoundation object, released on drop.
struct CfOwned(CFTypeRef);

impl CfOwned {
    fn new(object: CFTypeRef) -> Option<Self> {
        (!object.is_null()).then_some(Self(object))
    }
}

impl Drop for CfOwned {
    fn drop(&mut self) {
        // SAFETY: the object is non-null and we own one reference to it.
        unsafe { CFRelease(self.0) };
    }
}

pub struct FormatDescription {
    desc: CfOwned,
}

// SAFETY: CoreMedia objects are immutable once created and can be retained and released from any
// thread.
unsafe impl Send for FormatDescription {}

pub struct Session {
    session: VTDecompressionSessionRef,
}

// SAFETY: VideoToolbox sessions may be used from any thread, one call at a time.
unsafe impl Send for Session {}

impl Drop for Session {
    fn drop(&mut self) {
        // SAFETY: the session was created by `VTDecompressionSessionCreate` and is only released
        // here. Waiting first makes sure every submitted token has been handed back.
        unsafe {
            VTDecompressionSessionWaitForAsynchronousFrames(self.session);
            VTDecompressionSessionInvalidate(self.session);
            CFRelease(self.session as CFTypeRef);
        }
    }
}

/// A decoded image, as output by VideoToolbox.
pub struct PixelBuffer {
    buffer: CVImageBufferRef,
}

// SAFETY: the buffer is retained for the lifetime of this object and CoreVideo reference counting
// is thread-safe.
unsafe impl Send for PixelBuffer {}

impl PixelBuffer {
    /// # Safety
    ///
    /// `buffer` must be a valid, non-null `CVPixelBufferRef`.
    unsafe fn retain(buffer: CVImageBufferRef) -> Self {
        Self {
            buffer: CVPixelBufferRetain(buffer),
        }
    }

    /// Raw `CVPixelBufferRef`, valid as long as `self` is alive.
    pub fn as_raw(&self) -> *mut c_void {
        self.buffer
    }

    pub fn resolution(&self) -> Resolution {
        // SAFETY: `self.buffer` is retained.
        unsafe {
            Resolution {
                width: CVPixelBufferGetWidth(self.buffer) as u32,
                height: CVPixelBufferGetHeight(self.buffer) as u32,
            }
        }
    }

    pub fn format(&self) -> Option<DecodedFormat> {
        // SAFETY: `self.buffer` is retained.
        match unsafe { CVPixelBufferGetPixelFormatType(self.buffer) } {
            K_CV_PIXEL_FORMAT_TYPE_420_YP_CB_CR_8_BI_PLANAR_VIDEO_RANGE => Some(DecodedFormat::NV12),
            K_CV_PIXEL_FORMAT_TYPE_420_YP_CB_CR_8_PLANAR => Some(DecodedFormat::I420),
            _ => None,
        }
    }

    /// Copies the picture into `dst` without padding. `dst` must be at least
    /// [`crate::decoded_frame_size`] bytes large.
    pub fn read(&self, dst: &mut [u8]) -> anyhow::Result<()> {
        let format = self
            .format()
            .ok_or_else(|| anyhow!("unsupported pixel buffer format"))?;

        // SAFETY: `self.buffer` is retained, and the plane addresses are only used while the
        // base address is locked.
        unsafe {
            if CVPixelBufferLockBaseAddress(self.buffer, 0) != 0 {
                return Err(anyhow!("failed to lock pixel buffer"));
            }

            let planes = (0..CVPixelBufferGetPlaneCount(self.buffer))
                .map(|plane| {
                    let stride = CVPixelBufferGetBytesPerRowOfPlane(self.buffer, plane);
                    let height = CVPixelBufferGetHeightOfPlane(self.buffer, plane);
                    let base = CVPixelBufferGetBaseAddressOfPlane(self.buffer, plane) as *const u8;
                    let data = if base.is_null() {
                        &[][..]
                    } else {
                        std::slice::from_raw_parts(base, stride * height)
                    };
                    (data, stride)
                })
                .collect::<Vec<_>>();

            let res = crate::copy_planes(format, &planes, dst, self.resolution());
            CVPixelBufferUnlockBaseAddress(self.buffer, 0);
            res
        }
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        // SAFETY: we own one reference to the buffer.
        unsafe { CVPixelBufferRelease(self.buffer) };
    }
}

/// Output callback of all sessions.
extern "C" fn decompression_output_callback(
    _decompression_output_ref_con: *mut c_void,
    source_frame_ref_con: *mut c_void,
    status: OSStatus,
    _info_flags: u32,
    image_buffer: CVImageBufferRef,
    _presentation_time_stamp: CMTime,
    _presentation_duration: CMTime,
) {
    if source_frame_ref_con.is_null() {
        log::error!("decoded frame without token");
        return;
    }

    // SAFETY: the reference was obtained from `Box::into_raw` in `decode`, and VideoToolbox
    // invokes the callback exactly once for each successfully submitted frame.
    let token = unsafe { Box::from_raw(source_frame_ref_con as *mut FrameToken<PixelBuffer>) };

    let result = if status != 0 {
        Err(BackendError::Status(status))
    } else if image_buffer.is_null() {
        Ok(None)
    } else {
        // SAFETY: `image_buffer` is a valid pixel buffer for the duration of the callback.
        Ok(Some(unsafe { PixelBuffer::retain(image_buffer) }))
    };

    (*token).complete(result);
}

/// VideoToolbox decoder backend.
pub struct Backend {
    format: DecodedFormat,
}

impl Backend {
    /// Creates a backend producing pictures of `format`.
    pub fn new(format: DecodedFormat) -> Self {
        Self { format }
    }

    fn pixel_format(&self) -> u32 {
        match self.format {
            DecodedFormat::NV12 => K_CV_PIXEL_FORMAT_TYPE_420_YP_CB_CR_8_BI_PLANAR_VIDEO_RANGE,
            DecodedFormat::I420 => K_CV_PIXEL_FORMAT_TYPE_420_YP_CB_CR_8_PLANAR,
        }
    }

    /// Builds the destination image buffer attributes of new sessions.
    fn destination_attributes(&self) -> anyhow::Result<CfOwned> {
        let pixel_format = self.pixel_format() as i32;

        // SAFETY: all pointers are valid for the duration of the calls, and the dictionary
        // retains its keys and values.
        unsafe {
            let value = CfOwned::new(CFNumberCreate(
                kCFAllocatorDefault,
                kCFNumberSInt32Type,
                &pixel_format as *const i32 as *const c_void,
            ) as CFTypeRef)
            .ok_or_else(|| anyhow!("failed to create pixel format number"))?;

            let keys = [kCVPixelBufferPixelFormatTypeKey as *const c_void];
            let values = [value.0];

            CfOwned::new(CFDictionaryCreate(
                kCFAllocatorDefault,
                keys.as_ptr(),
                values.as_ptr(),
                1,
                &kCFTypeDictionaryKeyCallBacks,
                &kCFTypeDictionaryValueCallBacks,
            ) as CFTypeRef)
            .ok_or_else(|| anyhow!("failed to create destination attributes"))
        }
    }
}

/// Wraps `data` into a ready `CMSampleBuffer` for `format`.
fn create_sample_buffer(
    format: &FormatDescription,
    data: &[u8],
    timing: &FrameTiming,
) -> BackendResult<CfOwned> {
    let timing = CMSampleTimingInfo::from(timing);
    let sample_size = data.len();

    // SAFETY: all out pointers are valid, and the block buffer allocates its own memory into
    // which `data` is copied, so it does not outlive `data`.
    unsafe {
        let mut block_buffer: CMBlockBufferRef = ptr::null_mut();
        let status = CMBlockBufferCreateWithMemoryBlock(
            kCFAllocatorDefault,
            ptr::null_mut(),
            data.len(),
            kCFAllocatorDefault,
            ptr::null(),
            0,
            data.len(),
            K_CM_BLOCK_BUFFER_ASSURE_MEMORY_NOW_FLAG,
            &mut block_buffer,
        );
        if status != 0 {
            return Err(BackendError::Status(status));
        }
        let block_buffer = CfOwned::new(block_buffer as CFTypeRef)
            .ok_or(BackendError::Status(status))?;

        let status = CMBlockBufferReplaceDataBytes(
            data.as_ptr() as *const c_void,
            block_buffer.0 as CMBlockBufferRef,
            0,
            data.len(),
        );
        if status != 0 {
            return Err(BackendError::Status(status));
        }

        let mut sample_buffer: CMSampleBufferRef = ptr::null_mut();
        let status = CMSampleBufferCreate(
            kCFAllocatorDefault,
            block_buffer.0 as CMBlockBufferRef,
            true,
            ptr::null(),
            ptr::null(),
            format.desc.0 as CMFormatDescriptionRef,
            1,
            1,
            &timing,
            1,
            &sample_size,
            &mut sample_buffer,
        );
        if status != 0 {
            return Err(BackendError::Status(status));
        }

        CfOwned::new(sample_buffer as CFTypeRef).ok_or(BackendError::Status(status))
    }
}

impl DecoderBackend for Backend {
    type FormatDescription = FormatDescription;
    type Session = Session;
    type Picture = PixelBuffer;

    fn create_format_description(
        &mut self,
        parameter_sets: &ParameterSets,
    ) -> anyhow::Result<FormatDescription> {
        let pointers = parameter_sets
            .iter()
            .map(<[u8]>::as_ptr)
            .collect::<Vec<_>>();
        let sizes = parameter_sets.iter().map(<[u8]>::len).collect::<Vec<_>>();
        let header_length = parameter_sets.nal_length_size.bytes() as c_int;

        let mut desc: CMFormatDescriptionRef = ptr::null();
        // SAFETY: `pointers` and `sizes` describe `parameter_sets`, which outlives the call.
        let status = unsafe {
            match parameter_sets.codec {
                CodecKind::H264 => CMVideoFormatDescriptionCreateFromH264ParameterSets(
                    kCFAllocatorDefault,
                    pointers.len(),
                    pointers.as_ptr(),
                    sizes.as_ptr(),
                    header_length,
                    &mut desc,
                ),
                CodecKind::H265 => CMVideoFormatDescriptionCreateFromHEVCParameterSets(
                    kCFAllocatorDefault,
                    pointers.len(),
                    pointers.as_ptr(),
                    sizes.as_ptr(),
                    header_length,
                    ptr::null(),
                    &mut desc,
                ),
            }
        };

        if status != 0 {
            return Err(anyhow!(
                "failed to create {} format description: status {}",
                parameter_sets.codec,
                status
            ));
        }

        let desc = CfOwned::new(desc as CFTypeRef)
            .ok_or_else(|| anyhow!("no format description returned"))?;

        Ok(FormatDescription { desc })
    }

    fn create_session(&mut self, format: &FormatDescription) -> anyhow::Result<Session> {
        let attributes = self.destination_attributes()?;
        let callback = VTDecompressionOutputCallbackRecord {
            decompression_output_callback: decompression_output_callback,
            decompression_output_ref_con: ptr::null_mut(),
        };

        let mut session: VTDecompressionSessionRef = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call. The callback record is
        // copied by VideoToolbox.
        let status = unsafe {
            VTDecompressionSessionCreate(
                kCFAllocatorDefault,
                format.desc.0 as CMFormatDescriptionRef,
                ptr::null(),
                attributes.0 as CFDictionaryRef,
                &callback,
                &mut session,
            )
        };

        if status != 0 || session.is_null() {
            return Err(anyhow!(
                "failed to create decompression session: status {}",
                status
            ));
        }

        Ok(Session { session })
    }

    fn decode(
        &mut self,
        session: &mut Session,
        format: &FormatDescription,
        sample: CompressedSample,
        token: FrameToken<PixelBuffer>,
    ) -> BackendResult<()> {
        let sample_buffer = create_sample_buffer(format, &sample.data, &sample.timing)?;
        let token = Box::into_raw(Box::new(token));

        let mut info_flags = 0;
        // SAFETY: the session and sample buffer are valid. `token` is reclaimed by the output
        // callback, or below if the submission failed.
        let status = unsafe {
            VTDecompressionSessionDecodeFrame(
                session.session,
                sample_buffer.0 as CMSampleBufferRef,
                K_VT_DECODE_FRAME_ENABLE_ASYNCHRONOUS_DECOMPRESSION,
                token as *mut c_void,
                &mut info_flags,
            )
        };

        if status != 0 {
            // SAFETY: the output callback is not invoked for frames that failed to submit.
            drop(unsafe { Box::from_raw(token) });

            return Err(if status == K_VT_INVALID_SESSION_ERR {
                BackendError::InvalidSession
            } else {
                BackendError::Status(status)
            });
        }

        Ok(())
    }

    fn flush(&mut self, session: &mut Session) -> BackendResult<()> {
        // SAFETY: the session is valid.
        let status = unsafe { VTDecompressionSessionWaitForAsynchronousFrames(session.session) };
        match status {
            0 => Ok(()),
            K_VT_INVALID_SESSION_ERR => Err(BackendError::InvalidSession),
            status => Err(BackendError::Status(status)),
        }
    }

    fn invalidate(&mut self, session: Session) {
        log::debug!("invalidating decompression session");
        drop(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::StreamClock;

    #[test]
    fn sample_timing() {
        let timing = FrameTiming {
            pts: Some(3_600),
            dts: None,
            duration: 0,
            clock: StreamClock::new(Rational::new(1, 90_000), Rational::new(25, 1)),
        };

        let info = CMSampleTimingInfo::from(&timing);
        assert_eq!(info.presentation_time_stamp.value, 3_600);
        assert_eq!(info.presentation_time_stamp.timescale, 90_000);
        assert_eq!(info.presentation_time_stamp.flags, K_CM_TIME_FLAGS_VALID);
        assert_eq!(info.decode_time_stamp.flags, 0);
        assert_eq!(info.duration.flags, 0);
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode pipeline.
//!
//! Access units enter through [`DecodePipeline::submit`](pipeline::DecodePipeline::submit),
//! are normalized to length-prefixed framing, and are handed to the live session of the
//! [`SessionManager`](session::SessionManager). Decoded pictures come back asynchronously, on a
//! thread the pipeline does not control, and are matched with the timing of the access unit
//! they were decoded from by the [`reconciler`].

pub mod pipeline;
pub mod reconciler;
pub mod session;

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use thiserror::Error;

use crate::backend::BackendError;
use crate::normalize::NormalizeError;
use crate::timing::known_timestamp;
use crate::timing::FrameTiming;
use crate::timing::StreamClock;

pub use pipeline::DecodePipeline;
pub use session::State;

/// One compressed frame, as delivered by the demuxer.
///
/// The data is only borrowed for the duration of the submission.
#[derive(Copy, Clone, Debug)]
pub struct AccessUnit<'a> {
    pub data: &'a [u8],
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Duration in ticks of `clock.timebase`, 0 if unknown.
    pub duration: i64,
    pub clock: StreamClock,
}

impl<'a> AccessUnit<'a> {
    /// Creates an access unit with unknown timestamps and duration.
    pub fn new(data: &'a [u8], clock: StreamClock) -> Self {
        Self {
            data,
            pts: None,
            dts: None,
            duration: 0,
            clock,
        }
    }

    /// Sets the presentation timestamp. The demuxer sentinel
    /// [`NOPTS_VALUE`](crate::timing::NOPTS_VALUE) leaves it unknown.
    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = known_timestamp(pts);
        self
    }

    /// Sets the decode timestamp. The demuxer sentinel
    /// [`NOPTS_VALUE`](crate::timing::NOPTS_VALUE) leaves it unknown.
    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = known_timestamp(dts);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    /// The timing metadata to carry along with the decode request.
    pub fn timing(&self) -> FrameTiming {
        FrameTiming {
            pts: self.pts,
            dts: self.dts,
            duration: self.duration,
            clock: self.clock,
        }
    }
}

/// A picture returned by the hardware decoder, along with its timing in seconds.
///
/// Pictures are delivered in completion order, which is not necessarily presentation order.
#[derive(Debug)]
pub struct DecodedPicture<P> {
    pub picture: P,
    pub presentation_time: f64,
    pub duration: f64,
    /// Timing of the access unit this picture was decoded from.
    pub timing: FrameTiming,
}

/// Error returned by [`DecodePipeline::submit`]. The access unit has been dropped, but the
/// pipeline remains usable.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decode session is not ready (state: {0:?})")]
    NotReady(State),
    #[error("failed to normalize access unit: {0}")]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Counters describing the health of a stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Access units passed to `submit`.
    pub submitted: u64,
    /// Access units dropped because no session was ready.
    pub not_ready: u64,
    /// Access units dropped because they could not be normalized.
    pub normalize_failures: u64,
    /// Access units the backend refused.
    pub submit_failures: u64,
    /// Frames the hardware failed to decode, or decoded without producing an image.
    pub decode_errors: u64,
    /// Pictures handed over to the rendering callback.
    pub delivered: u64,
    /// Completions ignored because their session had been torn down.
    pub stale: u64,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) not_ready: AtomicU64,
    pub(crate) normalize_failures: AtomicU64,
    pub(crate) submit_failures: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) stale: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            not_ready: self.not_ready.load(Ordering::Relaxed),
            normalize_failures: self.normalize_failures.load(Ordering::Relaxed),
            submit_failures: self.submit_failures.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware decoder backends.
//!
//! A backend is a provider of asynchronous, most likely hardware-accelerated, decoding like
//! VideoToolbox. The pipeline only talks to it through the [`DecoderBackend`] trait: it builds
//! format descriptions from parameter sets, creates sessions bound to them and submits
//! length-prefixed samples, each along with the [`FrameToken`] that the backend must hand back
//! once the frame has been decoded.

pub mod dummy;
#[cfg(all(feature = "videotoolbox", target_os = "macos"))]
pub mod videotoolbox;

use bytes::Bytes;
use thiserror::Error;

use crate::decoder::reconciler::FrameToken;
use crate::params::ParameterSets;
use crate::timing::FrameTiming;

/// Error returned by backend submission methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("the decode session is no longer valid")]
    InvalidSession,
    #[error("the hardware decoder returned status {0}")]
    Status(i32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by backend submission methods.
pub type BackendResult<T> = Result<T, BackendError>;

/// A normalized access unit, ready to be wrapped into the backend's native sample container.
#[derive(Clone, Debug)]
pub struct CompressedSample {
    /// Length-prefixed NAL units, using the NAL length size of the session's format.
    pub data: Bytes,
    pub timing: FrameTiming,
}

/// Common trait of all decoder backends.
///
/// All methods are called from the thread submitting access units. Completions may be reported
/// from any thread and in any order by calling [`FrameToken::complete`].
pub trait DecoderBackend {
    /// Description of the stream format, built from its parameter sets.
    type FormatDescription;
    /// Live decode session bound to a format description.
    type Session;
    /// Decoded image buffer, handed over to the rendering side.
    type Picture: Send + 'static;

    /// Builds a format description from a complete set of parameter sets.
    fn create_format_description(
        &mut self,
        parameter_sets: &ParameterSets,
    ) -> anyhow::Result<Self::FormatDescription>;

    /// Creates a decode session for `format`.
    fn create_session(&mut self, format: &Self::FormatDescription)
        -> anyhow::Result<Self::Session>;

    /// Submits `sample` for asynchronous decoding.
    ///
    /// On success the backend owns `token` and must eventually complete or drop it. On failure
    /// the token is dropped before returning and no completion is reported for it.
    fn decode(
        &mut self,
        session: &mut Self::Session,
        format: &Self::FormatDescription,
        sample: CompressedSample,
        token: FrameToken<Self::Picture>,
    ) -> BackendResult<()>;

    /// Blocks until every pending decode of `session` has been completed.
    fn flush(&mut self, session: &mut Self::Session) -> BackendResult<()>;

    /// Destroys `session`. Decodes still pending may complete afterwards.
    fn invalidate(&mut self, session: Self::Session);
}

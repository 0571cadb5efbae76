// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the pipeline run so we can
//! test it in isolation.
//!
//! Decodes are not completed on submission: the tokens are parked until the test drives them
//! with [`Backend::take_pending`], so completions can be reported in any order, from any thread,
//! or after a teardown. Setting [`Backend::set_auto_complete`] completes them on submission
//! instead, which is what the demo and fuzzer use. Every call is counted and can be made to
//! fail.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use anyhow::anyhow;
use bytes::Bytes;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::CompressedSample;
use crate::backend::DecoderBackend;
use crate::decoder::reconciler::FrameToken;
use crate::framing::is_length_prefixed;
use crate::framing::NalLengthSize;
use crate::params::ParameterSets;

/// Status reported for samples that are not properly length-prefixed.
pub const BAD_DATA_STATUS: i32 = -12909;

pub struct FormatDescription {
    pub parameter_sets: ParameterSets,
    /// The parameter sets as a configuration record, as a platform decoder would want them.
    pub record: Vec<u8>,
}

pub struct Session {
    pub id: u64,
    nal_length_size: NalLengthSize,
}

/// "Decoded" picture: the sample it comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Picture {
    pub session_id: u64,
    pub data: Bytes,
}

/// Number of calls made to each backend method.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Calls {
    pub format_descriptions: usize,
    pub sessions_created: usize,
    pub decodes: usize,
    pub flushes: usize,
    pub invalidations: usize,
}

/// A decode submitted to the backend and not completed yet.
pub struct Pending {
    pub session_id: u64,
    pub sample: CompressedSample,
    pub token: FrameToken<Picture>,
    valid: bool,
}

impl Pending {
    /// Completes the decode the way the hardware would: with a picture if the sample is well
    /// formed, with an error otherwise.
    pub fn complete(self) {
        let result = if self.valid {
            Ok(Some(Picture {
                session_id: self.session_id,
                data: self.sample.data,
            }))
        } else {
            Err(BackendError::Status(BAD_DATA_STATUS))
        };

        self.token.complete(result);
    }

    /// Completes the decode with an error.
    pub fn fail(self, error: BackendError) {
        self.token.complete(Err(error));
    }

    /// Completes the decode successfully, but without image.
    pub fn complete_empty(self) {
        self.token.complete(Ok(None));
    }
}

#[derive(Default)]
struct Inner {
    calls: Calls,
    fail_format: bool,
    fail_session: bool,
    fail_decode: bool,
    invalidate_on_decode: bool,
    auto_complete: bool,
    last_session_id: u64,
    pending: VecDeque<Pending>,
}

/// Dummy backend that can be used for any codec.
///
/// Clones share their state, so a test can keep a handle on the backend it gave to a pipeline.
#[derive(Clone, Default)]
pub struct Backend {
    inner: Arc<Mutex<Inner>>,
}

impl Backend {
    pub fn new() -> Self {
        Default::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Calls {
        self.inner().calls
    }

    pub fn set_fail_format(&self, fail: bool) {
        self.inner().fail_format = fail;
    }

    pub fn set_fail_session(&self, fail: bool) {
        self.inner().fail_session = fail;
    }

    /// Makes submissions fail synchronously.
    pub fn set_fail_decode(&self, fail: bool) {
        self.inner().fail_decode = fail;
    }

    /// Makes submissions report that the session has been invalidated.
    pub fn set_invalidate_on_decode(&self, invalidate: bool) {
        self.inner().invalidate_on_decode = invalidate;
    }

    /// Completes decodes as soon as they are submitted.
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.inner().auto_complete = auto_complete;
    }

    /// Takes all the pending decodes, in submission order.
    pub fn take_pending(&self) -> Vec<Pending> {
        self.inner().pending.drain(..).collect()
    }

    pub fn num_pending(&self) -> usize {
        self.inner().pending.len()
    }
}

impl DecoderBackend for Backend {
    type FormatDescription = FormatDescription;
    type Session = Session;
    type Picture = Picture;

    fn create_format_description(
        &mut self,
        parameter_sets: &ParameterSets,
    ) -> anyhow::Result<FormatDescription> {
        let mut inner = self.inner();
        inner.calls.format_descriptions += 1;
        if inner.fail_format {
            return Err(anyhow!("invalid parameter sets"));
        }

        Ok(FormatDescription {
            parameter_sets: parameter_sets.clone(),
            record: parameter_sets.to_record()?,
        })
    }

    fn create_session(&mut self, format: &FormatDescription) -> anyhow::Result<Session> {
        let mut inner = self.inner();
        inner.calls.sessions_created += 1;
        if inner.fail_session {
            return Err(anyhow!("hardware refused the format description"));
        }

        inner.last_session_id += 1;
        Ok(Session {
            id: inner.last_session_id,
            nal_length_size: format.parameter_sets.nal_length_size,
        })
    }

    fn decode(
        &mut self,
        session: &mut Session,
        _format: &FormatDescription,
        sample: CompressedSample,
        token: FrameToken<Picture>,
    ) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.calls.decodes += 1;
        if inner.invalidate_on_decode {
            return Err(BackendError::InvalidSession);
        }
        if inner.fail_decode {
            return Err(BackendError::Status(BAD_DATA_STATUS));
        }

        let pending = Pending {
            session_id: session.id,
            valid: is_length_prefixed(&sample.data, session.nal_length_size),
            sample,
            token,
        };

        if inner.auto_complete {
            drop(inner);
            pending.complete();
        } else {
            inner.pending.push_back(pending);
        }

        Ok(())
    }

    fn flush(&mut self, session: &mut Session) -> BackendResult<()> {
        let flushed = {
            let mut inner = self.inner();
            inner.calls.flushes += 1;

            let (flushed, kept) = inner
                .pending
                .drain(..)
                .partition::<VecDeque<_>, _>(|pending| pending.session_id == session.id);
            inner.pending = kept;
            flushed
        };

        for pending in flushed {
            pending.complete();
        }

        Ok(())
    }

    fn invalidate(&mut self, _session: Session) {
        self.inner().calls.invalidations += 1;
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The producer-facing side of the pipeline.

use std::sync::Arc;

use bytes::Bytes;

use crate::backend::BackendError;
use crate::backend::DecoderBackend;
use crate::codec::CodecKind;
use crate::decoder::reconciler::Reconciler;
use crate::decoder::session::Epoch;
use crate::decoder::session::Observation;
use crate::decoder::session::SessionManager;
use crate::decoder::AccessUnit;
use crate::decoder::DecodeError;
use crate::decoder::DecodedPicture;
use crate::decoder::PipelineStats;
use crate::decoder::State;
use crate::decoder::StatsCounters;
use crate::framing::LengthPrefixedNalus;
use crate::normalize::normalize;
use crate::params::ParameterSetError;
use crate::params::ParameterSets;

/// Decodes the access units of one stream with a [`DecoderBackend`].
///
/// All methods are meant to be called from the producer thread. Decoded pictures are handed to
/// the callback given at construction, from whichever thread the backend completes decodes on,
/// in completion order.
pub struct DecodePipeline<B: DecoderBackend> {
    // Dropped first, so the session is torn down before the callback goes away.
    session: SessionManager<B>,
    reconciler: Reconciler<B::Picture>,
    codec: Option<CodecKind>,
}

impl<B: DecoderBackend> DecodePipeline<B> {
    pub fn new<F>(backend: B, on_picture: F) -> Self
    where
        F: FnMut(DecodedPicture<B::Picture>) + Send + 'static,
    {
        let epoch = Arc::new(Epoch::default());

        Self {
            session: SessionManager::new(backend, Arc::clone(&epoch)),
            reconciler: Reconciler::new(epoch, Box::new(on_picture)),
            codec: None,
        }
    }

    /// Sets the codec of the stream and the codec configuration data received from the demuxer.
    ///
    /// `extradata` may be an `avcC`/`hvcC` record or Annex B parameter sets. It may also be
    /// empty, in which case the parameter sets are expected in-band. If the parameter sets
    /// cannot be extracted, the previous configuration, if any, is kept and the error is
    /// returned.
    pub fn configure(
        &mut self,
        codec: CodecKind,
        extradata: &[u8],
    ) -> Result<(), ParameterSetError> {
        self.codec = Some(codec);

        if extradata.is_empty() {
            log::debug!("no {} extradata, waiting for in-band parameter sets", codec);
            return Ok(());
        }

        let parameter_sets = ParameterSets::extract(codec, extradata).map_err(|e| {
            log::warn!("ignoring {} extradata: {}", codec, e);
            e
        })?;

        if self.session.observe(parameter_sets) == Observation::Unchanged {
            log::debug!("{} extradata unchanged", codec);
        }

        Ok(())
    }

    /// Submits an access unit for decoding.
    ///
    /// Returns once the access unit has been handed over to the backend; the picture is
    /// delivered later. Errors are not fatal: the access unit is dropped and the pipeline keeps
    /// accepting access units.
    pub fn submit(&mut self, access_unit: &AccessUnit) -> Result<(), DecodeError> {
        StatsCounters::bump(&self.reconciler.stats().submitted);

        let length_size = self.session.nal_length_size();
        let data = normalize(access_unit.data, length_size).map_err(|e| {
            StatsCounters::bump(&self.reconciler.stats().normalize_failures);
            log::warn!("dropping access unit: {}", e);
            e
        })?;

        self.observe_in_band(&data);

        if !self.session.ensure_ready() {
            StatsCounters::bump(&self.reconciler.stats().not_ready);
            let state = self.session.state();
            log::debug!("dropping access unit, no decode session ({:?})", state);
            return Err(DecodeError::NotReady(state));
        }

        self.session
            .decode(Bytes::from(data), access_unit.timing(), &self.reconciler)
            .map_err(|e| {
                StatsCounters::bump(&self.reconciler.stats().submit_failures);
                log::warn!("failed to submit access unit: {}", e);
                e
            })
    }

    /// Hands complete parameter sets carried by an access unit to the session manager.
    fn observe_in_band(&mut self, data: &[u8]) {
        let Some(codec) = self
            .codec
            .or_else(|| self.session.parameter_sets().map(|sets| sets.codec))
        else {
            return;
        };

        let length_size = self.session.nal_length_size();
        let nalus = LengthPrefixedNalus::new(data, length_size).map_while(Result::ok);
        let mut parameter_sets = ParameterSets::from_nalus(codec, nalus);
        if !parameter_sets.is_complete() {
            return;
        }

        parameter_sets.nal_length_size = length_size;
        if self.session.observe_in_band(parameter_sets) == Observation::Changed {
            log::debug!("switched to in-band {} parameter sets", codec);
        }
    }

    /// Blocks until every pending decode of the current session has completed.
    pub fn flush(&mut self) -> Result<(), BackendError> {
        self.session.flush()
    }

    /// Stops the stream. Pending decodes are not delivered anymore and the configuration is
    /// forgotten, but the codec set by [`DecodePipeline::configure`] is kept.
    pub fn stop(&mut self) {
        log::debug!("stopping stream");
        self.session.stop();
    }

    pub fn state(&self) -> State {
        self.session.state()
    }

    pub fn stats(&self) -> PipelineStats {
        self.reconciler.snapshot()
    }

    pub fn session(&self) -> &SessionManager<B> {
        &self.session
    }

    pub fn backend(&self) -> &B {
        self.session.backend()
    }
}

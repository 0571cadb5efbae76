// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lifetime of the format description and hardware session of a stream.
//!
//! The session manager walks the following state machine:
//!
//! ```text
//! Uninitialized -> ConfigBuilt -> SessionReady <-> Decoding
//!        ^              |               |
//!        +--------------+---------------+-----> TornDown
//! ```
//!
//! Building the format description and creating the session are only attempted when parameter
//! sets have been observed since the last failure. A failed attempt is not repeated for every
//! access unit, but on the next observation of parameter sets, be it the same configuration
//! received again or a new one.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use bytes::Bytes;

use crate::backend::BackendError;
use crate::backend::CompressedSample;
use crate::backend::DecoderBackend;
use crate::decoder::reconciler::Reconciler;
use crate::decoder::DecodeError;
use crate::framing::NalLengthSize;
use crate::params::ParameterSets;
use crate::timing::FrameTiming;

/// Generation counter of the sessions of a pipeline.
///
/// Every teardown starts a new generation. Completions compare the generation they were
/// submitted under with the current one while holding the barrier, so a teardown either
/// happens entirely before or entirely after the delivery of a picture.
#[derive(Debug, Default)]
pub(crate) struct Epoch {
    generation: AtomicU64,
    barrier: Mutex<()>,
}

impl Epoch {
    pub(crate) fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Starts a new generation, waiting for deliveries in progress to finish.
    pub(crate) fn advance(&self) -> u64 {
        let _barrier = self.barrier.lock().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns a guard preventing teardowns as long as it is held, if `generation` is still the
    /// current one.
    pub(crate) fn enter(&self, generation: u64) -> Option<MutexGuard<'_, ()>> {
        let guard = self.barrier.lock().unwrap_or_else(PoisonError::into_inner);
        if self.current() == generation {
            Some(guard)
        } else {
            None
        }
    }
}

/// State of the decode session of a pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// No usable format description.
    Uninitialized,
    /// A format description is built, but no session exists.
    ConfigBuilt,
    /// A session exists and has no pending decode.
    SessionReady,
    /// A session exists and has pending decodes.
    Decoding,
    /// The stream has been stopped.
    TornDown,
}

/// Outcome of [`SessionManager::observe`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// The parameter sets differ from the cached ones; the previous session, if any, has been
    /// torn down.
    Changed,
    /// The parameter sets are already known. Pending retries are re-armed.
    Unchanged,
}

struct LiveSession<S> {
    session: S,
    generation: u64,
    in_flight: Arc<AtomicUsize>,
}

enum Stage<B: DecoderBackend> {
    Uninitialized,
    ConfigBuilt {
        format: B::FormatDescription,
    },
    Ready {
        format: B::FormatDescription,
        live: LiveSession<B::Session>,
    },
    TornDown,
}

/// Owns the backend and the format description and session built with it.
pub struct SessionManager<B: DecoderBackend> {
    backend: B,
    parameter_sets: Option<ParameterSets>,
    stage: Stage<B>,
    /// Whether parameter sets have been observed since the last failed build or creation.
    armed: bool,
    epoch: Arc<Epoch>,
}

impl<B: DecoderBackend> SessionManager<B> {
    pub(crate) fn new(backend: B, epoch: Arc<Epoch>) -> Self {
        Self {
            backend,
            parameter_sets: None,
            stage: Stage::Uninitialized,
            armed: false,
            epoch,
        }
    }

    pub fn state(&self) -> State {
        match &self.stage {
            Stage::Uninitialized => State::Uninitialized,
            Stage::ConfigBuilt { .. } => State::ConfigBuilt,
            Stage::Ready { live, .. } => {
                if live.in_flight.load(Ordering::Acquire) > 0 {
                    State::Decoding
                } else {
                    State::SessionReady
                }
            }
            Stage::TornDown => State::TornDown,
        }
    }

    /// Generation of the current session. Completions of older generations are ignored.
    pub fn generation(&self) -> u64 {
        self.epoch.current()
    }

    /// Number of decodes submitted to the live session and not completed yet.
    pub fn in_flight(&self) -> usize {
        match &self.stage {
            Stage::Ready { live, .. } => live.in_flight.load(Ordering::Acquire),
            _ => 0,
        }
    }

    /// NAL length size access units must be normalized to.
    pub fn nal_length_size(&self) -> NalLengthSize {
        self.parameter_sets
            .as_ref()
            .map(|sets| sets.nal_length_size)
            .unwrap_or_default()
    }

    pub fn parameter_sets(&self) -> Option<&ParameterSets> {
        self.parameter_sets.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Records the parameter sets of new codec configuration data.
    ///
    /// Parameter sets that differ from the cached ones tear the current session down and
    /// replace the format description. Identical ones only re-arm a failed build or session
    /// creation.
    pub fn observe(&mut self, parameter_sets: ParameterSets) -> Observation {
        let unchanged = self.parameter_sets.as_ref() == Some(&parameter_sets);
        self.update(parameter_sets, unchanged)
    }

    /// Records parameter sets repeated inside the stream.
    ///
    /// Streams commonly repeat only some of their parameter sets, so sets already part of the
    /// cache, with the same NAL length size, count as unchanged.
    pub fn observe_in_band(&mut self, parameter_sets: ParameterSets) -> Observation {
        let unchanged = self.parameter_sets.as_ref().is_some_and(|cached| {
            cached.nal_length_size == parameter_sets.nal_length_size
                && cached.covers(&parameter_sets)
        });
        self.update(parameter_sets, unchanged)
    }

    fn update(&mut self, parameter_sets: ParameterSets, unchanged: bool) -> Observation {
        if unchanged {
            self.armed = true;
            return Observation::Unchanged;
        }

        log::debug!(
            "new {} parameter sets: {} VPS, {} SPS, {} PPS, NAL length size {}",
            parameter_sets.codec,
            parameter_sets.vps.len(),
            parameter_sets.sps.len(),
            parameter_sets.pps.len(),
            parameter_sets.nal_length_size.bytes(),
        );

        self.teardown();
        self.parameter_sets = Some(parameter_sets);
        self.armed = true;
        self.build_format();

        Observation::Changed
    }

    /// Re-arms a failed build or session creation without changing the parameter sets.
    pub fn retrigger(&mut self) {
        if self.parameter_sets.is_some() {
            self.armed = true;
        }
    }

    /// Brings the manager to a state accepting submissions if possible, and returns whether it
    /// is in such a state.
    pub fn ensure_ready(&mut self) -> bool {
        if matches!(self.stage, Stage::Ready { .. }) {
            return true;
        }
        if !self.armed {
            return false;
        }

        if matches!(self.stage, Stage::Uninitialized | Stage::TornDown) {
            self.build_format();
        }

        if let Stage::ConfigBuilt { .. } = self.stage {
            self.create_session();
        }

        matches!(self.stage, Stage::Ready { .. })
    }

    fn build_format(&mut self) {
        let Some(parameter_sets) = &self.parameter_sets else {
            return;
        };

        match self.backend.create_format_description(parameter_sets) {
            Ok(format) => {
                log::debug!("built {} format description", parameter_sets.codec);
                self.stage = Stage::ConfigBuilt { format };
            }
            Err(e) => {
                log::warn!("failed to build format description: {:#}", e);
                self.armed = false;
                self.stage = Stage::Uninitialized;
            }
        }
    }

    fn create_session(&mut self) {
        let format = match std::mem::replace(&mut self.stage, Stage::Uninitialized) {
            Stage::ConfigBuilt { format } => format,
            stage => {
                self.stage = stage;
                return;
            }
        };

        match self.backend.create_session(&format) {
            Ok(session) => {
                let generation = self.epoch.current();
                log::debug!("created decode session {}", generation);
                self.stage = Stage::Ready {
                    format,
                    live: LiveSession {
                        session,
                        generation,
                        in_flight: Arc::new(AtomicUsize::new(0)),
                    },
                };
            }
            Err(e) => {
                log::warn!("failed to create decode session: {:#}", e);
                self.armed = false;
                self.stage = Stage::ConfigBuilt { format };
            }
        }
    }

    /// Submits a normalized access unit to the live session.
    pub(crate) fn decode(
        &mut self,
        data: Bytes,
        timing: FrameTiming,
        reconciler: &Reconciler<B::Picture>,
    ) -> Result<(), DecodeError> {
        let state = self.state();
        let Stage::Ready { format, live } = &mut self.stage else {
            return Err(DecodeError::NotReady(state));
        };

        let token = reconciler.token(timing, live.generation, &live.in_flight);
        let sample = CompressedSample { data, timing };

        match self.backend.decode(&mut live.session, format, sample, token) {
            Ok(()) => Ok(()),
            Err(BackendError::InvalidSession) => {
                log::warn!("decode session {} invalidated by the hardware", live.generation);
                self.drop_session();
                Err(BackendError::InvalidSession.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Waits for every pending decode of the live session to complete.
    pub fn flush(&mut self) -> Result<(), BackendError> {
        match &mut self.stage {
            Stage::Ready { live, .. } => self.backend.flush(&mut live.session),
            _ => Ok(()),
        }
    }

    /// Destroys the live session, keeping the format description. The session is recreated on
    /// the next observation of parameter sets.
    fn drop_session(&mut self) {
        if let Stage::Ready { format, live } =
            std::mem::replace(&mut self.stage, Stage::Uninitialized)
        {
            self.epoch.advance();
            self.backend.invalidate(live.session);
            self.armed = false;
            self.stage = Stage::ConfigBuilt { format };
        }
    }

    /// Releases the session and format description, if any.
    fn teardown(&mut self) {
        let generation = self.epoch.advance();

        match std::mem::replace(&mut self.stage, Stage::Uninitialized) {
            Stage::Ready { live, .. } => {
                log::debug!(
                    "tearing down decode session {} with {} pending decodes",
                    live.generation,
                    live.in_flight.load(Ordering::Acquire)
                );
                self.backend.invalidate(live.session);
            }
            Stage::Uninitialized | Stage::ConfigBuilt { .. } | Stage::TornDown => (),
        }

        log::debug!("now at session generation {}", generation);
    }

    /// Stops the stream: releases the session, forgets the parameter sets and goes back to the
    /// default NAL length size. Calling it again has no effect.
    pub fn stop(&mut self) {
        if let Stage::TornDown = self.stage {
            return;
        }

        self.teardown();
        self.parameter_sets = None;
        self.armed = false;
        self.stage = Stage::TornDown;
    }
}

impl<B: DecoderBackend> Drop for SessionManager<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::backend::dummy;
    use crate::codec::CodecKind;
    use crate::decoder::DecodedPicture;
    use crate::timing::Rational;
    use crate::timing::StreamClock;

    const CLOCK: StreamClock = StreamClock::new(Rational::new(1, 90_000), Rational::new(25, 1));

    const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1e, 0xda, 0x02, 0x80];
    const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
    const OTHER_SPS: &[u8] = &[0x67, 0x64, 0x00, 0x28, 0xac, 0xd9];

    fn parameter_sets(sps: &[u8]) -> ParameterSets {
        let mut sets = ParameterSets::new(CodecKind::H264);
        sets.sps.push(sps.to_vec());
        sets.pps.push(PPS.to_vec());
        sets
    }

    fn timing(pts: i64) -> FrameTiming {
        FrameTiming {
            pts: Some(pts),
            dts: None,
            duration: 0,
            clock: CLOCK,
        }
    }

    struct Harness {
        manager: SessionManager<dummy::Backend>,
        backend: dummy::Backend,
        reconciler: Reconciler<dummy::Picture>,
        pictures: mpsc::Receiver<DecodedPicture<dummy::Picture>>,
    }

    fn harness() -> Harness {
        let epoch = Arc::new(Epoch::default());
        let backend = dummy::Backend::new();
        let (sender, pictures) = mpsc::channel();
        let sender = Mutex::new(sender);
        let reconciler = Reconciler::new(
            Arc::clone(&epoch),
            Box::new(move |picture| {
                let _ = sender.lock().unwrap().send(picture);
            }),
        );

        Harness {
            manager: SessionManager::new(backend.clone(), epoch),
            backend,
            reconciler,
            pictures,
        }
    }

    impl Harness {
        fn decode(&mut self, pts: i64) -> Result<(), DecodeError> {
            self.manager.decode(
                Bytes::from_static(&[0, 0, 0, 2, 0x65, 0x88]),
                timing(pts),
                &self.reconciler,
            )
        }
    }

    #[test]
    fn no_configuration_never_reaches_hardware() {
        let mut h = harness();

        assert!(!h.manager.ensure_ready());
        assert!(matches!(
            h.decode(0),
            Err(DecodeError::NotReady(State::Uninitialized))
        ));
        assert_eq!(h.manager.state(), State::Uninitialized);

        let calls = h.backend.calls();
        assert_eq!(calls.format_descriptions, 0);
        assert_eq!(calls.sessions_created, 0);
        assert_eq!(calls.decodes, 0);
    }

    #[test]
    fn observe_builds_format_then_session() {
        let mut h = harness();

        assert_eq!(h.manager.observe(parameter_sets(SPS)), Observation::Changed);
        assert_eq!(h.manager.state(), State::ConfigBuilt);

        assert!(h.manager.ensure_ready());
        assert_eq!(h.manager.state(), State::SessionReady);

        h.decode(0).unwrap();
        assert_eq!(h.manager.state(), State::Decoding);
        assert_eq!(h.manager.in_flight(), 1);

        for pending in h.backend.take_pending() {
            pending.complete();
        }
        assert_eq!(h.manager.state(), State::SessionReady);
        assert_eq!(h.pictures.try_iter().count(), 1);
    }

    #[test]
    fn change_forces_one_teardown_and_rebuild() {
        let mut h = harness();
        h.manager.observe(parameter_sets(SPS));
        assert!(h.manager.ensure_ready());
        h.decode(0).unwrap();

        // Same configuration again: nothing happens.
        assert_eq!(h.manager.observe(parameter_sets(SPS)), Observation::Unchanged);
        assert_eq!(h.backend.calls().invalidations, 0);

        assert_eq!(
            h.manager.observe(parameter_sets(OTHER_SPS)),
            Observation::Changed
        );
        assert_eq!(h.manager.state(), State::ConfigBuilt);
        assert!(h.manager.ensure_ready());
        h.decode(3_600).unwrap();

        let calls = h.backend.calls();
        assert_eq!(calls.invalidations, 1);
        assert_eq!(calls.format_descriptions, 2);
        assert_eq!(calls.sessions_created, 2);
        assert_eq!(calls.decodes, 2);
    }

    #[test]
    fn completion_after_teardown_is_ignored() {
        let mut h = harness();
        h.manager.observe(parameter_sets(SPS));
        assert!(h.manager.ensure_ready());
        h.decode(0).unwrap();
        let stale = h.backend.take_pending();

        h.manager.observe(parameter_sets(OTHER_SPS));
        assert!(h.manager.ensure_ready());
        h.decode(3_600).unwrap();

        for pending in stale {
            pending.complete();
        }
        assert!(h.pictures.try_recv().is_err());
        assert_eq!(h.reconciler.snapshot().stale, 1);

        for pending in h.backend.take_pending() {
            pending.complete();
        }
        let picture = h.pictures.try_recv().unwrap();
        assert_eq!(picture.presentation_time, 0.04);
        assert_eq!(picture.picture.session_id, 2);
    }

    #[test]
    fn fewer_parameter_sets_in_new_configuration() {
        let mut h = harness();
        let mut both = parameter_sets(SPS);
        both.sps.push(OTHER_SPS.to_vec());
        h.manager.observe(both.clone());
        assert!(h.manager.ensure_ready());

        // Repeated in-band, a subset of the cache changes nothing.
        assert_eq!(
            h.manager.observe_in_band(parameter_sets(SPS)),
            Observation::Unchanged
        );
        assert_eq!(h.manager.state(), State::SessionReady);

        // As new configuration data, it replaces the cache.
        assert_eq!(h.manager.observe(parameter_sets(SPS)), Observation::Changed);
        assert_eq!(h.manager.parameter_sets(), Some(&parameter_sets(SPS)));
        assert_eq!(h.backend.calls().invalidations, 1);

        assert_eq!(h.manager.observe(both), Observation::Changed);
        assert_eq!(
            h.manager.observe_in_band(parameter_sets(OTHER_SPS)),
            Observation::Unchanged
        );
        assert_eq!(h.backend.calls().format_descriptions, 3);
    }

    #[test]
    fn failed_session_creation_waits_for_parameter_sets() {
        let mut h = harness();
        h.backend.set_fail_session(true);
        h.manager.observe(parameter_sets(SPS));

        assert!(!h.manager.ensure_ready());
        assert_eq!(h.manager.state(), State::ConfigBuilt);
        assert!(!h.manager.ensure_ready());
        assert!(!h.manager.ensure_ready());
        assert_eq!(h.backend.calls().sessions_created, 1);

        h.backend.set_fail_session(false);
        assert!(!h.manager.ensure_ready());
        assert_eq!(h.backend.calls().sessions_created, 1);

        h.manager.observe(parameter_sets(SPS));
        assert!(h.manager.ensure_ready());
        assert_eq!(h.backend.calls().sessions_created, 2);
        assert_eq!(h.manager.state(), State::SessionReady);
    }

    #[test]
    fn failed_format_stays_uninitialized() {
        let mut h = harness();
        h.backend.set_fail_format(true);
        h.manager.observe(parameter_sets(SPS));
        assert_eq!(h.manager.state(), State::Uninitialized);
        assert!(!h.manager.ensure_ready());
        assert_eq!(h.backend.calls().format_descriptions, 1);

        h.backend.set_fail_format(false);
        h.manager.retrigger();
        assert!(h.manager.ensure_ready());
        assert_eq!(h.backend.calls().format_descriptions, 2);
    }

    #[test]
    fn invalidated_session_is_dropped() {
        let mut h = harness();
        h.manager.observe(parameter_sets(SPS));
        assert!(h.manager.ensure_ready());

        h.backend.set_invalidate_on_decode(true);
        assert!(matches!(
            h.decode(0),
            Err(DecodeError::Backend(BackendError::InvalidSession))
        ));
        assert_eq!(h.manager.state(), State::ConfigBuilt);
        assert_eq!(h.manager.in_flight(), 0);

        h.backend.set_invalidate_on_decode(false);
        h.manager.retrigger();
        assert!(h.manager.ensure_ready());
        h.decode(0).unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut h = harness();
        let mut sets = parameter_sets(SPS);
        sets.nal_length_size = NalLengthSize::Two;
        h.manager.observe(sets);
        assert!(h.manager.ensure_ready());
        assert_eq!(h.manager.nal_length_size(), NalLengthSize::Two);

        h.manager.stop();
        assert_eq!(h.manager.state(), State::TornDown);
        assert_eq!(h.manager.nal_length_size(), NalLengthSize::Four);
        assert!(h.manager.parameter_sets().is_none());

        h.manager.stop();
        assert_eq!(h.manager.state(), State::TornDown);
        assert_eq!(h.backend.calls().invalidations, 1);
        assert!(!h.manager.ensure_ready());

        // A new configuration restarts the stream.
        h.manager.observe(parameter_sets(SPS));
        assert!(h.manager.ensure_ready());
    }
}

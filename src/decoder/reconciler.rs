// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Association of asynchronous completions with the access units they decode.
//!
//! Hardware decoders do not guarantee that completions are reported in submission order, nor
//! on the submitting thread. Every submission therefore carries a [`FrameToken`] that holds the
//! timing of its access unit, the generation of the session it was submitted to, and a weak
//! reference to the pipeline. The backend hands the token back through
//! [`FrameToken::complete`], which is the only path through which pictures reach the rendering
//! callback.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;

use crate::backend::BackendResult;
use crate::decoder::session::Epoch;
use crate::decoder::DecodedPicture;
use crate::decoder::PipelineStats;
use crate::decoder::StatsCounters;
use crate::timing::FrameTiming;

/// Rendering callback receiving decoded pictures.
pub type PictureCallback<P> = dyn FnMut(DecodedPicture<P>) + Send + 'static;

/// State reachable from completions.
pub(crate) struct Shared<P> {
    epoch: Arc<Epoch>,
    on_picture: Mutex<Box<PictureCallback<P>>>,
    pub(crate) stats: StatsCounters,
}

/// Creates the tokens of a pipeline and owns the state their completions reach.
pub(crate) struct Reconciler<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Reconciler<P> {
    pub(crate) fn new(epoch: Arc<Epoch>, on_picture: Box<PictureCallback<P>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                epoch,
                on_picture: Mutex::new(on_picture),
                stats: Default::default(),
            }),
        }
    }

    /// Creates the token of a submission made to the session of `generation`. `in_flight` is
    /// the pending decodes counter of that session.
    pub(crate) fn token(
        &self,
        timing: FrameTiming,
        generation: u64,
        in_flight: &Arc<AtomicUsize>,
    ) -> FrameToken<P> {
        in_flight.fetch_add(1, Ordering::AcqRel);

        FrameToken {
            generation,
            timing,
            in_flight: Arc::clone(in_flight),
            shared: Arc::downgrade(&self.shared),
            completed: false,
        }
    }

    pub(crate) fn stats(&self) -> &StatsCounters {
        &self.shared.stats
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        self.shared.stats.snapshot()
    }
}

/// Correlation token of one in-flight decode.
///
/// Ownership of the token is transferred to the backend along with the sample. It is released
/// exactly once: either consumed by [`FrameToken::complete`], or dropped if the submission
/// failed.
pub struct FrameToken<P> {
    generation: u64,
    timing: FrameTiming,
    in_flight: Arc<AtomicUsize>,
    shared: Weak<Shared<P>>,
    completed: bool,
}

impl<P> FrameToken<P> {
    /// Timing of the access unit this token was created for.
    pub fn timing(&self) -> &FrameTiming {
        &self.timing
    }

    /// Generation of the session the access unit was submitted to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports the outcome of the decode.
    ///
    /// May be called from any thread. `Ok(None)` means the hardware reported success without
    /// producing an image. Failures are logged and counted but never affect the session.
    /// Completions for a session that has since been torn down, or for a pipeline that no
    /// longer exists, are ignored.
    pub fn complete(mut self, result: BackendResult<Option<P>>) {
        self.completed = true;
        let time = self.timing.presentation_time();

        let Some(shared) = self.shared.upgrade() else {
            log::debug!("pipeline gone, ignoring completion of frame at {:.3}s", time);
            return;
        };

        // Held until the picture is delivered, so that a teardown cannot interleave.
        let Some(_current) = shared.epoch.enter(self.generation) else {
            StatsCounters::bump(&shared.stats.stale);
            log::debug!(
                "ignoring completion of frame at {:.3}s from torn down session {}",
                time,
                self.generation
            );
            return;
        };

        let picture = match result {
            Ok(Some(picture)) => picture,
            Ok(None) => {
                StatsCounters::bump(&shared.stats.decode_errors);
                log::warn!("hardware decoder returned no image for frame at {:.3}s", time);
                return;
            }
            Err(e) => {
                StatsCounters::bump(&shared.stats.decode_errors);
                log::warn!("failed to decode frame at {:.3}s: {}", time, e);
                return;
            }
        };

        let picture = DecodedPicture {
            picture,
            presentation_time: time,
            duration: self.timing.duration(),
            timing: self.timing,
        };

        (*shared
            .on_picture
            .lock()
            .unwrap_or_else(PoisonError::into_inner))(picture);
        StatsCounters::bump(&shared.stats.delivered);
    }
}

impl<P> Drop for FrameToken<P> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        if !self.completed {
            log::debug!(
                "frame at {:.3}s released without completion",
                self.timing.presentation_time()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::backend::BackendError;
    use crate::timing::Rational;
    use crate::timing::StreamClock;

    const CLOCK: StreamClock = StreamClock::new(Rational::new(1, 90_000), Rational::new(25, 1));

    fn timing(pts: i64) -> FrameTiming {
        FrameTiming {
            pts: Some(pts),
            dts: None,
            duration: 0,
            clock: CLOCK,
        }
    }

    fn reconciler() -> (Reconciler<u32>, Arc<Epoch>, mpsc::Receiver<DecodedPicture<u32>>) {
        let epoch = Arc::new(Epoch::default());
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        let reconciler = Reconciler::new(
            Arc::clone(&epoch),
            Box::new(move |picture| {
                let _ = sender.lock().unwrap().send(picture);
            }),
        );

        (reconciler, epoch, receiver)
    }

    #[test]
    fn out_of_order_completions_keep_their_timing() {
        let (reconciler, epoch, receiver) = reconciler();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let tokens = (0..3)
            .map(|i| reconciler.token(timing(i * 3_600), epoch.current(), &in_flight))
            .collect::<Vec<_>>();
        assert_eq!(in_flight.load(Ordering::Acquire), 3);

        // Complete in reverse order, the picture payload being the submission index.
        for (i, token) in tokens.into_iter().enumerate().rev() {
            token.complete(Ok(Some(i as u32)));
        }

        let pictures = receiver.try_iter().collect::<Vec<_>>();
        assert_eq!(pictures.len(), 3);
        for picture in pictures {
            assert_eq!(picture.presentation_time, picture.picture as f64 * 0.04);
            assert_eq!(picture.timing.pts, Some(picture.picture as i64 * 3_600));
            assert_eq!(picture.duration, 0.04);
        }

        assert_eq!(in_flight.load(Ordering::Acquire), 0);
        assert_eq!(reconciler.snapshot().delivered, 3);
    }

    #[test]
    fn completion_from_another_thread() {
        let (reconciler, epoch, receiver) = reconciler();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let token = reconciler.token(timing(90_000), epoch.current(), &in_flight);

        thread::spawn(move || token.complete(Ok(Some(7))))
            .join()
            .unwrap();

        let picture = receiver.try_recv().unwrap();
        assert_eq!(picture.picture, 7);
        assert_eq!(picture.presentation_time, 1.0);
        assert_eq!(in_flight.load(Ordering::Acquire), 0);
    }

    #[test]
    fn failures_are_counted_not_delivered() {
        let (reconciler, epoch, receiver) = reconciler();
        let in_flight = Arc::new(AtomicUsize::new(0));

        reconciler
            .token(timing(0), epoch.current(), &in_flight)
            .complete(Err(BackendError::Status(-12909)));
        reconciler
            .token(timing(0), epoch.current(), &in_flight)
            .complete(Ok(None));

        assert!(receiver.try_recv().is_err());
        let stats = reconciler.snapshot();
        assert_eq!(stats.decode_errors, 2);
        assert_eq!(stats.delivered, 0);
        assert_eq!(in_flight.load(Ordering::Acquire), 0);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let (reconciler, epoch, receiver) = reconciler();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let token = reconciler.token(timing(0), epoch.current(), &in_flight);

        epoch.advance();
        token.complete(Ok(Some(1)));

        assert!(receiver.try_recv().is_err());
        assert_eq!(reconciler.snapshot().stale, 1);
        assert_eq!(in_flight.load(Ordering::Acquire), 0);
    }

    #[test]
    fn completion_after_pipeline_is_gone() {
        let (reconciler, epoch, receiver) = reconciler();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let token = reconciler.token(timing(0), epoch.current(), &in_flight);

        drop(reconciler);
        token.complete(Ok(Some(1)));

        assert!(receiver.try_recv().is_err());
        assert_eq!(in_flight.load(Ordering::Acquire), 0);
    }

    #[test]
    fn dropped_token_is_released_once() {
        let (reconciler, epoch, _receiver) = reconciler();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let token = reconciler.token(timing(0), epoch.current(), &in_flight);
        assert_eq!(in_flight.load(Ordering::Acquire), 1);

        drop(token);
        assert_eq!(in_flight.load(Ordering::Acquire), 0);
        assert_eq!(reconciler.snapshot(), PipelineStats::default());
    }
}

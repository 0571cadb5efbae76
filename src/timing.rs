// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream clocks and the timing of decoded pictures.

/// Value used by FFmpeg-style demuxers for an unknown timestamp.
pub const NOPTS_VALUE: i64 = i64::MIN;

/// Maps the [`NOPTS_VALUE`] sentinel to `None`.
pub fn known_timestamp(ts: i64) -> Option<i64> {
    (ts != NOPTS_VALUE).then_some(ts)
}

/// A rational number, used for timebases (seconds per tick) and frame rates (frames per
/// second).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Converts to `f64`. A zero denominator yields 0.
    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Returns `den / num`, or `None` if the numerator is zero.
    pub fn invert(self) -> Option<Self> {
        (self.num != 0).then_some(Self {
            num: self.den,
            den: self.num,
        })
    }

    /// Converts `ticks` of this timebase into seconds.
    pub fn ticks_to_seconds(self, ticks: i64) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            ticks as f64 * self.num as f64 / self.den as f64
        }
    }
}

/// Clock of the stream an access unit belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamClock {
    /// Seconds per tick of the timestamps and durations.
    pub timebase: Rational,
    /// Nominal frame rate, used when an access unit carries no duration.
    pub frame_rate: Rational,
}

impl StreamClock {
    pub const fn new(timebase: Rational, frame_rate: Rational) -> Self {
        Self {
            timebase,
            frame_rate,
        }
    }
}

/// Timing metadata of one access unit, captured at submission and carried to the completion of
/// its decode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameTiming {
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Duration in ticks, 0 if unknown.
    pub duration: i64,
    pub clock: StreamClock,
}

impl FrameTiming {
    /// Presentation time in seconds: the PTS if known, else the DTS, else 0.
    pub fn presentation_time(&self) -> f64 {
        match self.pts.or(self.dts) {
            Some(ts) => self.clock.timebase.ticks_to_seconds(ts),
            None => 0.0,
        }
    }

    /// Duration in seconds, derived from the frame rate when the access unit carries none.
    pub fn duration(&self) -> f64 {
        if self.duration != 0 {
            self.clock.timebase.ticks_to_seconds(self.duration)
        } else {
            self.clock
                .frame_rate
                .invert()
                .map(Rational::to_f64)
                .unwrap_or(0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK: StreamClock = StreamClock::new(Rational::new(1, 90_000), Rational::new(25, 1));

    fn timing(pts: Option<i64>, dts: Option<i64>, duration: i64) -> FrameTiming {
        FrameTiming {
            pts,
            dts,
            duration,
            clock: CLOCK,
        }
    }

    #[test]
    fn presentation_time_from_pts() {
        assert_eq!(timing(Some(90_000), Some(0), 0).presentation_time(), 1.0);
    }

    #[test]
    fn presentation_time_from_dts() {
        assert_eq!(timing(None, Some(45_000), 0).presentation_time(), 0.5);
    }

    #[test]
    fn presentation_time_unknown() {
        assert_eq!(timing(None, None, 0).presentation_time(), 0.0);
    }

    #[test]
    fn duration_from_ticks() {
        assert_eq!(timing(None, None, 3_600).duration(), 0.04);
    }

    #[test]
    fn duration_from_frame_rate() {
        assert_eq!(timing(Some(0), None, 0).duration(), 0.04);

        let mut no_rate = timing(Some(0), None, 0);
        no_rate.clock.frame_rate = Rational::new(0, 1);
        assert_eq!(no_rate.duration(), 0.0);
    }

    #[test]
    fn nopts_sentinel() {
        assert_eq!(known_timestamp(NOPTS_VALUE), None);
        assert_eq!(known_timestamp(1234), Some(1234));
    }
}

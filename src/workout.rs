//! Workout profiles for controllable fitness equipment.
//!
//! A workout is an ordered list of (target power, duration) segments, run
//! `cycles` times and optionally looped forever. Sessions hand it to the
//! transport once, when the device is found.

use std::time::Duration;
use thiserror::Error;

/// One step of a workout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Target power in watts
    pub power: u16,
    pub duration: Duration,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkoutError {
    #[error("powers ({powers}) and periods ({periods}) must have the same length")]
    LengthMismatch { powers: usize, periods: usize },
    #[error("workout has no segments")]
    Empty,
    #[error("invalid period {0}: must be a positive number of seconds")]
    InvalidPeriod(f64),
    #[error("ramp step must be greater than zero")]
    ZeroStep,
    #[error("cycles must be at least 1")]
    ZeroCycles,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workout {
    segments: Vec<Segment>,
    cycles: u32,
    looping: bool,
}

fn period(seconds: f64) -> Result<Duration, WorkoutError> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(WorkoutError::InvalidPeriod(seconds)),
    }
}

/// Power steps from `from` to `to` inclusive. The last step is clamped to `to`.
fn ramp(from: u16, to: u16, step: u16) -> Vec<u16> {
    let mut powers = vec![from];
    let mut current = from;
    while current != to {
        current = if to > current {
            current.saturating_add(step).min(to)
        } else {
            current.saturating_sub(step).max(to)
        };
        powers.push(current);
    }
    powers
}

impl Workout {
    /// Build a workout from parallel arrays of powers (W) and periods (s).
    pub fn from_arrays(
        powers: &[u16],
        periods: &[f64],
        cycles: u32,
        looping: bool,
    ) -> Result<Self, WorkoutError> {
        if powers.len() != periods.len() {
            return Err(WorkoutError::LengthMismatch {
                powers: powers.len(),
                periods: periods.len(),
            });
        }

        let segments = powers
            .iter()
            .zip(periods)
            .map(|(&power, &secs)| {
                Ok(Segment {
                    power,
                    duration: period(secs)?,
                })
            })
            .collect::<Result<Vec<_>, WorkoutError>>()?;

        Self::new(segments, cycles, looping)
    }

    /// Build a ramp from `start` to `stop` in `step` watt increments, each held
    /// for `period` seconds. With a `peak`, the ramp climbs to the peak first and
    /// then descends to `stop`.
    pub fn from_ramp(
        start: u16,
        stop: u16,
        step: u16,
        period_secs: f64,
        peak: Option<u16>,
        cycles: u32,
        looping: bool,
    ) -> Result<Self, WorkoutError> {
        if step == 0 {
            return Err(WorkoutError::ZeroStep);
        }
        let duration = period(period_secs)?;

        let powers = match peak {
            Some(peak) => {
                let mut up = ramp(start, peak, step);
                up.extend(ramp(peak, stop, step).into_iter().skip(1));
                up
            }
            None => ramp(start, stop, step),
        };

        let segments = powers
            .into_iter()
            .map(|power| Segment { power, duration })
            .collect();

        Self::new(segments, cycles, looping)
    }

    fn new(segments: Vec<Segment>, cycles: u32, looping: bool) -> Result<Self, WorkoutError> {
        if segments.is_empty() {
            return Err(WorkoutError::Empty);
        }
        if cycles == 0 {
            return Err(WorkoutError::ZeroCycles);
        }
        Ok(Self {
            segments,
            cycles,
            looping,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// Segments of every cycle in order (a single pass when looping).
    pub fn steps(&self) -> impl Iterator<Item = &Segment> {
        (0..self.cycles).flat_map(move |_| self.segments.iter())
    }

    /// Duration of all cycles of one pass.
    pub fn total_duration(&self) -> Duration {
        self.steps().map(|s| s.duration).sum()
    }
}

// src/gpu/sizing.rs - Workload sizing and dynamic intensity
// Tree location: ./src/gpu/sizing.rs

//! Batch sizing for one scan-hash call
//!
//! [`set_threads_hashes`] turns the active intensity mode into a global thread
//! count that never falls below the work-group size. [`DynamicTuner`] nudges a
//! dynamic intensity by one step toward a per-call wall-clock target.

use std::time::{Duration, Instant};

use super::device::{Intensity, MAX_INTENSITY, MIN_INTENSITY};

/// Oversampled window the tuner waits to cover before measuring (µs)
pub const DYNAMIC_WINDOW_US: u64 = 70_000;

/// Default dynamic interval per scan call (ms)
pub const DEFAULT_DYNAMIC_INTERVAL_MS: u64 = 7;

/// Result of one sizing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSizing {
    /// Global work size
    pub global_threads: u64,
    /// Nonces covered: `global_threads * vector_width`
    pub hashes: u64,
    /// Times the intensity had to be raised to reach the floor
    pub iterations: u32,
}

/// Compute the batch for the active mode
///
/// Fixed and dynamic modes raise the exponent until the batch reaches
/// `min_threads` (the work-group size); once the exponent sits at
/// [`MAX_INTENSITY`], or for shader and raw modes, the floor is used.
pub fn set_threads_hashes(
    vector_width: u32,
    compute_shaders: u32,
    min_threads: u64,
    intensity: &mut Intensity,
) -> ThreadSizing {
    let mut iterations = 0;
    let threads = loop {
        let threads = match *intensity {
            Intensity::Raw(raw) => raw as u64,
            Intensity::Shader(x) => compute_shaders as u64 * x as u64,
            Intensity::Fixed(n) | Intensity::Dynamic(n) => 1u64 << n.clamp(0, 63),
        };
        if threads >= min_threads {
            break threads;
        }
        match intensity.exponent_mut() {
            Some(n) if *n < MAX_INTENSITY => {
                *n += 1;
                iterations += 1;
            }
            _ => break min_threads,
        }
    };

    ThreadSizing {
        global_threads: threads,
        hashes: threads * vector_width.max(1) as u64,
        iterations,
    }
}

/// Tuner verdict after a measurement window closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneOutcome {
    /// Within `[target/2, target]`, or already at a bound
    Hold,
    /// Too slow; new intensity
    Lowered(i32),
    /// Too fast; new intensity
    Raised(i32),
}

/// Apply one hysteresis step for an average of `per_call_us`
pub fn retune(per_call_us: f64, target_us: f64, intensity: &mut Intensity) -> TuneOutcome {
    let Some(n) = intensity.exponent_mut() else {
        return TuneOutcome::Hold;
    };
    if per_call_us > target_us {
        if *n > MIN_INTENSITY {
            *n -= 1;
            return TuneOutcome::Lowered(*n);
        }
    } else if per_call_us < target_us / 2.0 && *n < MAX_INTENSITY {
        *n += 1;
        return TuneOutcome::Raised(*n);
    }
    TuneOutcome::Hold
}

/// Per-thread dynamic intensity state
#[derive(Debug, Clone)]
pub struct DynamicTuner {
    target_us: u64,
    intervals: u64,
    window_start: Instant,
}

impl DynamicTuner {
    /// Tuner aiming at `interval` wall-clock per scan call
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            target_us: interval.as_micros().max(1) as u64,
            intervals: 0,
            window_start: now,
        }
    }

    /// Target per call in microseconds
    pub fn target_us(&self) -> u64 {
        self.target_us
    }

    /// Restart the measurement window
    pub fn reset(&mut self, now: Instant) {
        self.intervals = 0;
        self.window_start = now;
    }

    /// Count one scan call; retune once the window is covered
    ///
    /// Does nothing outside dynamic mode.
    pub fn tick(&mut self, now: Instant, intensity: &mut Intensity) -> Option<TuneOutcome> {
        if !intensity.is_dynamic() {
            return None;
        }
        self.intervals += 1;
        if self.intervals * self.target_us <= DYNAMIC_WINDOW_US {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        let per_call_us = elapsed.as_micros() as f64 / self.intervals as f64;
        let outcome = retune(per_call_us, self.target_us as f64, intensity);
        self.reset(now);
        Some(outcome)
    }
}

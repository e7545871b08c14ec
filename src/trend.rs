//! Temperature trend detection.
//!
//! Each device keeps a short rolling history of temperature readings and a
//! hysteresis flag that flips to "rising" on a sustained climb or a sharp
//! jump, and back on a sustained drop or a sharp fall. The flag only drives a
//! visual cue.

use std::collections::{HashMap, VecDeque};

pub const HISTORY_LEN: usize = 10;
/// Total change from the baseline needed to switch mode on the sustained path.
pub const BASELINE_THRESHOLD: i64 = 5;
/// Change between two consecutive readings that counts as a jump.
pub const STEP_THRESHOLD: i64 = 3;
/// Number of most recent readings checked for monotonicity.
const MONOTONIC_WINDOW: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct TrendState {
    history: VecDeque<u32>,
    baseline_temperature: u32,
    is_rising: bool,
}

impl TrendState {
    /// Starts tracking with `baseline` as the first reading.
    pub fn new(baseline: u32) -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_LEN);
        history.push_back(baseline);
        Self {
            history,
            baseline_temperature: baseline,
            is_rising: false,
        }
    }

    pub fn is_rising(&self) -> bool {
        self.is_rising
    }

    pub fn baseline(&self) -> u32 {
        self.baseline_temperature
    }

    pub fn history(&self) -> impl ExactSizeIterator<Item = u32> + '_ {
        self.history.iter().copied()
    }

    /// Records a reading and returns whether the device is now rising.
    pub fn update(&mut self, temperature: u32) -> bool {
        self.history.push_back(temperature);
        while self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }
        if self.history.len() < 2 {
            return self.is_rising;
        }

        let t = i64::from(temperature);
        let from_baseline = t - i64::from(self.baseline_temperature);
        let from_prev = t - i64::from(self.history[self.history.len() - 2]);

        let flip = if self.is_rising {
            (from_baseline <= -BASELINE_THRESHOLD && self.recent_monotonic(|a, b| b < a))
                || from_prev <= -STEP_THRESHOLD
        } else {
            from_baseline >= BASELINE_THRESHOLD
                && (self.recent_monotonic(|a, b| b > a) || from_prev >= STEP_THRESHOLD)
        };

        if flip {
            self.is_rising = !self.is_rising;
            self.baseline_temperature = temperature;
        }
        self.is_rising
    }

    // Checks each adjacent pair of the last few readings against `ordered`.
    fn recent_monotonic(&self, ordered: impl Fn(u32, u32) -> bool) -> bool {
        let start = self.history.len().saturating_sub(MONOTONIC_WINDOW);
        let recent: Vec<u32> = self.history.iter().skip(start).copied().collect();
        recent.windows(2).all(|pair| ordered(pair[0], pair[1]))
    }
}

/// Per-device trend state, keyed by device index.
#[derive(Debug, Default)]
pub struct TrendDetector {
    states: HashMap<u32, TrendState>,
}

impl TrendDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one reading for `index`. The first reading for a device only
    /// sets its baseline. A zero reading means the sensor is gone, so the
    /// device's state is dropped and it starts over with the next real one.
    pub fn observe(&mut self, index: u32, temperature: u32) -> bool {
        if temperature == 0 {
            self.states.remove(&index);
            return false;
        }
        match self.states.get_mut(&index) {
            Some(state) => state.update(temperature),
            None => {
                self.states.insert(index, TrendState::new(temperature));
                false
            }
        }
    }

    pub fn is_rising(&self, index: u32) -> bool {
        self.states.get(&index).is_some_and(TrendState::is_rising)
    }

    pub fn state(&self, index: u32) -> Option<&TrendState> {
        self.states.get(&index)
    }

    /// Drops all device state, e.g. after the device count changed.
    pub fn reset(&mut self) {
        self.states.clear();
    }
}

//! Display state built from the sampler's snapshot lists.
//!
//! The board keeps one card per device plus the trend detector. Cards are
//! keyed only by position, so when the number of devices changes every card
//! and all trend history is thrown away and rebuilt.

use crate::data::{app_memory_label, DeviceSnapshot};
use crate::trend::{TrendDetector, TrendState};
use chrono::{DateTime, Local};

#[derive(Clone, Debug, PartialEq)]
pub struct Card {
    pub snapshot: DeviceSnapshot,
    pub rising: bool,
    /// Temperature the current trend mode started from.
    pub baseline_c: Option<u32>,
}

#[derive(Debug, Default)]
pub struct Board {
    cards: Vec<Card>,
    trend: TrendDetector,
    last_update: Option<DateTime<Local>>,
}

impl Board {
    pub fn new() -> Self {
        Self {
            cards: Vec::new(),
            trend: TrendDetector::new(),
            last_update: None,
        }
    }

    /// Takes a new snapshot list. Returns true when the cards were rebuilt.
    pub fn apply(&mut self, snapshots: Vec<DeviceSnapshot>, at: DateTime<Local>) -> bool {
        let rebuilt = snapshots.len() != self.cards.len();
        if rebuilt {
            log::info!(
                "Device count changed from {} to {}, rebuilding cards",
                self.cards.len(),
                snapshots.len()
            );
            self.trend.reset();
        }

        self.cards = snapshots
            .into_iter()
            .map(|snapshot| {
                let rising = self.trend.observe(snapshot.index, snapshot.temperature_c);
                let baseline_c = self.trend.state(snapshot.index).map(TrendState::baseline);
                Card {
                    snapshot,
                    rising,
                    baseline_c,
                }
            })
            .collect();
        self.last_update = Some(at);
        rebuilt
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn has_data(&self) -> bool {
        self.last_update.is_some()
    }

    /// Recent temperatures for one device, oldest first.
    pub fn temperature_history(&self, index: u32) -> Vec<u32> {
        self.trend
            .state(index)
            .map(|state| state.history().collect())
            .unwrap_or_default()
    }

    pub fn status_line(&self, app_memory_mb: f64, sampling_stopped: bool) -> String {
        let mut parts = Vec::new();
        match self.last_update {
            Some(at) => {
                parts.push(format!("Detected {} GPU(s)", self.cards.len()));
                parts.extend(app_memory_label(app_memory_mb));
                parts.push(format!("Last Update: {}", at.format("%H:%M:%S")));
            }
            None => {
                parts.push("Waiting for GPU data...".to_string());
                parts.extend(app_memory_label(app_memory_mb));
            }
        }
        if sampling_stopped {
            parts.push("Sampling stopped".to_string());
        }
        parts.join(" | ")
    }
}

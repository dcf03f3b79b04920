//! Per-run aggregation: running class counts and de-duplicated key moments.
//!
//! A key moment is the time a class is first seen, or seen again after a
//! quiet period of more than [`KEY_MOMENT_GAP_SECS`] since its last recorded
//! moment. Recorded times per class are therefore strictly increasing and
//! spaced more than the gap apart.

use crate::config::{HARDHAT_CLASS, KEY_MOMENT_GAP_SECS, NO_HARDHAT_CLASS, PERSON_CLASS};
use std::collections::HashMap;

/// Class name → total detections over the run.
pub type DetectionStats = HashMap<String, u64>;

/// Class name → recorded key-moment times in seconds.
pub type KeyMoments = HashMap<String, Vec<f64>>;

/// Seconds into the video at which `frame_index` (zero-based) ends.
pub fn frame_time(frame_index: u64, fps: f64) -> f64 {
    (frame_index + 1) as f64 / fps
}

#[derive(Debug, Default)]
pub struct RunTally {
    stats: DetectionStats,
    moments: KeyMoments,
    last_moment: HashMap<String, f64>,
}

impl RunTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one detection of `class_name` at `current_time`. Returns true
    /// when it opened a new key moment.
    pub fn record(&mut self, class_name: &str, current_time: f64) -> bool {
        *self.stats.entry(class_name.to_string()).or_insert(0) += 1;

        let is_new = match self.last_moment.get(class_name) {
            Some(last) => current_time - last > KEY_MOMENT_GAP_SECS,
            None => true,
        };
        if is_new {
            self.moments
                .entry(class_name.to_string())
                .or_default()
                .push(current_time);
            self.last_moment.insert(class_name.to_string(), current_time);
        }
        is_new
    }

    pub fn stats(&self) -> &DetectionStats {
        &self.stats
    }

    pub fn moments(&self) -> &KeyMoments {
        &self.moments
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

/// Headline figures derived from key moments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetySummary {
    pub people: usize,
    pub hardhat: usize,
    pub no_hardhat: usize,
    /// Percent of helmet-status moments that show a helmet.
    pub compliance: f64,
}

pub fn safety_compliance(hardhat: usize, no_hardhat: usize) -> f64 {
    let total = hardhat + no_hardhat;
    if total == 0 {
        0.0
    } else {
        hardhat as f64 / total as f64 * 100.0
    }
}

impl SafetySummary {
    pub fn from_moments(moments: &KeyMoments) -> Self {
        let count = |class: &str| moments.get(class).map_or(0, Vec::len);
        let hardhat = count(HARDHAT_CLASS);
        let no_hardhat = count(NO_HARDHAT_CLASS);
        Self {
            people: count(PERSON_CLASS),
            hardhat,
            no_hardhat,
            compliance: safety_compliance(hardhat, no_hardhat),
        }
    }
}

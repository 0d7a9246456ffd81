//! Connection quality classification.
//!
//! Each sample starts from `Excellent` and two independent checks (packet
//! loss and round-trip time) may only downgrade it; the worse verdict wins.
//! A failed statistics read classifies the sample as `Disconnected`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::peer::LinkStats;

/// Quality class, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityClass {
    Excellent,
    Good,
    Poor,
    Disconnected,
}

/// Classification thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    /// Loss ratio above which a link is poor
    pub loss_poor: f64,
    /// Loss ratio above which a link is at best good
    pub loss_good: f64,
    pub rtt_poor: Duration,
    pub rtt_good: Duration,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            loss_poor: 0.05,
            loss_good: 0.02,
            rtt_poor: Duration::from_millis(300),
            rtt_good: Duration::from_millis(150),
        }
    }
}

impl QualityThresholds {
    pub fn classify(&self, stats: &LinkStats) -> QualityClass {
        let loss = stats.loss_ratio();
        let by_loss = if loss > self.loss_poor {
            QualityClass::Poor
        } else if loss > self.loss_good {
            QualityClass::Good
        } else {
            QualityClass::Excellent
        };

        let by_rtt = if stats.round_trip > self.rtt_poor {
            QualityClass::Poor
        } else if stats.round_trip > self.rtt_good {
            QualityClass::Good
        } else {
            QualityClass::Excellent
        };

        by_loss.max(by_rtt)
    }
}

/// Latest quality sample of one link. Overwritten in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionQuality {
    pub class: QualityClass,
    pub round_trip: Option<Duration>,
    pub packet_loss: Option<f64>,
    /// Unix milliseconds of the last sample
    pub sampled_at: Option<u64>,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            class: QualityClass::Disconnected,
            round_trip: None,
            packet_loss: None,
            sampled_at: None,
        }
    }
}

impl ConnectionQuality {
    pub fn record(&mut self, stats: &LinkStats, thresholds: &QualityThresholds, now: u64) {
        self.class = thresholds.classify(stats);
        self.round_trip = Some(stats.round_trip);
        self.packet_loss = Some(stats.loss_ratio());
        self.sampled_at = Some(now);
    }

    /// Statistics could not be read, or the link is gone for good.
    pub fn record_unavailable(&mut self, now: u64) {
        self.class = QualityClass::Disconnected;
        self.sampled_at = Some(now);
    }
}

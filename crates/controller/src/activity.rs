//! Append-only record of dosing activity.
//!
//! Two views over the same events: a bounded all-time history (oldest
//! evicted first) for local statistics, and a session list that
//! accumulates until the reporting path confirms delivery and calls
//! [`ActivityLog::clear_session`]. Failed deliveries simply leave the
//! session intact, so the next cycle retries with the same content.

use serde::Serialize;
use std::collections::VecDeque;
use time::OffsetDateTime;

use crate::config::CHANNEL_COUNT;

/// Default bound on the all-time history.
pub const DEFAULT_MAX_ACTIVITIES: usize = 50;

// ---------------------------------------------------------------------------
// Event records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DoseActivity {
    /// Pump position, 1..=8.
    pub position: u8,
    pub enabled: bool,
    pub speed: f64,
    /// Dose length in seconds.
    pub duration: f64,
    /// Unix timestamp.
    pub timestamp: i64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayActivity {
    /// Relay board position.
    pub position: u8,
    pub duration: f64,
    pub timestamp: i64,
    pub description: String,
}

/// Per-pump usage aggregate over the retained history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpUsage {
    pub position: u8,
    pub activations: usize,
    pub total_runtime: f64,
    pub avg_duration: f64,
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

pub struct ActivityLog {
    activities: VecDeque<DoseActivity>,
    max_activities: usize,
    session: Vec<DoseActivity>,
    relay_session: Vec<RelayActivity>,
}

impl ActivityLog {
    pub fn new(max_activities: usize) -> Self {
        Self {
            activities: VecDeque::with_capacity(max_activities),
            max_activities,
            session: Vec::new(),
            relay_session: Vec::new(),
        }
    }

    /// Record a dose at the current time.
    pub fn record(&mut self, position: u8, speed: f64, duration: f64) {
        self.record_at(position, speed, duration, now_unix());
    }

    pub(crate) fn record_at(&mut self, position: u8, speed: f64, duration: f64, timestamp: i64) {
        let activity = DoseActivity {
            position,
            enabled: true,
            speed,
            duration,
            timestamp,
            description: format!(
                "Pump {position} dose at {:.0}% for {duration}s",
                speed * 100.0
            ),
        };

        self.session.push(activity.clone());
        self.activities.push_back(activity);
        while self.activities.len() > self.max_activities {
            self.activities.pop_front();
        }
    }

    /// Record a reservoir refill relay shot at the current time.
    pub fn record_relay(&mut self, position: u8, duration: f64) {
        self.relay_session.push(RelayActivity {
            position,
            duration,
            timestamp: now_unix(),
            description: format!("Relay {position} refill for {duration}s"),
        });
    }

    /// Session doses in arrival order, ready for reporting. Read-only.
    pub fn session_activities(&self) -> &[DoseActivity] {
        &self.session
    }

    /// Session relay shots in arrival order.
    pub fn relay_session(&self) -> &[RelayActivity] {
        &self.relay_session
    }

    /// Drop the session lists after confirmed delivery. History is
    /// unaffected.
    pub fn clear_session(&mut self) {
        self.session.clear();
        self.relay_session.clear();
    }

    /// Doses from the last `window_seconds`, independent of session state.
    pub fn recent(&self, window_seconds: i64) -> Vec<DoseActivity> {
        self.recent_at(window_seconds, now_unix())
    }

    fn recent_at(&self, window_seconds: i64, now: i64) -> Vec<DoseActivity> {
        let cutoff = now - window_seconds;
        self.activities
            .iter()
            .filter(|a| a.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Per-position usage statistics over the retained history, computed
    /// fresh on each call.
    pub fn statistics(&self) -> Vec<PumpUsage> {
        (1..=CHANNEL_COUNT as u8)
            .map(|position| {
                let mut activations = 0;
                let mut total_runtime = 0.0;
                for a in self.activities.iter().filter(|a| a.position == position) {
                    activations += 1;
                    total_runtime += a.duration;
                }
                let avg_duration = if activations > 0 {
                    total_runtime / activations as f64
                } else {
                    0.0
                };
                PumpUsage {
                    position,
                    activations,
                    total_runtime,
                    avg_duration,
                }
            })
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.activities.len()
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ACTIVITIES)
    }
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ===========================================================================
// Tests
// ===========================================================================

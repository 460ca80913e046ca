//! Shared controller state: a snapshot of the latest readings plus a
//! bounded ring of recent events, behind an async RwLock.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::config::CHANNEL_COUNT;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedState = Arc<RwLock<ControllerState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct ControllerState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    /// Latest raw moisture readings (pulses/sec), channels 1..=8.
    pub last_readings: Vec<f64>,
    /// Latest debounced reservoir verdict, if a gate is fitted.
    pub water_present: Option<bool>,
    pub events: VecDeque<ControllerEvent>,
}

#[derive(Clone, Serialize)]
pub struct ControllerEvent {
    pub ts: i64,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Cycle,
    Dose,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl ControllerState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            last_readings: vec![0.0; CHANNEL_COUNT],
            water_present: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record the outcome of a completed cycle.
    pub fn record_cycle(&mut self, readings: Vec<f64>, water_present: Option<bool>) {
        let detail = format!(
            "readings: [{}]",
            readings
                .iter()
                .map(|r| format!("{r:.2}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.last_readings = readings;
        self.water_present = water_present;
        self.push_event(EventKind::Cycle, detail);
    }

    /// Record a dose on `position`.
    pub fn record_dose(&mut self, position: u8, duration: f64) {
        self.push_event(EventKind::Dose, format!("pump {position} dosed {duration}s"));
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(ControllerEvent {
            ts: OffsetDateTime::now_utc().unix_timestamp(),
            kind,
            detail,
        });
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ring_is_bounded() {
        let mut state = ControllerState::new();
        for i in 0..(MAX_EVENTS + 10) {
            state.record_system(format!("event {i}"));
        }
        assert_eq!(state.events.len(), MAX_EVENTS);
        // Oldest entries were evicted.
        assert_eq!(state.events.front().unwrap().detail, "event 10");
    }

    #[test]
    fn record_cycle_updates_snapshot() {
        let mut state = ControllerState::new();
        state.record_cycle(vec![1.0; CHANNEL_COUNT], Some(true));
        assert_eq!(state.last_readings, vec![1.0; CHANNEL_COUNT]);
        assert_eq!(state.water_present, Some(true));
        assert_eq!(state.events.len(), 1);
    }
}

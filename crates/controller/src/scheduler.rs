//! Irrigation cycle engine: walks the eight channels, compares each
//! moisture reading against its dryness threshold, and doses the paired
//! pump when the soil is too dry and the reservoir confirms water.
//!
//! The dosing rule per channel is:
//!
//! ```text
//! dose  ⟺  reading >= threshold  AND  (pump_when_dry OR water confirmed)
//! ```
//!
//! A channel fault (pump or probe) is contained to that channel — the
//! rest of the pass continues and the cycle still reports. Dose records
//! accumulate in the session until a report is confirmed delivered, so a
//! broker outage never loses activity data.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rumqttc::{AsyncClient, QoS};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::activity::{now_unix, ActivityLog};
use crate::config::{Irrigation, ThresholdPolicy};
use crate::hal::RelayOutput;
use crate::moisture::MoistureSensor;
use crate::peripherals::{EnvSensor, LogDisplay, PhProbe, StatusDisplay};
use crate::pump::Pump;
use crate::report::{report_topic, CycleReport, DoseCommand};
use crate::state::SharedState;
use crate::water::WaterLevelGate;

#[cfg(feature = "sim")]
use crate::sim::SoilPulseSim;
#[cfg(feature = "sim")]
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

/// One paired probe/pump slot on the board.
pub struct Channel {
    pub sensor: Arc<MoistureSensor>,
    pub pump: Pump,
}

struct Reporter {
    mqtt: AsyncClient,
    device_id: String,
}

struct RefillRelay {
    relay: Box<dyn RelayOutput>,
    position: u8,
    duration: Duration,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    channels: Vec<Channel>,
    policy: ThresholdPolicy,
    pump_when_dry: bool,
    dose_duration: Duration,
    cycle_delay: Duration,
    channel_delay: Duration,
    water_gate: Option<WaterLevelGate>,
    refill: Option<RefillRelay>,
    reporter: Option<Reporter>,
    commands: Option<mpsc::UnboundedReceiver<DoseCommand>>,
    env_sensor: Option<Box<dyn EnvSensor>>,
    ph_probe: Option<Box<dyn PhProbe>>,
    display: Box<dyn StatusDisplay>,
    log: ActivityLog,
    shared: SharedState,
    #[cfg(feature = "sim")]
    sim: Option<Arc<Mutex<SoilPulseSim>>>,
}

impl Scheduler {
    pub fn new(channels: Vec<Channel>, irrigation: &Irrigation, shared: SharedState) -> Self {
        Self {
            channels,
            policy: irrigation.soil_wet_threshold.clone(),
            pump_when_dry: irrigation.pump_when_dry,
            dose_duration: Duration::from_secs_f64(irrigation.dose_duration_sec),
            cycle_delay: Duration::from_secs_f64(irrigation.cycle_delay_sec),
            channel_delay: Duration::from_secs_f64(irrigation.channel_delay_sec),
            water_gate: None,
            refill: None,
            reporter: None,
            commands: None,
            env_sensor: None,
            ph_probe: None,
            display: Box::new(LogDisplay),
            log: ActivityLog::default(),
            shared,
            #[cfg(feature = "sim")]
            sim: None,
        }
    }

    pub fn with_water_gate(mut self, gate: WaterLevelGate) -> Self {
        self.water_gate = Some(gate);
        self
    }

    pub fn with_refill(mut self, relay: Box<dyn RelayOutput>, position: u8, duration: Duration) -> Self {
        self.refill = Some(RefillRelay {
            relay,
            position,
            duration,
        });
        self
    }

    pub fn with_reporter(mut self, mqtt: AsyncClient, device_id: String) -> Self {
        self.reporter = Some(Reporter { mqtt, device_id });
        self
    }

    pub fn with_commands(mut self, rx: mpsc::UnboundedReceiver<DoseCommand>) -> Self {
        self.commands = Some(rx);
        self
    }

    pub fn with_env_sensor(mut self, sensor: Box<dyn EnvSensor>) -> Self {
        self.env_sensor = Some(sensor);
        self
    }

    pub fn with_ph_probe(mut self, probe: Box<dyn PhProbe>) -> Self {
        self.ph_probe = Some(probe);
        self
    }

    pub fn with_display(mut self, display: Box<dyn StatusDisplay>) -> Self {
        self.display = display;
        self
    }

    #[cfg(feature = "sim")]
    pub fn with_sim(mut self, sim: Arc<Mutex<SoilPulseSim>>) -> Self {
        self.sim = Some(sim);
        self
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run cycles forever, pausing `cycle_delay` between passes.
    pub async fn run(&mut self) {
        info!(
            channels = self.channels.len(),
            pump_when_dry = self.pump_when_dry,
            gate = self.water_gate.is_some(),
            "scheduler started"
        );
        self.shared
            .write()
            .await
            .record_system("scheduler started".to_string());

        loop {
            if let Err(e) = self.run_cycle().await {
                error!("cycle failed: {e:#}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("cycle failed: {e:#}"));
            }
            sleep(self.cycle_delay).await;
        }
    }

    /// One full pass over every channel, plus auxiliary reads, refill,
    /// remote command intake, and the cycle report.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let mut readings = Vec::with_capacity(self.channels.len());
        let mut saturation = Vec::with_capacity(self.channels.len());
        let mut water_present: Option<bool> = None;

        for index in 0..self.channels.len() {
            let position = (index + 1) as u8;
            let reading = self.channels[index].sensor.moisture();
            readings.push(reading);
            saturation.push(self.channels[index].sensor.saturation());

            let threshold = self.policy.threshold_for(index);

            // Fresh gate sample per channel — the reservoir can run out
            // mid-pass, and a late channel must not dose from air.
            let has_water = self.sample_gate().await;
            if has_water.is_some() {
                water_present = has_water;
            }

            if should_dose(reading, threshold, self.pump_when_dry, has_water) {
                info!(
                    channel = position,
                    reading = format!("{reading:.2}"),
                    threshold = format!("{threshold:.2}"),
                    "soil dry — dosing"
                );
                self.dose_channel(index, 1.0, self.dose_duration).await;
            } else {
                debug!(
                    channel = position,
                    reading = format!("{reading:.2}"),
                    threshold = format!("{threshold:.2}"),
                    ?has_water,
                    "no dose"
                );
            }

            sleep(self.channel_delay).await;
        }

        // Auxiliary peripherals are best-effort; a failed read just drops
        // the field from this cycle's report.
        let environment = self.env_sensor.as_mut().and_then(|s| match s.read() {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("environment sensor read failed: {e:#}");
                None
            }
        });
        let ph = self.ph_probe.as_mut().and_then(|p| match p.read_ph() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("pH probe read failed: {e:#}");
                None
            }
        });

        if water_present == Some(false) {
            self.run_refill().await;
        }

        self.process_remote_command(water_present).await;

        let avg_saturation = saturation.iter().sum::<f64>() / saturation.len().max(1) as f64;
        let water_line = match water_present {
            Some(true) => "water ok",
            Some(false) => "water LOW",
            None => "no gate",
        };
        self.display
            .show(&format!("sat avg {avg_saturation:.2}"), water_line);

        self.shared
            .write()
            .await
            .record_cycle(readings.clone(), water_present);

        if let Some(device_id) = self.reporter.as_ref().map(|r| r.device_id.clone()) {
            let report = CycleReport {
                device_id,
                ts: now_unix(),
                readings,
                saturation,
                water_present,
                environment,
                ph,
                dose_activities: self.log.session_activities().to_vec(),
                relay_activities: self.log.relay_session().to_vec(),
            };
            self.publish_report(&report).await;
        }

        Ok(())
    }

    /// Stop every pump. Called on shutdown so no channel is left running.
    pub fn shutdown(&mut self) {
        for channel in &mut self.channels {
            if let Err(e) = channel.pump.stop() {
                error!(channel = channel.pump.channel(), "failed to stop pump: {e:#}");
            }
        }
        if let Some(refill) = &mut self.refill {
            if let Err(e) = refill.relay.set(false) {
                error!("failed to release refill relay: {e:#}");
            }
        }
        info!("scheduler shut down, all pumps stopped");
    }

    #[cfg(test)]
    pub(crate) fn session_len(&self) -> usize {
        self.log.session_activities().len()
    }

    // -----------------------------------------------------------------------
    // Cycle steps
    // -----------------------------------------------------------------------

    /// Debounced reservoir verdict, or `None` when no gate is fitted. A
    /// gate read failure counts as "no water" so a faulty sensor can
    /// never authorize a dose.
    async fn sample_gate(&mut self) -> Option<bool> {
        let gate = self.water_gate.as_mut()?;
        match gate.has_water().await {
            Ok(present) => Some(present),
            Err(e) => {
                error!("water gate read failed: {e:#}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("water gate: {e:#}"));
                Some(false)
            }
        }
    }

    /// Dose one channel and record it. A pump fault is logged and the
    /// pump stopped; the caller moves on to the next channel.
    async fn dose_channel(&mut self, index: usize, speed: f64, duration: Duration) {
        let position = (index + 1) as u8;

        #[cfg(feature = "sim")]
        self.set_sim_watering(Some(index));
        let result = self.channels[index].pump.dose(speed, duration).await;
        #[cfg(feature = "sim")]
        self.set_sim_watering(None);

        match result {
            Ok(()) => {
                self.log.record(position, speed, duration.as_secs_f64());
                self.shared
                    .write()
                    .await
                    .record_dose(position, duration.as_secs_f64());
            }
            Err(e) => {
                error!(channel = position, "dose failed: {e:#}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("pump {position}: {e:#}"));
                if let Err(e) = self.channels[index].pump.stop() {
                    error!(channel = position, "failed to stop pump after fault: {e:#}");
                }
            }
        }
    }

    /// Single refill shot: relay on, hold, relay off. Runs at most once
    /// per cycle, only when the gate reported an empty reservoir.
    async fn run_refill(&mut self) {
        let Some(refill) = self.refill.as_mut() else {
            return;
        };

        info!(
            position = refill.position,
            duration_sec = refill.duration.as_secs_f64(),
            "reservoir empty — running refill relay"
        );

        if let Err(e) = refill.relay.set(true) {
            error!("refill relay on failed: {e:#}");
            self.shared
                .write()
                .await
                .record_error(format!("refill relay: {e:#}"));
            return;
        }
        sleep(refill.duration).await;
        if let Err(e) = refill.relay.set(false) {
            error!("refill relay off failed: {e:#}");
            self.shared
                .write()
                .await
                .record_error(format!("refill relay: {e:#}"));
            return;
        }

        let position = refill.position;
        let duration_sec = refill.duration.as_secs_f64();
        self.log.record_relay(position, duration_sec);
        self.shared
            .write()
            .await
            .record_system(format!("refill relay {position} ran {duration_sec}s"));
    }

    /// Drain at most one remote dose command per cycle. Commands obey
    /// the same water gating as automatic doses.
    async fn process_remote_command(&mut self, water_present: Option<bool>) {
        let Some(rx) = self.commands.as_mut() else {
            return;
        };
        let Ok(cmd) = rx.try_recv() else {
            return;
        };

        info!(
            position = cmd.position,
            duration_sec = cmd.duration,
            "remote dose command received"
        );

        if !self.pump_when_dry && water_present != Some(true) {
            warn!(
                position = cmd.position,
                "remote dose refused: no confirmed water"
            );
            self.shared.write().await.record_error(format!(
                "remote dose refused for pump {}: no confirmed water",
                cmd.position
            ));
            return;
        }

        let index = (cmd.position - 1) as usize;
        self.dose_channel(index, 1.0, Duration::from_secs_f64(cmd.duration))
            .await;
    }

    /// Publish the cycle report. The session is cleared only on a
    /// publish accepted while the broker link is up; anything less keeps
    /// the records for the next attempt.
    async fn publish_report(&mut self, report: &CycleReport) {
        let Some(reporter) = self.reporter.as_ref() else {
            return;
        };

        let payload = match serde_json::to_vec(report) {
            Ok(p) => p,
            Err(e) => {
                error!("failed to serialize report: {e:#}");
                return;
            }
        };
        let topic = report_topic(&reporter.device_id);
        let connected = self.shared.read().await.mqtt_connected;

        match reporter
            .mqtt
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(()) if connected => {
                debug!(
                    doses = report.dose_activities.len(),
                    "report published — session cleared"
                );
                self.log.clear_session();
            }
            Ok(()) => {
                warn!("report buffered while broker disconnected — session retained");
            }
            Err(e) => {
                error!("report publish failed: {e:#} — session retained");
                self.shared
                    .write()
                    .await
                    .record_error(format!("report publish: {e:#}"));
            }
        }
    }

    #[cfg(feature = "sim")]
    fn set_sim_watering(&self, channel: Option<usize>) {
        if let Some(sim) = &self.sim {
            sim.lock()
                .unwrap_or_else(|p| p.into_inner())
                .set_watering(channel);
        }
    }
}

// ---------------------------------------------------------------------------
// Decision rule
// ---------------------------------------------------------------------------

/// The per-channel dosing decision. `has_water` is `None` when no gate
/// is fitted, which authorizes nothing — only `pump_when_dry` can
/// override a missing or dry reservoir.
fn should_dose(reading: f64, threshold: f64, pump_when_dry: bool, has_water: Option<bool>) -> bool {
    reading >= threshold && (pump_when_dry || has_water == Some(true))
}

// ===========================================================================
// Tests
// ===========================================================================

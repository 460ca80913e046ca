mod activity;
mod config;
mod hal;
mod moisture;
mod peripherals;
mod pump;
mod report;
mod scheduler;
#[cfg(feature = "sim")]
mod sim;
mod state;
mod water;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, CHANNEL_COUNT};
use hal::{DigitalInput, PwmOutput, RelayOutput};
use moisture::MoistureSensor;
use peripherals::{EnvSensor, PhProbe};
use pump::Pump;
use report::DoseCommand;
use scheduler::{Channel, Scheduler};
use state::{ControllerState, SharedState};
use water::WaterLevelGate;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(device_id = %cfg.device_id, config = %config_path, "config loaded");

    let shared = ControllerState::shared();
    shared
        .write()
        .await
        .record_system("controller started".to_string());

    // ── Probes and pumps ────────────────────────────────────────────
    let sensors: Vec<Arc<MoistureSensor>> = (1..=CHANNEL_COUNT as u8)
        .map(|position| {
            Arc::new(MoistureSensor::new(
                position,
                Some(cfg.calibration.wet_point),
                Some(cfg.calibration.dry_point),
            ))
        })
        .collect();

    let mut channels = Vec::with_capacity(CHANNEL_COUNT);
    for (index, sensor) in sensors.iter().enumerate() {
        let position = (index + 1) as u8;
        channels.push(Channel {
            sensor: Arc::clone(sensor),
            pump: Pump::new(position, make_pwm(position)?),
        });
    }

    // Edge interrupts feed the sensors directly. The claimed pins must
    // stay alive until shutdown — dropping them detaches the interrupts.
    #[cfg(feature = "gpio")]
    let _pulse_inputs: Vec<hal::GpioPulseInput> = {
        use hal::PulseInput;
        let mut inputs = Vec::with_capacity(sensors.len());
        for (index, sensor) in sensors.iter().enumerate() {
            let mut input = hal::GpioPulseInput::new((index + 1) as u8)?;
            let isr_sensor = Arc::clone(sensor);
            input.on_rising_edge(Box::new(move || isr_sensor.on_edge()))?;
            inputs.push(input);
        }
        info!(probes = inputs.len(), "edge interrupts attached");
        inputs
    };

    // Without hardware, a simulator task generates the pulse trains.
    #[cfg(all(feature = "sim", not(feature = "gpio")))]
    let soil_sim = {
        let scenario =
            sim::Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
        info!(%scenario, "running with simulated probes");
        let soil_sim = Arc::new(std::sync::Mutex::new(sim::SoilPulseSim::new(
            scenario,
            CHANNEL_COUNT,
            cfg.calibration.wet_point,
            cfg.calibration.dry_point,
        )));
        sim::drive(Arc::clone(&soil_sim), sensors.clone());
        soil_sim
    };

    // ── Water gate / refill ─────────────────────────────────────────
    let water_gate = if cfg.water_sensor.enabled {
        Some(WaterLevelGate::new(make_water_input(
            cfg.water_sensor.gpio_pin,
        )?))
    } else {
        warn!("water sensor disabled — dosing requires pump_when_dry");
        None
    };

    // ── MQTT reporting ──────────────────────────────────────────────
    let mut mqtt_client: Option<AsyncClient> = None;
    let mut command_rx: Option<mpsc::UnboundedReceiver<DoseCommand>> = None;
    if cfg.reporting.enabled {
        let (client, rx) = start_mqtt(&cfg, Arc::clone(&shared)).await?;
        mqtt_client = Some(client);
        command_rx = rx;
    }

    // ── Scheduler ───────────────────────────────────────────────────
    let mut sched = Scheduler::new(channels, &cfg.irrigation, Arc::clone(&shared));
    if let Some(gate) = water_gate {
        sched = sched.with_water_gate(gate);
    }
    if cfg.refill.enabled {
        sched = sched.with_refill(
            make_relay(cfg.refill.gpio_pin)?,
            cfg.refill.relay_position,
            Duration::from_secs_f64(cfg.refill.duration_sec),
        );
    }
    if let Some(client) = mqtt_client {
        sched = sched.with_reporter(client, cfg.device_id.clone());
    }
    if let Some(rx) = command_rx {
        sched = sched.with_commands(rx);
    }
    if let Some(env_sensor) = make_env_sensor(&cfg) {
        sched = sched.with_env_sensor(env_sensor);
    }
    if let Some(ph_probe) = make_ph_probe(&cfg) {
        sched = sched.with_ph_probe(ph_probe);
    }
    #[cfg(all(feature = "sim", not(feature = "gpio")))]
    {
        sched = sched.with_sim(soil_sim);
    }

    tokio::select! {
        _ = sched.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    sched.shutdown();
    shared
        .write()
        .await
        .record_system("controller stopped".to_string());
    Ok(())
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

/// Connect the broker link and spawn its event loop. The event loop task
/// owns connectivity tracking and forwards validated remote dose
/// commands; the returned client is handed to the scheduler for
/// publishing reports.
async fn start_mqtt(
    cfg: &Config,
    shared: SharedState,
) -> Result<(AsyncClient, Option<mpsc::UnboundedReceiver<DoseCommand>>)> {
    let client_id = format!("grow-controller-{}", cfg.device_id);
    let mut options = MqttOptions::new(
        client_id,
        cfg.reporting.mqtt_host.clone(),
        cfg.reporting.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(options, 20);

    let mut command_tx: Option<mpsc::UnboundedSender<DoseCommand>> = None;
    let mut command_rx = None;
    if cfg.reporting.remote_commands {
        client
            .subscribe(report::command_topic(&cfg.device_id), QoS::AtLeastOnce)
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        command_tx = Some(tx);
        command_rx = Some(rx);
        info!(device_id = %cfg.device_id, "remote dose commands enabled");
    }

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    let mut st = shared.write().await;
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected".to_string());
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match report::parse_dose_command(&p.payload) {
                        Ok(cmd) => {
                            if let Some(tx) = &command_tx {
                                let _ = tx.send(cmd);
                            }
                        }
                        Err(e) => {
                            warn!(topic = %p.topic, "rejected dose command: {e:#}");
                            shared
                                .write()
                                .await
                                .record_error(format!("rejected dose command: {e:#}"));
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_system("mqtt disconnected".to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. reconnecting...");
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                    drop(st);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    Ok((client, command_rx))
}

// ---------------------------------------------------------------------------
// Hardware wiring (feature-gated)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
fn make_pwm(position: u8) -> Result<Box<dyn PwmOutput>> {
    Ok(Box::new(hal::GpioPwm::new(position)?))
}

#[cfg(not(feature = "gpio"))]
fn make_pwm(_position: u8) -> Result<Box<dyn PwmOutput>> {
    Ok(Box::new(hal::MockPwm::default()))
}

#[cfg(feature = "gpio")]
fn make_water_input(pin: u8) -> Result<Box<dyn DigitalInput>> {
    Ok(Box::new(hal::GpioDigitalInput::new(pin)?))
}

/// Development builds pin the gate low: water always present.
#[cfg(not(feature = "gpio"))]
fn make_water_input(_pin: u8) -> Result<Box<dyn DigitalInput>> {
    Ok(Box::new(hal::MockDigitalInput::held(false)))
}

#[cfg(feature = "gpio")]
fn make_relay(pin: u8) -> Result<Box<dyn RelayOutput>> {
    // Common refill relay boards are active-low.
    Ok(Box::new(hal::GpioRelay::new(pin, true)?))
}

#[cfg(not(feature = "gpio"))]
fn make_relay(_pin: u8) -> Result<Box<dyn RelayOutput>> {
    Ok(Box::new(hal::MockRelay::default()))
}

#[cfg(feature = "sim")]
fn make_env_sensor(cfg: &Config) -> Option<Box<dyn EnvSensor>> {
    cfg.peripherals
        .co2_enabled
        .then(|| Box::new(peripherals::SimEnvSensor) as Box<dyn EnvSensor>)
}

#[cfg(not(feature = "sim"))]
fn make_env_sensor(cfg: &Config) -> Option<Box<dyn EnvSensor>> {
    if cfg.peripherals.co2_enabled {
        warn!("co2 peripheral enabled but this build carries no driver");
    }
    None
}

#[cfg(feature = "sim")]
fn make_ph_probe(cfg: &Config) -> Option<Box<dyn PhProbe>> {
    cfg.peripherals
        .ph_enabled
        .then(|| Box::new(peripherals::SimPhProbe) as Box<dyn PhProbe>)
}

#[cfg(not(feature = "sim"))]
fn make_ph_probe(cfg: &Config) -> Option<Box<dyn PhProbe>> {
    if cfg.peripherals.ph_enabled {
        warn!("pH peripheral enabled but this build carries no driver");
    }
    None
}

use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta, Timelike};
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};

use crate::config::{read_config, write_config, Hub4Settings, SharedConfig};
use crate::metering_modbus::MeterSnapshot;
use inverter::{InverterCommand, InverterData};

pub mod inverter;

const STEP_INTERVAL: Duration = Duration::from_secs(5);
/// Share of the grid power error corrected in one step
const ALPHA: f64 = 0.8;
const MAINTENANCE_HOUR: u32 = 12;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Hub4State {
    SelfConsumption,
    ChargeFromGrid,
    Charged,
    Storage,
    External,
}

impl Hub4State {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SelfConsumption" => Some(Hub4State::SelfConsumption),
            "ChargeFromGrid" => Some(Hub4State::ChargeFromGrid),
            "Charged" => Some(Hub4State::Charged),
            "Storage" => Some(Hub4State::Storage),
            "External" => Some(Hub4State::External),
            _ => None,
        }
    }

    pub fn to_string(&self) -> String {
        match self {
            Hub4State::SelfConsumption => "SelfConsumption".to_string(),
            Hub4State::ChargeFromGrid => "ChargeFromGrid".to_string(),
            Hub4State::Charged => "Charged".to_string(),
            Hub4State::Storage => "Storage".to_string(),
            Hub4State::External => "External".to_string(),
        }
    }
}

/// Local wall clock, replaceable in tests.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Result of one control step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub commands: Vec<InverterCommand>,
    pub state: Hub4State,
    pub maintenance_date: Option<NaiveDateTime>,
}

/// Grid setpoint controller. Steps once both the meter and the inverter
/// reported since the last step, or when the step timer expired.
pub struct ControlLoop<C: Clock> {
    settings: Hub4Settings,
    clock: C,
    meter_power: f64,
    inverter: InverterData,
    meter_updated: bool,
    inverter_updated: bool,
}

impl<C: Clock> ControlLoop<C> {
    pub fn new(settings: Hub4Settings, clock: C) -> Self {
        ControlLoop {
            settings,
            clock,
            meter_power: f64::NAN,
            inverter: InverterData::new(),
            meter_updated: false,
            inverter_updated: false,
        }
    }

    pub fn settings(&self) -> &Hub4Settings {
        &self.settings
    }

    pub fn state(&self) -> Hub4State {
        self.settings.state
    }

    pub fn settings_changed(&mut self, settings: Hub4Settings) {
        if settings.state != self.settings.state {
            self.set_state(settings.state);
        }
        self.settings = settings;
    }

    pub fn on_timer(&mut self) -> Option<StepOutput> {
        debug!("Update timeout");
        self.meter_updated = true;
        self.inverter_updated = true;
        self.check_step()
    }

    pub fn on_meter_update(&mut self, power: f64) -> Option<StepOutput> {
        self.meter_power = power;
        self.meter_updated = true;
        self.check_step()
    }

    pub fn on_inverter_update(&mut self, data: InverterData) -> Option<StepOutput> {
        self.inverter = data;
        self.inverter_updated = true;
        self.check_step()
    }

    fn check_step(&mut self) -> Option<StepOutput> {
        if !self.meter_updated || !self.inverter_updated {
            return None;
        }
        let output = self.step(rand::thread_rng().gen::<f64>() / 10.0);
        self.meter_updated = false;
        self.inverter_updated = false;
        Some(output)
    }

    /// One control step. `jitter` is subtracted from the setpoint so the
    /// inverter sees a new value on every step, it drops the setpoint when
    /// it has not changed for a while.
    pub fn step(&mut self, jitter: f64) -> StepOutput {
        // p < 0: battery is discharging, p > 0: battery is charging
        let max_charge_pct = self.settings.max_charge_percentage.clamp(0.0, 100.0);
        let max_discharge_pct = self.settings.max_discharge_percentage.clamp(0.0, 100.0);
        let max_power = max_charge_pct * self.inverter.max_charge_current * self.inverter.dc_voltage / 100.0;
        let charged = self.inverter.is_charged();

        if self.settings.maintenance_interval == 0 {
            self.set_state(Hub4State::External);
        } else if self.settings.state == Hub4State::External {
            self.set_state(Hub4State::SelfConsumption);
        }

        let mut p = match self.settings.state {
            Hub4State::SelfConsumption => {
                let p = self.compute_setpoint();
                let base = match self.settings.maintenance_date {
                    Some(date) => date,
                    None => self.update_maintenance_date(),
                };
                let next_charge = base + TimeDelta::days(self.settings.maintenance_interval as i64);
                let now = self.clock.now();
                if now >= next_charge && now.hour() == MAINTENANCE_HOUR {
                    self.set_state(Hub4State::ChargeFromGrid);
                }
                if charged {
                    self.set_state(Hub4State::Charged);
                }
                p
            }
            Hub4State::Charged => {
                let p = self.compute_setpoint();
                if !charged {
                    self.set_state(Hub4State::SelfConsumption);
                    self.update_maintenance_date();
                }
                p
            }
            Hub4State::External => self.compute_setpoint(),
            Hub4State::ChargeFromGrid => {
                if charged {
                    self.set_state(Hub4State::SelfConsumption);
                    self.update_maintenance_date();
                }
                max_power
            }
            Hub4State::Storage => {
                if charged {
                    self.settings.maintenance_date = None;
                }
                max_power
            }
        };

        let feedback_disabled = max_discharge_pct < 50.0;
        // Disabling charge on the inverter also stops discharging, so only
        // set it while not discharging
        let charge_disabled = max_charge_pct <= 0.0 && (feedback_disabled || p > 30.0);
        // A NaN setpoint has to stay NaN, f64::min would hide it
        if max_power < p {
            p = max_power;
        }
        p -= jitter;

        let mut commands = vec![
            InverterCommand::SetChargeDisabled(charge_disabled),
            InverterCommand::SetFeedbackDisabled(feedback_disabled),
        ];
        if p.is_finite() {
            commands.push(InverterCommand::SetAcPowerSetpoint(p));
        }
        StepOutput {
            commands,
            state: self.settings.state,
            maintenance_date: self.settings.maintenance_date,
        }
    }

    fn compute_setpoint(&self) -> f64 {
        if !self.meter_power.is_finite() {
            return f64::NAN;
        }
        let inverter_power = self.inverter.ac_power_in(self.settings.phase);
        inverter_power + ALPHA * (self.settings.ac_power_setpoint - self.meter_power)
    }

    fn update_maintenance_date(&mut self) -> NaiveDateTime {
        let now = self.clock.now();
        let base = now.date().and_hms_opt(1, 0, 0).unwrap_or(now);
        self.settings.maintenance_date = Some(base);
        info!("Next maintenance base date set at: {base}");
        base
    }

    fn set_state(&mut self, state: Hub4State) {
        if self.settings.state == state {
            return;
        }
        info!("Changing Hub4 state from {} to {}", self.settings.state.to_string(), state.to_string());
        self.settings.state = state;
    }
}

/// Runs the control loop against one meter and one inverter. Ends when
/// either of them goes away or nobody takes the commands anymore.
pub struct Hub4Manager {
    config: SharedConfig,
    meter: watch::Receiver<MeterSnapshot>,
    inverter: watch::Receiver<InverterData>,
    commands: mpsc::Sender<InverterCommand>,
}

impl Hub4Manager {
    pub fn new(config: SharedConfig, meter: watch::Receiver<MeterSnapshot>,
               inverter: watch::Receiver<InverterData>, commands: mpsc::Sender<InverterCommand>) -> Self {
        Hub4Manager { config, meter, inverter, commands }
    }

    pub async fn start_thread(&mut self) {
        let settings = read_config(&self.config).hub4();
        if !settings.enabled {
            info!("Hub4 control loop disabled");
            return;
        }
        let control = ControlLoop::new(settings, SystemClock);
        self.run(control).await;
    }

    pub async fn run<C: Clock>(&mut self, mut control: ControlLoop<C>) {
        let mut config_change = read_config(&self.config).get_change_receiver();
        let mut interval = tokio::time::interval(STEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.reset();
        let mut last_meter_power = f64::NAN;
        let mut last_inverter_power = f64::NAN;
        info!("Hub4 control loop started on {}", control.settings().phase.to_string());

        loop {
            let phase = control.settings().phase;
            let output = tokio::select! {
                _ = interval.tick() => control.on_timer(),
                res = self.meter.changed() => {
                    if res.is_err() {
                        info!("Energy meter gone, stopping Hub4 control loop");
                        return;
                    }
                    let power = self.meter.borrow_and_update().primary.phase(phase).power;
                    if same_value(power, last_meter_power) {
                        None
                    } else {
                        last_meter_power = power;
                        control.on_meter_update(power)
                    }
                }
                res = self.inverter.changed() => {
                    if res.is_err() {
                        info!("Inverter gone, stopping Hub4 control loop");
                        return;
                    }
                    let data = *self.inverter.borrow_and_update();
                    let power = data.ac_power_in(phase);
                    if same_value(power, last_inverter_power) {
                        control.inverter = data;
                        None
                    } else {
                        last_inverter_power = power;
                        control.on_inverter_update(data)
                    }
                }
                change = config_change.recv() => {
                    match change {
                        Ok(change) if change.base == "hub4" => control.settings_changed(read_config(&self.config).hub4()),
                        Ok(_) => {},
                        Err(RecvError::Lagged(_)) => control.settings_changed(read_config(&self.config).hub4()),
                        Err(RecvError::Closed) => warn!("Config change channel closed"),
                    }
                    None
                }
            };

            let Some(output) = output else {
                continue;
            };
            interval.reset();
            write_config(&self.config).store_hub4_state(output.state, output.maintenance_date);
            for command in output.commands {
                if self.commands.send(command).await.is_err() {
                    info!("Inverter command channel closed, stopping Hub4 control loop");
                    return;
                }
            }
        }
    }
}

fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

use chrono::NaiveDateTime;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::hub4::Hub4State;
use crate::models::Phase;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read the config on config/m2h.yaml or m2h.yaml")]
    NotFound,
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Invalid settings: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No settings for meter {0}")]
    UnknownMeter(String),
}

/// Overwrites the top level keys of `current` with the ones in `patch`.
fn merge_json(current: &mut serde_json::Value, patch: serde_json::Value) -> Result<(), ConfigError> {
    let (serde_json::Value::Object(current), serde_json::Value::Object(patch)) = (current, patch) else {
        return Err(ConfigError::Json(serde::de::Error::custom("settings must be a JSON object")));
    };
    for (key, value) in patch {
        current.insert(key, value);
    }
    Ok(())
}

fn serial_baud_rate_default() -> u32 { 9600 }
fn serial_response_timeout_default() -> u64 { 300 }
fn serial_slaves_default() -> Vec<u8> { vec![1] }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default="serial_baud_rate_default")]
    pub baud_rate: u32,
    #[serde(default="serial_response_timeout_default")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub is_zigbee: bool,
    #[serde(default="serial_slaves_default")]
    pub slaves: Vec<u8>,
}

fn meter_service_type_default() -> String { "grid".to_string() }
fn meter_l2_service_type_default() -> String { "pvinverter".to_string() }

/// Per meter settings, keyed by the serial the meter reports.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MeterSettings {
    pub serial: String,
    #[serde(default)]
    pub device_type: u16,
    #[serde(default)]
    pub is_multi_phase: bool,
    #[serde(default)]
    pub piggy_enabled: bool,
    #[serde(default="meter_service_type_default")]
    pub service_type: String,
    #[serde(default="meter_l2_service_type_default")]
    pub l2_service_type: String,
    #[serde(default)]
    pub device_instance: u32,
    #[serde(default)]
    pub l2_device_instance: u32,
    #[serde(default)]
    pub custom_name: Option<String>,
}

impl MeterSettings {
    pub fn new(device_type: u16, serial: String) -> Self {
        MeterSettings {
            serial,
            device_type,
            is_multi_phase: false,
            piggy_enabled: false,
            service_type: meter_service_type_default(),
            l2_service_type: meter_l2_service_type_default(),
            device_instance: 0,
            l2_device_instance: 0,
            custom_name: None,
        }
    }

    /// True when a change from `self` to `other` requires the meter to be
    /// set up again (measuring system, piggyback split).
    pub fn needs_setup(&self, other: &MeterSettings) -> bool {
        self.is_multi_phase != other.is_multi_phase
            || self.piggy_enabled != other.piggy_enabled
            || self.l2_service_type != other.l2_service_type
    }
}

fn inverter_read_prefix_default() -> String { "N/0/vebus/276".to_string() }
fn inverter_write_prefix_default() -> String { "W/0/vebus/276".to_string() }

/// Topics of the controlled inverter/charger (dbus-mqtt layout).
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct InverterConfig {
    #[serde(default="inverter_read_prefix_default")]
    pub read_prefix: String,
    #[serde(default="inverter_write_prefix_default")]
    pub write_prefix: String,
}

fn inverter_default() -> InverterConfig {
    InverterConfig { read_prefix: inverter_read_prefix_default(), write_prefix: inverter_write_prefix_default() }
}

fn hub4_enabled_default() -> bool { true }
fn hub4_phase_default() -> Phase { Phase::L1 }
fn hub4_meter_slave_default() -> u8 { 1 }
fn hub4_percentage_default() -> f64 { 100.0 }
fn hub4_maintenance_interval_default() -> u32 { 7 }
fn hub4_state_default() -> Hub4State { Hub4State::SelfConsumption }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Hub4Settings {
    #[serde(default="hub4_enabled_default")]
    pub enabled: bool,
    #[serde(default="hub4_phase_default")]
    pub phase: Phase,
    /// Slave address of the grid meter the loop regulates against
    #[serde(default="hub4_meter_slave_default")]
    pub meter_slave: u8,
    #[serde(default="hub4_percentage_default")]
    pub max_charge_percentage: f64,
    #[serde(default="hub4_percentage_default")]
    pub max_discharge_percentage: f64,
    /// Grid power the loop regulates to, positive is import
    #[serde(default)]
    pub ac_power_setpoint: f64,
    /// Days between maintenance charges, 0 hands control to an external party
    #[serde(default="hub4_maintenance_interval_default")]
    pub maintenance_interval: u32,
    #[serde(default)]
    pub maintenance_date: Option<NaiveDateTime>,
    #[serde(default="hub4_state_default")]
    pub state: Hub4State,
    #[serde(default="inverter_default")]
    pub inverter: InverterConfig,
}

impl Default for Hub4Settings {
    fn default() -> Self {
        Hub4Settings {
            enabled: hub4_enabled_default(),
            phase: hub4_phase_default(),
            meter_slave: hub4_meter_slave_default(),
            max_charge_percentage: hub4_percentage_default(),
            max_discharge_percentage: hub4_percentage_default(),
            ac_power_setpoint: 0.0,
            maintenance_interval: hub4_maintenance_interval_default(),
            maintenance_date: None,
            state: hub4_state_default(),
            inverter: inverter_default(),
        }
    }
}

fn mqtt_client_name_default() -> String { return "meter2hub4".to_string() }
fn mqtt_base_topic_default() -> String { return "meter2hub4".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_base_topic_default")]
    pub base_topic: String,
}

#[derive(Deserialize, Serialize, Clone, PartialEq, Debug)]
pub enum ConfigOperation {
    ADD,
    DELETE,
    CHANGE
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ConfigChange {
    pub operation: ConfigOperation,
    pub base: String, /* meters or hub4 */
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub serial: SerialConfig,
    #[serde(default)]
    pub meters: Vec<MeterSettings>,
    #[serde(default)]
    pub hub4: Hub4Settings,
    pub mqtt: MqttConfig,
}

/// First device instance handed out to newly detected meters.
const FIRST_DEVICE_INSTANCE: u32 = 30;

pub struct ConfigHolder {
    pub config: Config,
    sender: tokio::sync::broadcast::Sender<ConfigChange>,
    dirty: bool,
    path: PathBuf,
}

pub type SharedConfig = Arc<RwLock<ConfigHolder>>;

/// Lock helpers, a poisoned lock still holds a usable config.
pub fn read_config(config: &SharedConfig) -> RwLockReadGuard<'_, ConfigHolder> {
    config.read().unwrap_or_else(|e| e.into_inner())
}

pub fn write_config(config: &SharedConfig) -> RwLockWriteGuard<'_, ConfigHolder> {
    config.write().unwrap_or_else(|e| e.into_inner())
}

impl ConfigHolder {
    /// Looks for config/m2h.yaml first and m2h.yaml second.
    pub fn load() -> Result<Self, ConfigError> {
        for candidate in ["config/m2h.yaml", "m2h.yaml"] {
            let path = Path::new(candidate);
            if path.exists() {
                return ConfigHolder::load_from(path);
            }
        }
        Err(ConfigError::NotFound)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = ConfigHolder::parse(&contents)?;
        info!("Loaded configuration from {}", path.display());
        Ok(ConfigHolder::from_config(config, path.to_path_buf()))
    }

    pub fn parse(contents: &str) -> Result<Config, ConfigError> {
        Ok(serde_yml::from_str(contents)?)
    }

    pub fn from_config(config: Config, path: PathBuf) -> Self {
        let (s, _) = tokio::sync::broadcast::channel(100);
        ConfigHolder {
            config,
            sender: s,
            dirty: false,
            path,
        }
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    pub fn save(&mut self) -> Result<(), ConfigError> {
        /* No need to write config if it's not dirty */
        if !self.dirty {
            debug!("Who ever called me, the config is not dirty");
            return Ok(());
        }

        if self.path.exists() {
            let backup_path = self.path.with_extension("yaml.bak");
            if let Err(e) = fs::copy(&self.path, &backup_path) {
                error!("Backing up config failed, not replacing it");
                return Err(e.into());
            }
        }

        let x = serde_yml::to_string(&self.config)?;
        fs::write(&self.path, x.as_bytes())?;
        info!("New Config written");
        self.dirty = false;
        Ok(())
    }

    pub fn get_change_receiver(&self) -> tokio::sync::broadcast::Receiver<ConfigChange> {
        return self.sender.subscribe();
    }

    pub fn is_dirty(&self) -> bool {
        return self.dirty;
    }

    fn notify(&self, operation: ConfigOperation, base: &str) {
        let _ = self.sender.send(ConfigChange { operation, base: base.to_string() });
    }

    pub fn serial(&self) -> SerialConfig {
        self.config.serial.clone()
    }

    pub fn meter_settings(&self, serial: &str) -> Option<MeterSettings> {
        self.config.meters.iter().find(|m| m.serial == serial).cloned()
    }

    /// Returns the stored settings of a meter, creating and storing a default
    /// record on first detection.
    pub fn meter_settings_or_create(&mut self, device_type: u16, serial: &str) -> MeterSettings {
        if let Some(s) = self.meter_settings(serial) {
            return s;
        }

        let mut settings = MeterSettings::new(device_type, serial.to_string());
        settings.device_instance = self.next_device_instance();
        settings.l2_device_instance = settings.device_instance + 1;
        info!("Created settings for new meter {} with device instance {}", serial, settings.device_instance);

        self.config.meters.push(settings.clone());
        self.dirty = true;
        self.notify(ConfigOperation::ADD, "meters");
        settings
    }

    fn next_device_instance(&self) -> u32 {
        self.config.meters.iter()
            .map(|m| std::cmp::max(m.device_instance, m.l2_device_instance) + 1)
            .max()
            .unwrap_or(FIRST_DEVICE_INSTANCE)
            .max(FIRST_DEVICE_INSTANCE)
    }

    pub fn update_meter_settings(&mut self, settings: MeterSettings) {
        match self.config.meters.iter_mut().find(|m| m.serial == settings.serial) {
            Some(existing) => {
                *existing = settings;
                self.notify(ConfigOperation::CHANGE, "meters");
            }
            None => {
                self.config.meters.push(settings);
                self.notify(ConfigOperation::ADD, "meters");
            }
        }
        self.dirty = true;
    }

    /// Partial update of one meter's settings from a JSON object that names
    /// the meter by `serial`.
    pub fn apply_meter_settings_json(&mut self, payload: &str) -> Result<MeterSettings, ConfigError> {
        let patch: serde_json::Value = serde_json::from_str(payload)?;
        let serial = patch.get("serial").and_then(|s| s.as_str()).unwrap_or_default().to_string();
        let Some(current) = self.meter_settings(&serial) else {
            return Err(ConfigError::UnknownMeter(serial));
        };
        let mut value = serde_json::to_value(&current)?;
        merge_json(&mut value, patch)?;
        let settings: MeterSettings = serde_json::from_value(value)?;
        if settings != current {
            info!("Settings of meter {serial} changed");
            self.update_meter_settings(settings.clone());
        }
        Ok(settings)
    }

    /// Partial update of the hub4 settings from a JSON object.
    pub fn apply_hub4_json(&mut self, payload: &str) -> Result<Hub4Settings, ConfigError> {
        let patch: serde_json::Value = serde_json::from_str(payload)?;
        let current = self.hub4();
        let mut value = serde_json::to_value(&current)?;
        merge_json(&mut value, patch)?;
        let settings: Hub4Settings = serde_json::from_value(value)?;
        if settings != current {
            info!("Hub4 settings changed");
            self.update_hub4(settings.clone());
        }
        Ok(settings)
    }

    pub fn hub4(&self) -> Hub4Settings {
        self.config.hub4.clone()
    }

    pub fn update_hub4(&mut self, hub4: Hub4Settings) {
        self.config.hub4 = hub4;
        self.dirty = true;
        self.notify(ConfigOperation::CHANGE, "hub4");
    }

    /// Write back of the values the control loop owns. Does not notify, the
    /// loop already knows.
    pub fn store_hub4_state(&mut self, state: Hub4State, maintenance_date: Option<NaiveDateTime>) {
        if self.config.hub4.state == state && self.config.hub4.maintenance_date == maintenance_date {
            return;
        }
        self.config.hub4.state = state;
        self.config.hub4.maintenance_date = maintenance_date;
        self.dirty = true;
    }
}

use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::Sender;

use crate::config::{InverterConfig, MeterSettings};
use crate::hub4::inverter::{InverterCommand, InverterData, InverterState};
use crate::metering_modbus::MeterSnapshot;
use crate::models::{ConnectionState, MeterModel, Phase, PowerInfo};
use crate::mqtt::{PublishData, SubscribeData, Transmission};

/// Minimum time between two publications of the same meter.
const METER_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
/// dbus-mqtt stops publishing unless it sees a read request now and then
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

fn number(v: f64) -> Value {
    if v.is_finite() { json!(v) } else { Value::Null }
}

fn power_info_paths(map: &mut Map<String, Value>, info: &PowerInfo, path: &str, is_grid_meter: bool) {
    map.insert(format!("{path}/Current"), number(info.current));
    map.insert(format!("{path}/Voltage"), number(info.voltage));
    map.insert(format!("{path}/Power"), number(info.power));
    map.insert(format!("{path}/Energy/Forward"), number(info.energy_forward));
    if is_grid_meter {
        map.insert(format!("{path}/Energy/Reverse"), number(info.energy_reverse));
    }
}

/// Flattens one meter into the path/value layout of a Venus grid meter.
pub fn meter_paths(model: &MeterModel, settings: Option<&MeterSettings>, is_piggy: bool) -> Map<String, Value> {
    let service_type = settings.map(|s| if is_piggy { s.l2_service_type.as_str() } else { s.service_type.as_str() });
    let is_grid_meter = service_type.map_or(true, |t| t == "grid");

    let mut map = Map::new();
    let connected = model.connection_state == ConnectionState::Connected;
    map.insert("/Connected".to_string(), json!(if connected { 1 } else { 0 }));
    map.insert("/ErrorCode".to_string(), json!(model.error_code.code()));
    power_info_paths(&mut map, model.phase(Phase::MultiPhase), "/Ac", is_grid_meter);
    for phase in [Phase::L1, Phase::L2, Phase::L3] {
        power_info_paths(&mut map, model.phase(phase), &format!("/Ac/{}", phase.to_string()), is_grid_meter);
    }

    let mut product_name = model.product_name();
    if is_piggy {
        product_name.push_str(" (piggyback)");
    }
    map.insert("/ProductName".to_string(), json!(product_name));
    map.insert("/Serial".to_string(), json!(model.serial()));
    map.insert("/FirmwareVersion".to_string(), json!(model.identity.firmware_version));
    map.insert("/DeviceType".to_string(), json!(model.identity.device_type));
    map.insert("/Mgmt/Connection".to_string(), json!(model.identity.port_name));
    if let Some(s) = settings {
        let instance = if is_piggy { s.l2_device_instance } else { s.device_instance };
        map.insert("/DeviceInstance".to_string(), json!(instance));
        if let Some(name) = s.custom_name.as_ref() {
            map.insert("/CustomName".to_string(), json!(name));
        }
        if let Some(t) = service_type {
            map.insert("/ServiceType".to_string(), json!(t));
        }
    }
    map
}

/// Publishes every meter snapshot to `{base}/meters/{serial}` (and `_l2`
/// for the piggybacked companion).
pub struct MeterPublisher {
    sender: Sender<Transmission>,
    base_topic: String,
    meter: watch::Receiver<MeterSnapshot>,
}

impl MeterPublisher {
    pub fn new(sender: Sender<Transmission>, base_topic: String, meter: watch::Receiver<MeterSnapshot>) -> Self {
        MeterPublisher { sender, base_topic, meter }
    }

    pub async fn start_thread(&mut self) {
        /* The serial is cleared on disconnect, keep the last one so the
           disconnect itself can still be published */
        let mut last_serial = String::new();
        while self.meter.changed().await.is_ok() {
            let snapshot = self.meter.borrow_and_update().clone();
            if !snapshot.primary.serial().is_empty() {
                last_serial = snapshot.primary.serial().to_string();
            }
            if last_serial.is_empty() {
                continue;
            }

            let settings = snapshot.settings.as_ref();
            self.publish(format!("{}/meters/{}", self.base_topic, last_serial),
                         meter_paths(&snapshot.primary, settings, false)).await;
            if settings.is_some_and(|s| s.piggy_enabled) {
                self.publish(format!("{}/meters/{}_l2", self.base_topic, last_serial),
                             meter_paths(&snapshot.piggy, settings, true)).await;
            }
            tokio::time::sleep(METER_PUBLISH_INTERVAL).await;
        }
        info!("Meter is gone, stopping publisher");
    }

    async fn publish(&self, topic: String, paths: Map<String, Value>) {
        let p = Transmission::Publish(PublishData {
            topic,
            payload: Value::Object(paths).to_string(),
            qos: 0,
            retain: true,
        });
        let _ = self.sender.send(p).await;
    }
}

/// Parses a `{"value": x}` payload, anything else (including `null`) is NaN.
pub fn value_to_f64(payload: &str) -> f64 {
    match serde_json::from_str::<Value>(payload) {
        Ok(v) => v.get("value").and_then(|v| v.as_f64()).unwrap_or(f64::NAN),
        Err(_) => f64::NAN,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InverterField {
    AcPowerIn(Phase),
    DcVoltage,
    MaxChargeCurrent,
    State,
}

pub fn inverter_topics(config: &InverterConfig) -> Vec<(InverterField, String)> {
    let p = &config.read_prefix;
    vec![
        (InverterField::AcPowerIn(Phase::L1), format!("{p}/Ac/ActiveIn/L1/P")),
        (InverterField::AcPowerIn(Phase::L2), format!("{p}/Ac/ActiveIn/L2/P")),
        (InverterField::AcPowerIn(Phase::L3), format!("{p}/Ac/ActiveIn/L3/P")),
        (InverterField::AcPowerIn(Phase::MultiPhase), format!("{p}/Ac/ActiveIn/P")),
        (InverterField::DcVoltage, format!("{p}/Dc/0/Voltage")),
        (InverterField::MaxChargeCurrent, format!("{p}/Dc/0/MaxChargeCurrent")),
        (InverterField::State, format!("{p}/State")),
    ]
}

pub fn apply_inverter_value(data: &mut InverterData, field: InverterField, payload: &str) {
    let v = value_to_f64(payload);
    match field {
        InverterField::AcPowerIn(phase) => data.set_ac_power_in(phase, v),
        InverterField::DcVoltage => data.dc_voltage = v,
        InverterField::MaxChargeCurrent => data.max_charge_current = v,
        InverterField::State => {
            if v.is_finite() && v >= 0.0 {
                data.state = InverterState::from_code(v as u16);
            } else {
                warn!("Ignoring inverter state {payload}");
            }
        }
    }
}

/// Topic and payload for one control loop command.
pub fn command_publish(config: &InverterConfig, phase: Phase, command: &InverterCommand) -> PublishData {
    let p = &config.write_prefix;
    let (topic, value) = match command {
        InverterCommand::SetAcPowerSetpoint(v) => {
            let phase = if phase == Phase::MultiPhase { Phase::L1 } else { phase };
            (format!("{p}/Hub4/{}/AcPowerSetpoint", phase.to_string()), json!(v))
        }
        InverterCommand::SetChargeDisabled(b) => (format!("{p}/Hub4/DisableCharge"), json!(*b as u8)),
        InverterCommand::SetFeedbackDisabled(b) => (format!("{p}/Hub4/DisableFeedIn"), json!(*b as u8)),
    };
    PublishData {
        topic,
        payload: json!({ "value": value }).to_string(),
        qos: 0,
        retain: false,
    }
}

/// Mirrors the inverter/charger topics into [`InverterData`] and writes the
/// control loop commands back.
pub struct InverterBridge {
    sender: Sender<Transmission>,
    config: InverterConfig,
    phase: Phase,
    data_tx: watch::Sender<InverterData>,
    commands: mpsc::Receiver<InverterCommand>,
}

impl InverterBridge {
    pub fn new(sender: Sender<Transmission>, config: InverterConfig, phase: Phase,
               data_tx: watch::Sender<InverterData>, commands: mpsc::Receiver<InverterCommand>) -> Self {
        InverterBridge { sender, config, phase, data_tx, commands }
    }

    pub async fn start_thread(&mut self) {
        info!("Starting inverter bridge on {}", self.config.read_prefix);
        let (field_tx, mut field_rx) = mpsc::channel::<(InverterField, String)>(32);
        let topics = inverter_topics(&self.config);

        for (field, topic) in topics.iter().cloned() {
            let (sender, mut receiver) = mpsc::channel(10);
            let register = Transmission::Subscribe(SubscribeData { topic, sender });
            if self.sender.send(register).await.is_err() {
                return;
            }
            let field_tx = field_tx.clone();
            tokio::spawn(async move {
                while let Some(payload) = receiver.recv().await {
                    if field_tx.send((field, payload)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(field_tx);

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        let mut commands_open = true;
        loop {
            tokio::select! {
                update = field_rx.recv() => {
                    let Some((field, payload)) = update else {
                        info!("Inverter subscriptions closed");
                        return;
                    };
                    debug!("Inverter {field:?}: {payload}");
                    self.data_tx.send_modify(|data| apply_inverter_value(data, field, &payload));
                }
                command = self.commands.recv(), if commands_open => {
                    match command {
                        Some(command) => {
                            let p = command_publish(&self.config, self.phase, &command);
                            let _ = self.sender.send(Transmission::Publish(p)).await;
                        }
                        None => {
                            info!("Control loop stopped, no more inverter commands");
                            commands_open = false;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    for (_, topic) in topics.iter() {
                        let Some(path) = topic.strip_prefix("N/") else {
                            continue;
                        };
                        let p = Transmission::Publish(PublishData {
                            topic: format!("R/{path}"),
                            payload: String::new(),
                            qos: 0,
                            retain: false,
                        });
                        let _ = self.sender.send(p).await;
                    }
                }
            }
        }
    }
}

use serde::{Deserialize, Serialize};

/// Measurement channel of a meter. `MultiPhase` is the aggregate over all phases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    MultiPhase,
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::MultiPhase, Phase::L1, Phase::L2, Phase::L3];

    pub fn index(&self) -> usize {
        match self {
            Phase::MultiPhase => 0,
            Phase::L1 => 1,
            Phase::L2 => 2,
            Phase::L3 => 3,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MultiPhase" | "Total" => Some(Phase::MultiPhase),
            "L1" => Some(Phase::L1),
            "L2" => Some(Phase::L2),
            "L3" => Some(Phase::L3),
            _ => None,
        }
    }

    pub fn to_string(&self) -> String {
        match self {
            Phase::MultiPhase => "MultiPhase".to_string(),
            Phase::L1 => "L1".to_string(),
            Phase::L2 => "L2".to_string(),
            Phase::L3 => "L3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Searched,
    Detected,
    Connected,
}

/// Register family of a Carlo Gavazzi meter, derived from its device id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProtocolFamily {
    Unknown,
    /// EM24
    Em24,
    /// ET112, EM111, EM112
    Et112,
    /// EM330, EM340, ET340
    Em340,
}

impl ProtocolFamily {
    pub fn from_device_type(device_type: u16) -> Self {
        match device_type {
            71..=73 | 1648..=1653 => ProtocolFamily::Em24,
            100..=103 | 120..=121 => ProtocolFamily::Et112,
            330..=331 | 340..=341 | 345 => ProtocolFamily::Em340,
            _ => ProtocolFamily::Unknown,
        }
    }

    pub fn to_string(&self) -> String {
        match self {
            ProtocolFamily::Unknown => "Unknown".to_string(),
            ProtocolFamily::Em24 => "EM24".to_string(),
            ProtocolFamily::Et112 => "ET112".to_string(),
            ProtocolFamily::Em340 => "EM340".to_string(),
        }
    }
}

/// Human readable product name for a device id.
pub fn product_name(device_type: u16) -> String {
    match device_type {
        71..=73 => "EM24 DIN".to_string(),
        1648..=1653 => "EM24 Ethernet".to_string(),
        100..=103 => "EM111/EM112".to_string(),
        120..=121 => "ET112".to_string(),
        330..=331 => "EM330".to_string(),
        340..=341 => "EM340".to_string(),
        345 => "ET340".to_string(),
        _ => format!("Unknown meter ({device_type})"),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PhaseSequence {
    Ok,
    NotOk,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ErrorCode {
    #[default]
    NoError,
    FrontSelectorLocked,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::FrontSelectorLocked => 1,
        }
    }
}

/// Readings of one measurement channel. `NaN` means "no reading".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PowerInfo {
    pub current: f64,
    pub voltage: f64,
    pub power: f64,
    pub energy_forward: f64,
    pub energy_reverse: f64,
}

impl PowerInfo {
    pub fn new() -> Self {
        PowerInfo {
            current: f64::NAN,
            voltage: f64::NAN,
            power: f64::NAN,
            energy_forward: f64::NAN,
            energy_reverse: f64::NAN,
        }
    }

    pub fn reset(&mut self) {
        *self = PowerInfo::new();
    }
}

impl Default for PowerInfo {
    fn default() -> Self {
        PowerInfo::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeterIdentity {
    pub family: ProtocolFamily,
    pub device_type: u16,
    pub device_sub_type: u16,
    /// Empty until detection has read it, cleared again on disconnect
    pub serial: String,
    pub firmware_version: u16,
    pub slave_address: u8,
    pub port_name: String,
    /// Radio relayed transport, reconnects are slower
    pub is_zigbee: bool,
}

/// Everything known about one logical meter (primary or piggyback sink).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeterModel {
    pub identity: MeterIdentity,
    pub connection_state: ConnectionState,
    pub error_code: ErrorCode,
    pub phase_sequence: Option<PhaseSequence>,
    phases: [PowerInfo; 4],
}

impl MeterModel {
    pub fn new(port_name: String, slave_address: u8, is_zigbee: bool) -> Self {
        MeterModel {
            identity: MeterIdentity {
                family: ProtocolFamily::Unknown,
                device_type: 0,
                device_sub_type: 0,
                serial: String::new(),
                firmware_version: 0,
                slave_address,
                port_name,
                is_zigbee,
            },
            connection_state: ConnectionState::Disconnected,
            error_code: ErrorCode::NoError,
            phase_sequence: None,
            phases: [PowerInfo::new(); 4],
        }
    }

    pub fn set_device_type(&mut self, device_type: u16) {
        self.identity.device_type = device_type;
        self.identity.family = ProtocolFamily::from_device_type(device_type);
    }

    pub fn family(&self) -> ProtocolFamily {
        self.identity.family
    }

    pub fn slave_address(&self) -> u8 {
        self.identity.slave_address
    }

    pub fn serial(&self) -> &str {
        &self.identity.serial
    }

    pub fn product_name(&self) -> String {
        product_name(self.identity.device_type)
    }

    pub fn phase(&self, phase: Phase) -> &PowerInfo {
        &self.phases[phase.index()]
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PowerInfo {
        &mut self.phases[phase.index()]
    }

    pub fn reset_values(&mut self) {
        for p in self.phases.iter_mut() {
            p.reset();
        }
    }

    /// Drops everything learned while connected. Readings and serial are
    /// cleared in the same step as the state change.
    pub fn disconnect(&mut self) {
        self.identity.serial.clear();
        self.reset_values();
        self.connection_state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_device_type() {
        assert_eq!(ProtocolFamily::from_device_type(71), ProtocolFamily::Em24);
        assert_eq!(ProtocolFamily::from_device_type(1650), ProtocolFamily::Em24);
        assert_eq!(ProtocolFamily::from_device_type(120), ProtocolFamily::Et112);
        assert_eq!(ProtocolFamily::from_device_type(102), ProtocolFamily::Et112);
        assert_eq!(ProtocolFamily::from_device_type(345), ProtocolFamily::Em340);
        assert_eq!(ProtocolFamily::from_device_type(331), ProtocolFamily::Em340);
        assert_eq!(ProtocolFamily::from_device_type(999), ProtocolFamily::Unknown);
    }

    #[test]
    fn test_disconnect_clears_readings_and_serial() {
        let mut model = MeterModel::new("/dev/ttyUSB0".to_string(), 1, false);
        model.identity.serial = "BV1234".to_string();
        model.connection_state = ConnectionState::Connected;
        model.phase_mut(Phase::L2).power = 123.0;

        model.disconnect();

        assert_eq!(model.connection_state, ConnectionState::Disconnected);
        assert!(model.serial().is_empty());
        assert!(model.phase(Phase::L2).power.is_nan());
        assert_eq!(model.slave_address(), 1);
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!(Phase::from_str("L3"), Some(Phase::L3));
        assert_eq!(Phase::from_str("Total"), Some(Phase::MultiPhase));
        assert_eq!(Phase::from_str("L4"), None);
        assert_eq!(Phase::L2.to_string(), "L2");
    }
}

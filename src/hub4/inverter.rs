use serde::{Deserialize, Serialize};

use crate::models::Phase;

/// VE.Bus device state as reported by the inverter/charger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum InverterState {
    #[default]
    Off,
    LowPower,
    Fault,
    Bulk,
    Absorption,
    Float,
    Storage,
    Equalize,
    Passthru,
    Inverting,
    PowerAssist,
    PowerSupply,
    ExternalControl,
    Unknown(u16),
}

impl InverterState {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => InverterState::Off,
            1 => InverterState::LowPower,
            2 => InverterState::Fault,
            3 => InverterState::Bulk,
            4 => InverterState::Absorption,
            5 => InverterState::Float,
            6 => InverterState::Storage,
            7 => InverterState::Equalize,
            8 => InverterState::Passthru,
            9 => InverterState::Inverting,
            10 => InverterState::PowerAssist,
            11 => InverterState::PowerSupply,
            252 => InverterState::ExternalControl,
            other => InverterState::Unknown(other),
        }
    }
}

/// Last known values of the controlled inverter/charger. `NaN` means the
/// value has not been received yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverterData {
    ac_power_in: [f64; 4],
    pub dc_voltage: f64,
    pub max_charge_current: f64,
    pub state: InverterState,
}

impl InverterData {
    pub fn new() -> Self {
        InverterData {
            ac_power_in: [f64::NAN; 4],
            dc_voltage: f64::NAN,
            max_charge_current: f64::NAN,
            state: InverterState::Off,
        }
    }

    pub fn ac_power_in(&self, phase: Phase) -> f64 {
        self.ac_power_in[phase.index()]
    }

    pub fn set_ac_power_in(&mut self, phase: Phase, power: f64) {
        self.ac_power_in[phase.index()] = power;
    }

    /// Battery is full, the charger is floating or in storage mode.
    pub fn is_charged(&self) -> bool {
        matches!(self.state, InverterState::Float | InverterState::Storage)
    }
}

impl Default for InverterData {
    fn default() -> Self {
        InverterData::new()
    }
}

/// Values the control loop pushes to the inverter/charger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InverterCommand {
    SetChargeDisabled(bool),
    SetFeedbackDisabled(bool),
    SetAcPowerSetpoint(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(InverterState::from_code(5), InverterState::Float);
        assert_eq!(InverterState::from_code(252), InverterState::ExternalControl);
        assert_eq!(InverterState::from_code(42), InverterState::Unknown(42));
    }

    #[test]
    fn test_is_charged() {
        let mut data = InverterData::new();
        assert!(!data.is_charged());
        data.state = InverterState::from_code(6);
        assert!(data.is_charged());
        data.state = InverterState::Absorption;
        assert!(!data.is_charged());
    }
}

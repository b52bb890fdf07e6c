use log::warn;
use thiserror::Error;

use crate::models::{MeterModel, Phase, ProtocolFamily};
use super::registers::{CompositeCommand, ParameterType};

/// Raw value a meter reports for a quantity it does not measure.
const NOT_AVAILABLE: i32 = 0x7FFF_FFFF;

const POWER_FACTOR: f64 = 0.1;
const VOLTAGE_FACTOR: f64 = 0.1;
const CURRENT_FACTOR: f64 = 1e-3;
const ENERGY_FACTOR: f64 = 0.1;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Incorrect number of registers received: expected {expected}, got {received}")]
    RegisterCountMismatch { expected: u16, received: usize },
    #[error("Command has no register mapping")]
    NoMapping,
}

/// Composes a signed 32 bit value from a low/high register pair and scales it.
pub fn get_double(registers: &[u16], offset: usize, factor: f64) -> f64 {
    let lo = registers.get(offset).copied().unwrap_or(0) as u32;
    let hi = registers.get(offset + 1).copied().unwrap_or(0) as u32;
    let raw = (lo | (hi << 16)) as i32;
    if raw == NOT_AVAILABLE {
        return f64::NAN;
    }
    raw as f64 * factor
}

/// Two characters per register, high byte first. Some meters pad with
/// leading zero bytes, others at the end, so every NUL is dropped.
pub fn decode_serial(registers: &[u16]) -> String {
    registers
        .iter()
        .flat_map(|r| [(r >> 8) as u8, (r & 0xFF) as u8])
        .filter(|b| *b != 0)
        .map(|b| b as char)
        .collect()
}

/// Applies the registers answered for one schedule entry to the primary
/// meter and its piggybacked companion.
#[derive(Debug, Clone, Copy)]
pub struct AcquisitionDecoder {
    pub family: ProtocolFamily,
    pub is_multi_phase: bool,
    pub piggy_enabled: bool,
}

impl AcquisitionDecoder {
    pub fn new(family: ProtocolFamily, is_multi_phase: bool, piggy_enabled: bool) -> Self {
        AcquisitionDecoder { family, is_multi_phase, piggy_enabled }
    }

    fn sets_current_sign(&self) -> bool {
        self.family == ProtocolFamily::Em24
    }

    pub fn process(&self, cmd: &CompositeCommand, registers: &[u16],
                   primary: &mut MeterModel, piggy: &mut MeterModel) -> Result<(), DecodeError> {
        let expected = cmd.register_count();
        if registers.len() != expected as usize {
            warn!("Incorrect number of registers received for 0x{:04X}: {} != {}",
                  cmd.register, expected, registers.len());
            return Err(DecodeError::RegisterCountMismatch { expected, received: registers.len() });
        }
        if cmd.mappings().next().is_none() {
            return Err(DecodeError::NoMapping);
        }

        for mapping in cmd.mappings() {
            let mut phase = mapping.phase;
            let mut to_piggy = false;
            if self.piggy_enabled {
                to_piggy = phase == Phase::L2;
                phase = Phase::MultiPhase;
            }
            if !self.is_multi_phase && phase != Phase::MultiPhase {
                continue;
            }
            let set_l1 = phase == Phase::MultiPhase && !self.is_multi_phase;
            let offset = mapping.offset as usize;

            match mapping.action {
                ParameterType::Power => {
                    let v = get_double(registers, offset, POWER_FACTOR);
                    let dest = if to_piggy { &mut *piggy } else { &mut *primary };
                    dest.phase_mut(phase).power = v;
                    if set_l1 {
                        dest.phase_mut(Phase::L1).power = v;
                    }
                }
                ParameterType::Voltage => {
                    let v = get_double(registers, offset, VOLTAGE_FACTOR);
                    let dest = if to_piggy { &mut *piggy } else { &mut *primary };
                    dest.phase_mut(phase).voltage = v;
                    if set_l1 {
                        dest.phase_mut(Phase::L1).voltage = v;
                    }
                }
                ParameterType::Current => {
                    let mut v = get_double(registers, offset, CURRENT_FACTOR);
                    if self.sets_current_sign() && !to_piggy && primary.phase(phase).power < 0.0 {
                        v = -v;
                    }
                    let dest = if to_piggy { &mut *piggy } else { &mut *primary };
                    dest.phase_mut(phase).current = v;
                    if set_l1 {
                        dest.phase_mut(Phase::L1).current = v;
                    }
                    // L3 is never redirected, the total always lands on the primary
                    if self.is_multi_phase && phase == Phase::L3 {
                        let total = primary.phase(Phase::L1).current
                            + primary.phase(Phase::L2).current
                            + primary.phase(Phase::L3).current;
                        primary.phase_mut(Phase::MultiPhase).current = total;
                    }
                }
                ParameterType::PositiveEnergy => {
                    let v = get_double(registers, offset, ENERGY_FACTOR);
                    let dest = if to_piggy { &mut *piggy } else { &mut *primary };
                    dest.phase_mut(phase).energy_forward = v;
                    if set_l1 {
                        dest.phase_mut(Phase::L1).energy_forward = v;
                    }
                }
                ParameterType::NegativeEnergy => {
                    // The ET112 reports kWh(-) as a negative number, the others do not
                    let v = get_double(registers, offset, ENERGY_FACTOR).abs();
                    let dest = if to_piggy { &mut *piggy } else { &mut *primary };
                    if self.family == ProtocolFamily::Em24 && self.is_multi_phase {
                        dest.phase_mut(Phase::MultiPhase).energy_reverse = v;
                    } else {
                        dest.phase_mut(phase).energy_reverse = v;
                        if set_l1 {
                            dest.phase_mut(Phase::L1).energy_reverse = v;
                        }
                    }
                }
                ParameterType::Dummy | ParameterType::None => {}
            }
        }
        Ok(())
    }
}

//! Register map of the Carlo Gavazzi meter families and the acquisition
//! schedules used to poll them.

use crate::models::{Phase, ProtocolFamily};

pub const REG_DEVICE_ID: u16 = 0x000B;
pub const REG_FIRMWARE_VERSION: u16 = 0x0302;
pub const REG_EM24_VERSION_CODE: u16 = 0x0303;
pub const REG_EM24_FRONT_SELECTOR: u16 = 0x0304;
pub const REG_EM24_PHASE_SEQUENCE: u16 = 0x0032;
pub const REG_EM340_PHASE_SEQUENCE: u16 = 0x0036;
pub const REG_EM24_SERIAL: u16 = 0x1300;
/// Also used by the EM3xx range
pub const REG_EM112_SERIAL: u16 = 0x5000;
pub const SERIAL_REGISTER_COUNT: u16 = 7;
/// Application is followed by the measuring system, both are read together
pub const REG_EM24_APPLICATION: u16 = 0xA000;
pub const REG_EM24_MEASURING_SYSTEM: u16 = 0xA001;
pub const REG_EM112_MEASUREMENT_MODE: u16 = 0x1103;
pub const REG_EM340_MEASURING_SYSTEM: u16 = 0x1002;
pub const REG_SLAVE_ADDRESS: u16 = 0x2000;

pub const MEASURING_SYSTEM_P3: u16 = 0; // 3 phase (3Pn)
pub const MEASURING_SYSTEM_P2: u16 = 2; // 2 phase (2P)
pub const MEASURING_SYSTEM_P1: u16 = 3; // single phase (1P)

/// Feed in to the grid is reported as negative power (ET112, EM3xx).
pub const MEASUREMENT_MODE_B: u16 = 1;
/// Feed in to the grid is reported as negative power (EM24).
pub const APPLICATION_H: u16 = 7;
pub const FRONT_SELECTOR_LOCKED: u16 = 3;

/// Number of registers one mapping decodes (a signed 32 bit value).
const VALUE_REGISTER_COUNT: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    /// Terminates a mapping list
    None,
    /// Only there to change the size of the request
    Dummy,
    Power,
    Voltage,
    Current,
    PositiveEnergy,
    NegativeEnergy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterCommand {
    pub offset: u16,
    pub action: ParameterType,
    pub phase: Phase,
}

pub const MAX_REG_COUNT: usize = 5;

/// One read covering several quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeCommand {
    pub register: u16,
    /// Sub-cycle this command fires on, 0 fires on every sub-cycle
    pub interval: u16,
    pub actions: [RegisterCommand; MAX_REG_COUNT],
}

impl CompositeCommand {
    pub fn fires_on(&self, acquisition_index: u16) -> bool {
        self.interval == 0 || self.interval == acquisition_index
    }

    /// The populated mappings, up to the first `None` entry.
    pub fn mappings(&self) -> impl Iterator<Item = &RegisterCommand> {
        self.actions.iter().take_while(|a| a.action != ParameterType::None)
    }

    pub fn max_offset(&self) -> u16 {
        self.mappings().map(|a| a.offset).max().unwrap_or(0)
    }

    /// Registers requested for this command, dummy entries included.
    pub fn register_count(&self) -> u16 {
        self.max_offset() + VALUE_REGISTER_COUNT
    }
}

const fn m(offset: u16, action: ParameterType, phase: Phase) -> RegisterCommand {
    RegisterCommand { offset, action, phase }
}

const NONE: RegisterCommand = m(0, ParameterType::None, Phase::MultiPhase);

const fn cmd1(register: u16, interval: u16, a: RegisterCommand) -> CompositeCommand {
    CompositeCommand { register, interval, actions: [a, NONE, NONE, NONE, NONE] }
}

const fn cmd2(register: u16, interval: u16, a: RegisterCommand, b: RegisterCommand) -> CompositeCommand {
    CompositeCommand { register, interval, actions: [a, b, NONE, NONE, NONE] }
}

const fn cmd3(register: u16, interval: u16, a: RegisterCommand, b: RegisterCommand, c: RegisterCommand) -> CompositeCommand {
    CompositeCommand { register, interval, actions: [a, b, c, NONE, NONE] }
}

const fn cmd4(register: u16, interval: u16, a: RegisterCommand, b: RegisterCommand, c: RegisterCommand, d: RegisterCommand) -> CompositeCommand {
    CompositeCommand { register, interval, actions: [a, b, c, d, NONE] }
}

use ParameterType::{Current, Dummy, NegativeEnergy, PositiveEnergy, Power, Voltage};
use Phase::{L1, L2, L3, MultiPhase};

pub static EM24_COMMANDS: [CompositeCommand; 8] = [
    cmd1(0x0028, 0, m(0, Power, MultiPhase)),
    cmd3(0x0012, 0, m(0, Power, L1), m(2, Power, L2), m(4, Power, L3)),
    cmd1(0x0024, 2, m(0, Voltage, MultiPhase)),
    cmd3(0x0000, 4, m(0, Voltage, L1), m(2, Voltage, L2), m(4, Voltage, L3)),
    cmd3(0x000C, 8, m(0, Current, L1), m(2, Current, L2), m(4, Current, L3)),
    cmd1(0x003E, 10, m(0, PositiveEnergy, MultiPhase)),
    cmd3(0x0046, 12, m(0, PositiveEnergy, L1), m(2, PositiveEnergy, L2), m(4, PositiveEnergy, L3)),
    cmd1(0x005C, 14, m(0, NegativeEnergy, MultiPhase)),
];

pub static EM24_COMMANDS_P1: [CompositeCommand; 5] = [
    cmd1(0x0028, 0, m(0, Power, MultiPhase)),
    cmd2(0x0024, 2, m(0, Voltage, MultiPhase), m(1, Dummy, MultiPhase)),
    cmd2(0x000C, 8, m(0, Current, MultiPhase), m(1, Dummy, MultiPhase)),
    cmd2(0x003E, 10, m(0, PositiveEnergy, MultiPhase), m(1, Dummy, MultiPhase)),
    cmd2(0x005C, 14, m(0, NegativeEnergy, MultiPhase), m(1, Dummy, MultiPhase)),
];

/// L1 is the grid meter, L2 the piggybacked PV inverter.
pub static EM24_COMMANDS_P1_PV: [CompositeCommand; 6] = [
    cmd1(0x0012, 0, m(0, Power, L1)),
    cmd2(0x0014, 2, m(0, Power, L2), m(1, Dummy, MultiPhase)),
    cmd2(0x0000, 4, m(0, Voltage, L1), m(2, Voltage, L2)),
    cmd2(0x000C, 6, m(0, Current, L1), m(2, Current, L2)),
    cmd2(0x0046, 8, m(0, PositiveEnergy, L1), m(2, PositiveEnergy, L2)),
    // The meter only has a total for reverse energy. The PV inverter on L2
    // never feeds back, so all of it belongs to L1.
    cmd2(0x005C, 10, m(0, NegativeEnergy, L1), m(1, Dummy, MultiPhase)),
];

pub static EM112_COMMANDS: [CompositeCommand; 4] = [
    cmd1(0x0004, 0, m(0, Power, MultiPhase)),
    cmd2(0x0000, 4, m(0, Voltage, MultiPhase), m(2, Current, MultiPhase)),
    cmd2(0x0010, 8, m(0, PositiveEnergy, MultiPhase), m(1, Dummy, MultiPhase)),
    cmd2(0x0020, 12, m(0, NegativeEnergy, MultiPhase), m(1, Dummy, MultiPhase)),
];

pub static EM340_COMMANDS: [CompositeCommand; 9] = [
    cmd1(0x0028, 0, m(0, Power, MultiPhase)),
    cmd3(0x0012, 0, m(0, Power, L1), m(2, Power, L2), m(4, Power, L3)),
    cmd2(0x0024, 1, m(0, Voltage, MultiPhase), m(2, Dummy, MultiPhase)),
    cmd4(0x0000, 2, m(0, Voltage, L1), m(2, Voltage, L2), m(4, Voltage, L3), m(6, Dummy, MultiPhase)),
    cmd4(0x000C, 4, m(0, Current, L1), m(2, Current, L2), m(4, Current, L3), m(6, Dummy, MultiPhase)),
    cmd2(0x0034, 6, m(0, PositiveEnergy, MultiPhase), m(2, Dummy, MultiPhase)),
    cmd4(0x0040, 8, m(0, PositiveEnergy, L1), m(2, PositiveEnergy, L2), m(4, PositiveEnergy, L3), m(6, Dummy, MultiPhase)),
    cmd2(0x004E, 10, m(0, NegativeEnergy, MultiPhase), m(2, Dummy, MultiPhase)),
    cmd4(0x0060, 12, m(0, NegativeEnergy, L1), m(2, NegativeEnergy, L2), m(4, NegativeEnergy, L3), m(6, Dummy, MultiPhase)),
];

pub static EM340_COMMANDS_P1: [CompositeCommand; 5] = [
    cmd1(0x0012, 0, m(0, Power, MultiPhase)),
    cmd2(0x0000, 1, m(0, Voltage, MultiPhase), m(1, Dummy, MultiPhase)),
    cmd2(0x000C, 3, m(0, Current, MultiPhase), m(1, Dummy, MultiPhase)),
    cmd2(0x0040, 5, m(0, PositiveEnergy, MultiPhase), m(1, Dummy, MultiPhase)),
    cmd2(0x0060, 7, m(0, NegativeEnergy, MultiPhase), m(1, Dummy, MultiPhase)),
];

pub static EM340_COMMANDS_P1_PV: [CompositeCommand; 6] = [
    cmd1(0x0012, 0, m(0, Power, L1)),
    cmd2(0x0014, 2, m(0, Power, L2), m(1, Dummy, MultiPhase)),
    cmd2(0x0000, 4, m(0, Voltage, L1), m(2, Voltage, L2)),
    cmd2(0x000C, 6, m(0, Current, L1), m(2, Current, L2)),
    cmd2(0x0040, 8, m(0, PositiveEnergy, L1), m(2, PositiveEnergy, L2)),
    cmd2(0x0060, 10, m(0, NegativeEnergy, L1), m(2, NegativeEnergy, L2)),
];

/// Acquisition schedule for a meter family and wiring.
pub fn command_table(family: ProtocolFamily, is_multi_phase: bool, piggy_enabled: bool) -> &'static [CompositeCommand] {
    match family {
        ProtocolFamily::Em24 if is_multi_phase => &EM24_COMMANDS,
        ProtocolFamily::Em24 if piggy_enabled => &EM24_COMMANDS_P1_PV,
        ProtocolFamily::Em24 => &EM24_COMMANDS_P1,
        ProtocolFamily::Et112 => &EM112_COMMANDS,
        ProtocolFamily::Em340 if is_multi_phase => &EM340_COMMANDS,
        ProtocolFamily::Em340 if piggy_enabled => &EM340_COMMANDS_P1_PV,
        ProtocolFamily::Em340 => &EM340_COMMANDS_P1,
        ProtocolFamily::Unknown => &[],
    }
}

pub fn serial_register(family: ProtocolFamily) -> u16 {
    match family {
        ProtocolFamily::Em24 => REG_EM24_SERIAL,
        _ => REG_EM112_SERIAL,
    }
}

pub fn phase_sequence_register(family: ProtocolFamily) -> Option<u16> {
    match family {
        ProtocolFamily::Em24 => Some(REG_EM24_PHASE_SEQUENCE),
        ProtocolFamily::Em340 => Some(REG_EM340_PHASE_SEQUENCE),
        _ => None,
    }
}

pub fn measuring_system_register(family: ProtocolFamily) -> u16 {
    match family {
        ProtocolFamily::Em24 => REG_EM24_MEASURING_SYSTEM,
        _ => REG_EM340_MEASURING_SYSTEM,
    }
}

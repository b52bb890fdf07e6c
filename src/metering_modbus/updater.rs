use std::time::Duration;

use tokio::time::Instant;

use log::{debug, error, info, warn};

use crate::config::MeterSettings;
use crate::models::{ConnectionState, ErrorCode, MeterModel, PhaseSequence, ProtocolFamily};
use super::bus::{BusEvent, ModbusErrorKind, ModbusFunction};
use super::decoder::{decode_serial, AcquisitionDecoder};
use super::registers::*;

const MAX_TIMEOUT_COUNT: u32 = 5;
const MAX_ERROR_COUNT: u32 = 20;
const MAX_ACQUISITION_INDEX: u16 = 16;

const ACQUISITION_PERIOD: Duration = Duration::from_millis(250);
const MIN_PACING_WAIT: Duration = Duration::from_millis(50);
const FRONT_SELECTOR_WAIT: Duration = Duration::from_secs(5);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(15);
const ZIGBEE_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    DeviceId,
    VersionCode,
    Serial,
    FirmwareVersion,
    PhaseSequence,
    WaitForStart,
    CheckSetup,
    CheckFrontSelector,
    WaitFrontSelector,
    SetApplication,
    SetMeasuringSystem,
    CheckMeasurementMode,
    CheckMeasurementSystem,
    SetMeasurementMode,
    Acquisition,
    Wait,
    WaitOnConnectionLost,
    SetAddress,
}

impl State {
    /// States in which the only thing outstanding is the timer.
    fn is_waiting(&self) -> bool {
        matches!(self, State::Wait | State::WaitFrontSelector | State::WaitOnConnectionLost | State::WaitForStart)
    }
}

/// Work the driver has to carry out on behalf of the updater.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Read { start: u16, count: u16 },
    Write { register: u16, value: u16 },
    /// (Re)arm the single timer; expiry is reported with `on_wait_finished`
    StartTimer(Duration),
    /// The meter has been identified and waits for `start_measurements`
    Detected,
    ModelChanged,
}

/// Detection, setup and acquisition of one slave on the bus. The updater
/// performs no I/O, everything it wants done is queued as an [`Action`].
pub struct MeterUpdater {
    state: State,
    primary: MeterModel,
    piggy: MeterModel,
    settings: Option<MeterSettings>,
    timeout_count: u32,
    error_count: u32,
    application: u16,
    measuring_system: u16,
    desired_measuring_system: u16,
    setup_requested: bool,
    requested_address: Option<u8>,
    commands: &'static [CompositeCommand],
    command_index: usize,
    acquisition_index: u16,
    pending_command: Option<CompositeCommand>,
    pending_write: Option<(u16, u16)>,
    stopwatch: Instant,
    actions: Vec<Action>,
}

impl MeterUpdater {
    pub fn new(port_name: &str, slave_address: u8, is_zigbee: bool) -> Self {
        let mut updater = MeterUpdater {
            state: State::DeviceId,
            primary: MeterModel::new(port_name.to_string(), slave_address, is_zigbee),
            piggy: MeterModel::new(port_name.to_string(), slave_address, is_zigbee),
            settings: None,
            timeout_count: 0,
            error_count: 0,
            application: 0,
            measuring_system: 0,
            desired_measuring_system: 0,
            setup_requested: false,
            requested_address: None,
            commands: &[],
            command_index: 0,
            acquisition_index: 0,
            pending_command: None,
            pending_write: None,
            stopwatch: Instant::now(),
            actions: Vec::new(),
        };
        updater.start_next_action();
        updater
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn primary(&self) -> &MeterModel {
        &self.primary
    }

    pub fn piggy(&self) -> &MeterModel {
        &self.piggy
    }

    pub fn settings(&self) -> Option<&MeterSettings> {
        self.settings.as_ref()
    }

    pub fn slave_address(&self) -> u8 {
        self.primary.slave_address()
    }

    pub fn acquisition_index(&self) -> u16 {
        self.acquisition_index
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn handle_event(&mut self, event: &BusEvent) {
        match event {
            BusEvent::ReadCompleted { function, slave, values } => self.on_read_completed(*function, *slave, values),
            BusEvent::WriteCompleted { function, slave, register, value } => {
                self.on_write_completed(*function, *slave, *register, *value)
            }
            BusEvent::Error { kind, slave, exception } => self.on_error(*kind, *slave, *exception),
        }
    }

    pub fn start_measurements(&mut self, settings: MeterSettings) {
        if self.state != State::WaitForStart {
            error!("Cannot start measurements before device has been detected");
            return;
        }
        self.state = match self.primary.family() {
            ProtocolFamily::Em24 => State::CheckSetup,
            ProtocolFamily::Et112 | ProtocolFamily::Em340 => State::CheckMeasurementMode,
            ProtocolFamily::Unknown => {
                error!("Cannot start measurements on an unknown device");
                return;
            }
        };
        self.settings = Some(settings);
        self.acquisition_index = 0;
        self.command_index = 0;
        self.stopwatch = Instant::now();
        self.start_next_action();
    }

    /// New settings for the detected meter. Topology changes restart the
    /// setup check at the next dispatch.
    pub fn settings_changed(&mut self, settings: MeterSettings) {
        let Some(current) = self.settings.as_ref() else {
            debug!("Ignoring settings for {} before measurements started", settings.serial);
            return;
        };
        if current.needs_setup(&settings) {
            info!("Setup of {} changed, checking meter configuration", settings.serial);
            self.setup_requested = true;
        }
        self.settings = Some(settings);
    }

    /// Moves the meter to another slave address once the current request
    /// has been answered.
    pub fn request_slave_address(&mut self, address: u8) {
        if address == 0 || address > 247 {
            warn!("Refusing invalid slave address {address}");
            return;
        }
        self.requested_address = Some(address);
    }

    pub fn on_error(&mut self, kind: ModbusErrorKind, slave: u8, exception: u8) {
        if slave != self.slave_address() {
            return;
        }
        debug!("ModBus Error: {:?} {} State: {:?} Slave Address {} Acq State: {} Timeout count: {} Error count: {}",
               kind, exception, self.state, slave, self.acquisition_index, self.timeout_count, self.error_count);
        if self.state.is_waiting() {
            return;
        }
        // All error kinds other than a timeout share one counter
        if kind == ModbusErrorKind::Timeout {
            self.timeout_count += 1;
        } else {
            self.error_count += 1;
        }
        if self.timeout_count >= MAX_TIMEOUT_COUNT || self.error_count >= MAX_ERROR_COUNT {
            if !self.primary.serial().is_empty() {
                error!("Lost connection to energy meter {}@{}:{}", self.primary.serial(),
                       self.primary.identity.port_name, slave);
            }
            self.disconnect_sensor();
        }
        self.start_next_action();
    }

    pub fn on_read_completed(&mut self, _function: ModbusFunction, slave: u8, registers: &[u16]) {
        if slave != self.slave_address() {
            return;
        }
        let Some(&first) = registers.first() else {
            warn!("Empty read response in state {:?}", self.state);
            self.on_error(ModbusErrorKind::Exception, slave, 0);
            return;
        };
        match self.state {
            State::DeviceId => {
                info!("Device ID: {first}");
                self.primary.set_device_type(first);
                self.piggy.set_device_type(first);
                match self.primary.family() {
                    ProtocolFamily::Em24 => self.state = State::VersionCode,
                    ProtocolFamily::Et112 | ProtocolFamily::Em340 => self.state = State::Serial,
                    ProtocolFamily::Unknown => {
                        warn!("Unknown device ID {first}, disconnecting");
                        self.disconnect_sensor();
                    }
                }
            }
            State::VersionCode => {
                self.primary.identity.device_sub_type = first;
                self.piggy.identity.device_sub_type = first;
                self.state = State::Serial;
            }
            State::Serial => {
                let serial = decode_serial(registers);
                // Some meters report only the first character of the serial,
                // handled as if the meter did not answer
                if serial.len() < 2 {
                    warn!("Incorrect serial reported: {serial:?}");
                    self.on_error(ModbusErrorKind::Timeout, slave, 0);
                    return;
                }
                self.primary.identity.serial = serial.clone();
                self.piggy.identity.serial = serial;
                self.state = State::FirmwareVersion;
            }
            State::FirmwareVersion => {
                self.primary.identity.firmware_version = first;
                self.piggy.identity.firmware_version = first;
                self.state = match phase_sequence_register(self.primary.family()) {
                    Some(_) => State::PhaseSequence,
                    None => State::WaitForStart,
                };
            }
            State::PhaseSequence => {
                self.primary.phase_sequence = Some(if first == 0 { PhaseSequence::Ok } else { PhaseSequence::NotOk });
                self.state = State::WaitForStart;
            }
            State::CheckSetup => {
                let Some(&measuring_system) = registers.get(1) else {
                    warn!("Application and measuring system expected, got {} registers", registers.len());
                    self.on_error(ModbusErrorKind::Exception, slave, 0);
                    return;
                };
                let (multi, piggy) = self.topology();
                self.application = first;
                self.measuring_system = measuring_system;
                self.desired_measuring_system = if multi || piggy { MEASURING_SYSTEM_P3 } else { MEASURING_SYSTEM_P1 };
                if self.application == APPLICATION_H && self.measuring_system == self.desired_measuring_system {
                    self.set_error_code(ErrorCode::NoError);
                    self.state = State::Acquisition;
                } else {
                    self.state = State::CheckFrontSelector;
                }
            }
            State::CheckFrontSelector => {
                if first == FRONT_SELECTOR_LOCKED {
                    error!("Energy meter {} front selector locked, cannot change application", self.primary.serial());
                    self.set_error_code(ErrorCode::FrontSelectorLocked);
                    self.state = State::WaitFrontSelector;
                } else {
                    self.state = if self.application != APPLICATION_H {
                        State::SetApplication
                    } else if self.measuring_system != self.desired_measuring_system {
                        State::SetMeasuringSystem
                    } else {
                        State::Acquisition
                    };
                    self.set_error_code(ErrorCode::NoError);
                }
            }
            State::CheckMeasurementMode => {
                self.state = if first == MEASUREMENT_MODE_B {
                    self.after_measurement_mode()
                } else {
                    State::SetMeasurementMode
                };
            }
            State::CheckMeasurementSystem => {
                // EM3xx meters have no single phase system. Changing it resets
                // the energy counters, so only write on a real difference.
                let (multi, piggy) = self.topology();
                self.desired_measuring_system = if multi || !piggy { MEASURING_SYSTEM_P3 } else { MEASURING_SYSTEM_P2 };
                self.state = if first == self.desired_measuring_system {
                    State::Acquisition
                } else {
                    self.measuring_system = first;
                    State::SetMeasuringSystem
                };
            }
            State::Acquisition => {
                self.process_acquisition_data(registers);
                self.command_index += 1;
            }
            state if state.is_waiting() => {
                warn!("Ignoring read response while in state {state:?}");
                return;
            }
            state => {
                error!("Unexpected read response in state {state:?}");
                self.state = if self.settings.is_none() { State::DeviceId } else { State::Acquisition };
            }
        }
        self.timeout_count = 0;
        self.error_count = 0;
        self.actions.push(Action::ModelChanged);
        self.start_next_action();
    }

    pub fn on_write_completed(&mut self, function: ModbusFunction, slave: u8, register: u16, value: u16) {
        if slave != self.slave_address() {
            return;
        }
        let pending = self.pending_write.take();
        if let Some((expected_register, expected_value)) = pending {
            if function != ModbusFunction::WriteSingleRegister || register != expected_register || value != expected_value {
                warn!("Write confirmation {function:?} 0x{register:04X}={value} does not match request 0x{expected_register:04X}={expected_value}");
            }
        }
        match self.state {
            State::SetApplication => {
                self.state = if self.measuring_system == self.desired_measuring_system {
                    State::Acquisition
                } else {
                    State::SetMeasuringSystem
                };
            }
            State::SetMeasuringSystem => self.state = State::Acquisition,
            State::SetMeasurementMode => self.state = self.after_measurement_mode(),
            State::SetAddress => match pending {
                Some((REG_SLAVE_ADDRESS, address)) => {
                    warn!("Slave address changed from {} to {address}", self.primary.identity.slave_address);
                    self.primary.identity.slave_address = address as u8;
                    self.piggy.identity.slave_address = address as u8;
                    self.state = State::Serial;
                }
                _ => {
                    error!("Slave address confirmed without a pending address write");
                    self.state = self.recovery_state();
                }
            },
            state if state.is_waiting() => {
                warn!("Ignoring write confirmation while in state {state:?}");
                return;
            }
            state => {
                error!("Unexpected write confirmation in state {state:?}");
                self.state = self.recovery_state();
            }
        }
        self.timeout_count = 0;
        self.error_count = 0;
        self.start_next_action();
    }

    pub fn on_wait_finished(&mut self) {
        match self.state {
            State::Wait => {
                self.stopwatch = Instant::now();
                self.state = State::Acquisition;
            }
            State::WaitFrontSelector => self.state = State::CheckSetup,
            State::WaitOnConnectionLost => self.state = State::DeviceId,
            state => {
                error!("Timer expired in state {state:?}, ignoring");
                return;
            }
        }
        self.start_next_action();
    }

    fn topology(&self) -> (bool, bool) {
        self.settings.as_ref().map(|s| (s.is_multi_phase, s.piggy_enabled)).unwrap_or((false, false))
    }

    fn after_measurement_mode(&self) -> State {
        if self.primary.family() == ProtocolFamily::Em340 {
            State::CheckMeasurementSystem
        } else {
            State::Acquisition
        }
    }

    fn recovery_state(&self) -> State {
        if self.settings.is_none() {
            State::DeviceId
        } else if self.primary.family() == ProtocolFamily::Em24 {
            State::CheckSetup
        } else {
            State::Acquisition
        }
    }

    fn set_error_code(&mut self, code: ErrorCode) {
        self.primary.error_code = code;
        self.piggy.error_code = code;
    }

    fn read_registers(&mut self, start: u16, count: u16) {
        self.actions.push(Action::Read { start, count });
    }

    fn write_register(&mut self, register: u16, value: u16) {
        self.pending_write = Some((register, value));
        self.actions.push(Action::Write { register, value });
    }

    fn start_next_action(&mut self) {
        // The address change waits until the meter answers again
        if self.state != State::WaitOnConnectionLost {
            if let Some(address) = self.requested_address.take() {
                self.state = State::SetAddress;
                self.write_register(REG_SLAVE_ADDRESS, address as u16);
                info!("Set modbus address to {address}");
                return;
            }
        }
        if self.setup_requested {
            self.setup_requested = false;
            self.primary.reset_values();
            self.piggy.reset_values();
            self.actions.push(Action::ModelChanged);
            self.state = match self.primary.family() {
                ProtocolFamily::Em24 => State::CheckSetup,
                _ => State::CheckMeasurementMode,
            };
        }

        let family = self.primary.family();
        match self.state {
            State::DeviceId => {
                self.primary.connection_state = ConnectionState::Searched;
                self.read_registers(REG_DEVICE_ID, 1);
            }
            State::VersionCode => self.read_registers(REG_EM24_VERSION_CODE, 1),
            State::Serial => self.read_registers(serial_register(family), SERIAL_REGISTER_COUNT),
            State::FirmwareVersion => self.read_registers(REG_FIRMWARE_VERSION, 1),
            State::PhaseSequence => {
                let register = phase_sequence_register(family).unwrap_or(REG_EM24_PHASE_SEQUENCE);
                self.read_registers(register, 1);
            }
            State::CheckSetup => self.read_registers(REG_EM24_APPLICATION, 2),
            State::CheckFrontSelector => self.read_registers(REG_EM24_FRONT_SELECTOR, 1),
            State::WaitFrontSelector => self.actions.push(Action::StartTimer(FRONT_SELECTOR_WAIT)),
            State::SetApplication => {
                info!("Change application to application H");
                self.write_register(REG_EM24_APPLICATION, APPLICATION_H);
            }
            State::SetMeasuringSystem => {
                info!("Change measuring system to: {}", self.desired_measuring_system);
                self.write_register(measuring_system_register(family), self.desired_measuring_system);
            }
            State::CheckMeasurementMode => self.read_registers(REG_EM112_MEASUREMENT_MODE, 1),
            State::CheckMeasurementSystem => self.read_registers(measuring_system_register(family), 1),
            State::SetMeasurementMode => {
                // Makes EM1xx/EM3xx meters report power sent to the grid as negative
                info!("Set EM1xx/EM3xx measurement mode to B");
                self.write_register(REG_EM112_MEASUREMENT_MODE, MEASUREMENT_MODE_B);
            }
            State::WaitForStart => {
                self.primary.connection_state = ConnectionState::Detected;
                self.actions.push(Action::Detected);
            }
            State::Acquisition => {
                let (multi, piggy) = self.topology();
                self.commands = command_table(family, multi, piggy);
                self.start_next_acquisition();
            }
            State::Wait => {
                let elapsed = self.stopwatch.elapsed();
                match ACQUISITION_PERIOD.checked_sub(elapsed) {
                    Some(sleep) if sleep > MIN_PACING_WAIT => self.actions.push(Action::StartTimer(sleep)),
                    _ => self.on_wait_finished(),
                }
            }
            State::WaitOnConnectionLost => {
                let interval = if self.primary.identity.is_zigbee { ZIGBEE_RECONNECT_INTERVAL } else { RECONNECT_INTERVAL };
                self.actions.push(Action::StartTimer(interval));
            }
            State::SetAddress => {
                error!("Slave address write without a requested address");
                self.state = self.recovery_state();
                self.start_next_action();
            }
        }
    }

    fn start_next_acquisition(&mut self) {
        loop {
            if let Some(cmd) = self.commands.get(self.command_index) {
                if cmd.fires_on(self.acquisition_index) {
                    let cmd = *cmd;
                    self.pending_command = Some(cmd);
                    self.read_registers(cmd.register, cmd.register_count());
                    return;
                }
            }
            self.command_index += 1;
            if self.command_index >= self.commands.len() {
                self.state = State::Wait;
                self.command_index = 0;
                self.acquisition_index += 1;
                if self.acquisition_index == MAX_ACQUISITION_INDEX {
                    self.acquisition_index = 0;
                    if self.primary.connection_state != ConnectionState::Connected {
                        info!("Energy meter {} connected", self.primary.serial());
                    }
                    self.primary.connection_state = ConnectionState::Connected;
                    self.piggy.connection_state = ConnectionState::Connected;
                    self.actions.push(Action::ModelChanged);
                }
                self.start_next_action();
                return;
            }
        }
    }

    fn process_acquisition_data(&mut self, registers: &[u16]) {
        let Some(cmd) = self.pending_command.take() else {
            error!("Acquisition data without a pending command");
            return;
        };
        let (multi, piggy) = self.topology();
        let decoder = AcquisitionDecoder::new(self.primary.family(), multi, piggy);
        if let Err(e) = decoder.process(&cmd, registers, &mut self.primary, &mut self.piggy) {
            warn!("Dropped acquisition data of command {}: {e}", self.command_index);
        }
    }

    fn disconnect_sensor(&mut self) {
        self.state = State::WaitOnConnectionLost;
        self.settings = None;
        self.setup_requested = false;
        self.requested_address = None;
        self.pending_command = None;
        self.pending_write = None;
        self.timeout_count = 0;
        self.error_count = 0;
        self.primary.disconnect();
        self.piggy.disconnect();
        self.actions.push(Action::ModelChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIAL_REGS: [u16; 7] = [0x4131, 0x3233, 0x3435, 0x3600, 0, 0, 0];

    fn read(u: &mut MeterUpdater, values: &[u16]) -> Vec<Action> {
        u.on_read_completed(ModbusFunction::ReadHoldingRegisters, 1, values);
        u.take_actions()
    }

    fn write_done(u: &mut MeterUpdater, register: u16, value: u16) -> Vec<Action> {
        u.on_write_completed(ModbusFunction::WriteSingleRegister, 1, register, value);
        u.take_actions()
    }

    fn timeout(u: &mut MeterUpdater) -> Vec<Action> {
        u.on_error(ModbusErrorKind::Timeout, 1, 0);
        u.take_actions()
    }

    fn first_io(actions: &[Action]) -> Option<Action> {
        actions.iter().find(|a| matches!(a, Action::Read { .. } | Action::Write { .. } | Action::StartTimer(_))).cloned()
    }

    fn settings(device_type: u16, multi: bool, piggy: bool) -> MeterSettings {
        let mut s = MeterSettings::new(device_type, "A123456".to_string());
        s.is_multi_phase = multi;
        s.piggy_enabled = piggy;
        s
    }

    fn detect_em24(u: &mut MeterUpdater) {
        assert_eq!(first_io(&u.take_actions()), Some(Action::Read { start: REG_DEVICE_ID, count: 1 }));
        assert_eq!(first_io(&read(u, &[71])), Some(Action::Read { start: REG_EM24_VERSION_CODE, count: 1 }));
        assert_eq!(first_io(&read(u, &[5])), Some(Action::Read { start: REG_EM24_SERIAL, count: 7 }));
        assert_eq!(first_io(&read(u, &SERIAL_REGS)), Some(Action::Read { start: REG_FIRMWARE_VERSION, count: 1 }));
        assert_eq!(first_io(&read(u, &[0x0103])), Some(Action::Read { start: REG_EM24_PHASE_SEQUENCE, count: 1 }));
        let actions = read(u, &[0]);
        assert!(actions.contains(&Action::Detected));
    }

    /// Answers reads until the sub-cycle index moves on, then fires the pacing timer.
    fn run_sub_cycle(u: &mut MeterUpdater, mut actions: Vec<Action>) -> Vec<Action> {
        let start = u.acquisition_index();
        loop {
            match first_io(&actions) {
                Some(Action::Read { count, .. }) => {
                    actions = read(u, &vec![0; count as usize]);
                    if u.acquisition_index() != start {
                        if let Some(Action::StartTimer(_)) = first_io(&actions) {
                            u.on_wait_finished();
                            actions = u.take_actions();
                        }
                        return actions;
                    }
                }
                other => panic!("unexpected action {other:?}"),
            }
        }
    }

    #[test]
    fn test_em24_detection() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        assert_eq!(u.primary().connection_state, ConnectionState::Searched);
        detect_em24(&mut u);
        assert_eq!(u.state(), State::WaitForStart);
        assert_eq!(u.primary().connection_state, ConnectionState::Detected);
        assert_eq!(u.primary().serial(), "A123456");
        assert_eq!(u.piggy().serial(), "A123456");
        assert_eq!(u.primary().identity.device_sub_type, 5);
        assert_eq!(u.primary().identity.firmware_version, 0x0103);
        assert_eq!(u.primary().phase_sequence, Some(PhaseSequence::Ok));
    }

    #[test]
    fn test_et112_skips_version_and_phase_sequence() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        assert_eq!(first_io(&read(&mut u, &[120])), Some(Action::Read { start: REG_EM112_SERIAL, count: 7 }));
        read(&mut u, &SERIAL_REGS);
        let actions = read(&mut u, &[1]);
        assert!(actions.contains(&Action::Detected));
        assert_eq!(u.primary().phase_sequence, None);
    }

    #[test]
    fn test_short_serial_counts_as_timeout() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        read(&mut u, &[120]);
        let serial = [0x4100, 0, 0, 0, 0, 0, 0];
        for _ in 0..4 {
            assert_eq!(first_io(&read(&mut u, &serial)), Some(Action::Read { start: REG_EM112_SERIAL, count: 7 }));
        }
        let actions = read(&mut u, &serial);
        assert_eq!(u.state(), State::WaitOnConnectionLost);
        assert_eq!(first_io(&actions), Some(Action::StartTimer(RECONNECT_INTERVAL)));
    }

    #[test]
    fn test_unknown_device_disconnects() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, true);
        u.take_actions();
        let actions = read(&mut u, &[999]);
        assert_eq!(u.state(), State::WaitOnConnectionLost);
        assert_eq!(u.primary().connection_state, ConnectionState::Disconnected);
        assert_eq!(first_io(&actions), Some(Action::StartTimer(ZIGBEE_RECONNECT_INTERVAL)));
        u.on_wait_finished();
        assert_eq!(first_io(&u.take_actions()), Some(Action::Read { start: REG_DEVICE_ID, count: 1 }));
    }

    #[test]
    fn test_fifth_timeout_disconnects() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        for _ in 0..4 {
            assert_eq!(first_io(&timeout(&mut u)), Some(Action::Read { start: REG_DEVICE_ID, count: 1 }));
        }
        assert_eq!(first_io(&timeout(&mut u)), Some(Action::StartTimer(RECONNECT_INTERVAL)));
        assert_eq!(u.state(), State::WaitOnConnectionLost);
        // counters start over after the reconnect
        u.on_wait_finished();
        u.take_actions();
        for _ in 0..4 {
            timeout(&mut u);
        }
        assert_eq!(u.state(), State::DeviceId);
    }

    #[test]
    fn test_twentieth_error_disconnects() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        for _ in 0..19 {
            u.on_error(ModbusErrorKind::CrcError, 1, 0);
        }
        assert_eq!(u.state(), State::DeviceId);
        u.on_error(ModbusErrorKind::Exception, 1, 2);
        assert_eq!(u.state(), State::WaitOnConnectionLost);
    }

    #[test]
    fn test_success_resets_counters() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        for _ in 0..4 {
            timeout(&mut u);
        }
        read(&mut u, &[120]);
        for _ in 0..4 {
            timeout(&mut u);
        }
        assert_eq!(u.state(), State::Serial);
    }

    #[test]
    fn test_other_slaves_are_ignored() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        u.on_read_completed(ModbusFunction::ReadHoldingRegisters, 2, &[71]);
        u.on_error(ModbusErrorKind::Timeout, 2, 0);
        assert!(u.take_actions().is_empty());
        assert_eq!(u.state(), State::DeviceId);
    }

    #[test]
    fn test_connected_after_full_cycle() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        read(&mut u, &[120]);
        read(&mut u, &SERIAL_REGS);
        read(&mut u, &[1]);
        u.start_measurements(settings(120, false, false));
        let actions = u.take_actions();
        assert_eq!(first_io(&actions), Some(Action::Read { start: REG_EM112_MEASUREMENT_MODE, count: 1 }));
        let mut actions = read(&mut u, &[MEASUREMENT_MODE_B]);
        assert_eq!(first_io(&actions), Some(Action::Read { start: 0x0004, count: 2 }));

        for cycle in 0..16 {
            assert_ne!(u.primary().connection_state, ConnectionState::Connected, "connected early in {cycle}");
            actions = run_sub_cycle(&mut u, actions);
        }
        assert_eq!(u.primary().connection_state, ConnectionState::Connected);
        assert_eq!(u.piggy().connection_state, ConnectionState::Connected);
        assert_eq!(u.acquisition_index(), 0);
    }

    #[test]
    fn test_em24_front_selector_locked() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        detect_em24(&mut u);
        u.start_measurements(settings(71, true, false));
        assert_eq!(first_io(&u.take_actions()), Some(Action::Read { start: REG_EM24_APPLICATION, count: 2 }));
        assert_eq!(first_io(&read(&mut u, &[0, MEASURING_SYSTEM_P1])),
                   Some(Action::Read { start: REG_EM24_FRONT_SELECTOR, count: 1 }));
        assert_eq!(first_io(&read(&mut u, &[FRONT_SELECTOR_LOCKED])), Some(Action::StartTimer(FRONT_SELECTOR_WAIT)));
        assert_eq!(u.primary().error_code, ErrorCode::FrontSelectorLocked);
        assert_eq!(u.piggy().error_code, ErrorCode::FrontSelectorLocked);

        u.on_wait_finished();
        assert_eq!(first_io(&u.take_actions()), Some(Action::Read { start: REG_EM24_APPLICATION, count: 2 }));
        read(&mut u, &[0, MEASURING_SYSTEM_P1]);
        assert_eq!(first_io(&read(&mut u, &[0])), Some(Action::Write { register: REG_EM24_APPLICATION, value: APPLICATION_H }));
        assert_eq!(u.primary().error_code, ErrorCode::NoError);
        assert_eq!(first_io(&write_done(&mut u, REG_EM24_APPLICATION, APPLICATION_H)),
                   Some(Action::Write { register: REG_EM24_MEASURING_SYSTEM, value: MEASURING_SYSTEM_P3 }));
        assert_eq!(first_io(&write_done(&mut u, REG_EM24_MEASURING_SYSTEM, MEASURING_SYSTEM_P3)),
                   Some(Action::Read { start: 0x0028, count: 2 }));
        assert_eq!(u.state(), State::Acquisition);
    }

    #[test]
    fn test_em24_only_measuring_system_differs() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        detect_em24(&mut u);
        u.start_measurements(settings(71, true, false));
        u.take_actions();
        assert_eq!(first_io(&read(&mut u, &[APPLICATION_H, MEASURING_SYSTEM_P1])),
                   Some(Action::Read { start: REG_EM24_FRONT_SELECTOR, count: 1 }));
        // Application is already H, straight to the measuring system
        assert_eq!(first_io(&read(&mut u, &[0])),
                   Some(Action::Write { register: REG_EM24_MEASURING_SYSTEM, value: MEASURING_SYSTEM_P3 }));
        assert_eq!(u.state(), State::SetMeasuringSystem);
        assert_eq!(first_io(&write_done(&mut u, REG_EM24_MEASURING_SYSTEM, MEASURING_SYSTEM_P3)),
                   Some(Action::Read { start: 0x0028, count: 2 }));
        assert_eq!(u.state(), State::Acquisition);
    }

    #[test]
    fn test_em24_setup_already_correct() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        detect_em24(&mut u);
        u.start_measurements(settings(71, false, false));
        u.take_actions();
        let actions = read(&mut u, &[APPLICATION_H, MEASURING_SYSTEM_P1]);
        assert_eq!(first_io(&actions), Some(Action::Read { start: 0x0028, count: 2 }));
    }

    #[test]
    fn test_em340_piggy_setup() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        read(&mut u, &[340]);
        read(&mut u, &SERIAL_REGS);
        assert_eq!(first_io(&read(&mut u, &[1])), Some(Action::Read { start: REG_EM340_PHASE_SEQUENCE, count: 1 }));
        read(&mut u, &[1]);
        assert_eq!(u.primary().phase_sequence, Some(PhaseSequence::NotOk));
        u.start_measurements(settings(340, false, true));
        u.take_actions();
        assert_eq!(first_io(&read(&mut u, &[0])),
                   Some(Action::Write { register: REG_EM112_MEASUREMENT_MODE, value: MEASUREMENT_MODE_B }));
        assert_eq!(first_io(&write_done(&mut u, REG_EM112_MEASUREMENT_MODE, MEASUREMENT_MODE_B)),
                   Some(Action::Read { start: REG_EM340_MEASURING_SYSTEM, count: 1 }));
        assert_eq!(first_io(&read(&mut u, &[MEASURING_SYSTEM_P3])),
                   Some(Action::Write { register: REG_EM340_MEASURING_SYSTEM, value: MEASURING_SYSTEM_P2 }));
        assert_eq!(first_io(&write_done(&mut u, REG_EM340_MEASURING_SYSTEM, MEASURING_SYSTEM_P2)),
                   Some(Action::Read { start: 0x0012, count: 2 }));
    }

    #[test]
    fn test_em340_single_phase_keeps_three_phase_system() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        read(&mut u, &[345]);
        read(&mut u, &SERIAL_REGS);
        read(&mut u, &[1]);
        read(&mut u, &[0]);
        u.start_measurements(settings(345, false, false));
        u.take_actions();
        read(&mut u, &[MEASUREMENT_MODE_B]);
        let actions = read(&mut u, &[MEASURING_SYSTEM_P3]);
        assert_eq!(first_io(&actions), Some(Action::Read { start: 0x0012, count: 2 }));
    }

    #[test]
    fn test_acquisition_decodes_pending_command() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        detect_em24(&mut u);
        u.start_measurements(settings(71, false, false));
        u.take_actions();
        read(&mut u, &[APPLICATION_H, MEASURING_SYSTEM_P1]);
        read(&mut u, &[1500, 0]);
        assert_eq!(u.primary().phase(crate::models::Phase::MultiPhase).power, 150.0);
        assert_eq!(u.primary().phase(crate::models::Phase::L1).power, 150.0);
    }

    #[test]
    fn test_setup_request_restarts_check() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        detect_em24(&mut u);
        u.start_measurements(settings(71, false, false));
        u.take_actions();
        read(&mut u, &[APPLICATION_H, MEASURING_SYSTEM_P1]);

        u.settings_changed(settings(71, true, false));
        assert!(u.take_actions().is_empty());
        let actions = read(&mut u, &[1500, 0]);
        assert_eq!(first_io(&actions), Some(Action::Read { start: REG_EM24_APPLICATION, count: 2 }));
        assert!(u.primary().phase(crate::models::Phase::MultiPhase).power.is_nan());
    }

    #[test]
    fn test_settings_before_start_are_ignored() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        u.settings_changed(settings(71, true, false));
        assert!(u.settings().is_none());
        assert!(u.take_actions().is_empty());
    }

    #[test]
    fn test_slave_address_change() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        u.request_slave_address(2);
        assert_eq!(first_io(&read(&mut u, &[120])), Some(Action::Write { register: REG_SLAVE_ADDRESS, value: 2 }));
        assert_eq!(first_io(&write_done(&mut u, REG_SLAVE_ADDRESS, 2)),
                   Some(Action::Read { start: REG_EM112_SERIAL, count: 7 }));
        assert_eq!(u.slave_address(), 2);
        u.on_read_completed(ModbusFunction::ReadHoldingRegisters, 2, &SERIAL_REGS);
        assert_eq!(u.primary().serial(), "A123456");
    }

    #[test]
    fn test_slave_address_taken_from_request() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        u.request_slave_address(7);
        read(&mut u, &[120]);
        assert_eq!(u.state(), State::SetAddress);
        // Echo differs from the request, the requested address wins
        write_done(&mut u, REG_SLAVE_ADDRESS, 9);
        assert_eq!(u.slave_address(), 7);
        assert_eq!(u.piggy().slave_address(), 7);
        assert_eq!(u.state(), State::Serial);
    }

    #[test]
    fn test_slave_address_request_survives_reconnect_wait() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        u.take_actions();
        read(&mut u, &[999]);
        assert_eq!(u.state(), State::WaitOnConnectionLost);
        u.request_slave_address(4);
        // Any event handled while waiting must not drop the request
        u.on_error(ModbusErrorKind::Timeout, 1, 0);
        assert!(u.take_actions().is_empty());
        assert_eq!(u.requested_address, Some(4));

        u.on_wait_finished();
        assert_eq!(first_io(&u.take_actions()), Some(Action::Write { register: REG_SLAVE_ADDRESS, value: 4 }));
        assert_eq!(u.state(), State::SetAddress);
    }

    #[test]
    fn test_unexpected_read_while_waiting_is_ignored() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        detect_em24(&mut u);
        assert!(read(&mut u, &[1, 2]).is_empty());
        assert_eq!(u.state(), State::WaitForStart);
    }

    fn start_em24_single_phase() -> MeterUpdater {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        detect_em24(&mut u);
        u.start_measurements(settings(71, false, false));
        u.take_actions();
        read(&mut u, &[APPLICATION_H, MEASURING_SYSTEM_P1]);
        u
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_waits_for_rest_of_period() {
        let mut u = start_em24_single_phase();
        let actions = read(&mut u, &[1500, 0]);
        assert_eq!(u.state(), State::Wait);
        assert_eq!(first_io(&actions), Some(Action::StartTimer(ACQUISITION_PERIOD)));

        u.on_wait_finished();
        u.take_actions();
        tokio::time::advance(Duration::from_millis(100)).await;
        let actions = read(&mut u, &[1500, 0]);
        assert_eq!(u.state(), State::Wait);
        assert_eq!(first_io(&actions), Some(Action::StartTimer(Duration::from_millis(150))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_skips_short_wait() {
        let mut u = start_em24_single_phase();
        // 40 ms left is below the minimum wait, next sub-cycle starts right away
        tokio::time::advance(Duration::from_millis(210)).await;
        let actions = read(&mut u, &[1500, 0]);
        assert_eq!(u.state(), State::Acquisition);
        assert_eq!(u.acquisition_index(), 1);
        assert!(matches!(first_io(&actions), Some(Action::Read { .. })));
    }

    #[test]
    fn test_disconnect_clears_models() {
        let mut u = MeterUpdater::new("/dev/ttyUSB0", 1, false);
        detect_em24(&mut u);
        u.start_measurements(settings(71, false, false));
        u.take_actions();
        read(&mut u, &[APPLICATION_H, MEASURING_SYSTEM_P1]);
        read(&mut u, &[1500, 0]);
        // Sub-cycle 0 is done, a read has to be outstanding for timeouts to count
        assert_eq!(u.state(), State::Wait);
        u.on_wait_finished();
        assert!(matches!(first_io(&u.take_actions()), Some(Action::Read { .. })));
        for _ in 0..4 {
            timeout(&mut u);
        }
        assert_eq!(u.state(), State::Acquisition);
        assert_eq!(u.timeout_count, 4);
        let actions = timeout(&mut u);
        assert_eq!(u.state(), State::WaitOnConnectionLost);
        assert_eq!(first_io(&actions), Some(Action::StartTimer(RECONNECT_INTERVAL)));
        assert_eq!(u.timeout_count, 0);
        assert_eq!(u.error_count, 0);
        assert_eq!(u.primary().connection_state, ConnectionState::Disconnected);
        assert!(u.primary().serial().is_empty());
        assert!(u.piggy().serial().is_empty());
        assert!(u.primary().phase(crate::models::Phase::MultiPhase).power.is_nan());
        assert!(u.settings().is_none());
    }
}

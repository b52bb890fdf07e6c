use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{read_config, write_config, ConfigChange, MeterSettings, SerialConfig, SharedConfig};
use crate::models::MeterModel;
use bus::{BusError, BusEvent, BusHandle, ModbusRtu};
use updater::{Action, MeterUpdater};

pub mod bus;
pub mod decoder;
pub mod registers;
pub mod updater;

/// Published state of one slave: the primary meter, its piggybacked
/// companion on L2 and the settings in use.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSnapshot {
    pub primary: MeterModel,
    pub piggy: MeterModel,
    pub settings: Option<MeterSettings>,
}

impl MeterSnapshot {
    fn new(port: &str, slave: u8, is_zigbee: bool) -> Self {
        MeterSnapshot {
            primary: MeterModel::new(port.to_string(), slave, is_zigbee),
            piggy: MeterModel::new(port.to_string(), slave, is_zigbee),
            settings: None,
        }
    }
}

/// Requests from outside the bus, e.g. the MQTT command topic.
#[derive(Debug, Clone, PartialEq)]
pub enum MeterCommand {
    SetSlaveAddress { slave: u8, address: u8 },
}

pub struct ModbusManager {
    config: SharedConfig,
    serial: SerialConfig,
    meters: Vec<(u8, watch::Sender<MeterSnapshot>)>,
    receivers: HashMap<u8, watch::Receiver<MeterSnapshot>>,
    command_tx: mpsc::Sender<MeterCommand>,
    command_rx: mpsc::Receiver<MeterCommand>,
}

impl ModbusManager {
    pub fn new(config: SharedConfig) -> Self {
        let serial = read_config(&config).serial();
        let mut meters = Vec::new();
        let mut receivers = HashMap::new();
        for slave in serial.slaves.iter() {
            if receivers.contains_key(slave) {
                warn!("Slave {slave} configured twice, ignoring the duplicate");
                continue;
            }
            let (tx, rx) = watch::channel(MeterSnapshot::new(&serial.port, *slave, serial.is_zigbee));
            meters.push((*slave, tx));
            receivers.insert(*slave, rx);
        }
        let (command_tx, command_rx) = mpsc::channel(10);

        ModbusManager {
            config,
            serial,
            meters,
            receivers,
            command_tx,
            command_rx,
        }
    }

    pub fn subscribe(&self, slave: u8) -> Option<watch::Receiver<MeterSnapshot>> {
        self.receivers.get(&slave).cloned()
    }

    pub fn subscribe_all(&self) -> Vec<watch::Receiver<MeterSnapshot>> {
        self.receivers.values().cloned().collect()
    }

    pub fn command_sender(&self) -> mpsc::Sender<MeterCommand> {
        self.command_tx.clone()
    }

    pub async fn start_thread(&mut self) {
        let (mut bus, handle) = match ModbusRtu::open(&self.serial) {
            Ok(b) => b,
            Err(e) => {
                error!("{e}");
                return;
            }
        };
        tokio::spawn(async move {
            bus.start_thread().await;
        });
        self.run(handle).await;
    }

    /// Spawns one driver per slave on an already running bus and forwards
    /// commands until every driver has stopped.
    pub async fn run(&mut self, handle: BusHandle) {
        let mut threads: Vec<JoinHandle<()>> = Vec::new();
        let mut commands: HashMap<u8, mpsc::Sender<u8>> = HashMap::new();

        for (slave, model_tx) in std::mem::take(&mut self.meters) {
            let (tx, rx) = mpsc::channel(4);
            commands.insert(slave, tx);
            let driver = MeterDriver::new(&self.serial, slave, handle.clone(), self.config.clone(), model_tx, rx);
            threads.push(tokio::spawn(async move {
                driver.run().await;
            }));
        }
        /* Drivers hold their own clones, ours would keep the bus alive forever */
        drop(handle);
        info!("Started {} meter driver(s) on {}", threads.len(), self.serial.port);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(MeterCommand::SetSlaveAddress { slave, address }) = command else {
                        continue;
                    };
                    match commands.get(&slave) {
                        Some(tx) => { let _ = tx.send(address).await; },
                        None => warn!("No meter driver for slave {slave}"),
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(10)) => {
                    if threads.iter().all(|t| t.is_finished()) {
                        warn!("All meter drivers stopped");
                        return;
                    }
                }
            }
        }
    }
}

/// Executes the actions of one [`MeterUpdater`] against the bus.
struct MeterDriver {
    updater: MeterUpdater,
    bus: BusHandle,
    events: broadcast::Receiver<BusEvent>,
    config: SharedConfig,
    config_change: broadcast::Receiver<ConfigChange>,
    model_tx: watch::Sender<MeterSnapshot>,
    commands: mpsc::Receiver<u8>,
    timer_deadline: Option<Instant>,
}

impl MeterDriver {
    fn new(serial: &SerialConfig, slave: u8, bus: BusHandle, config: SharedConfig,
           model_tx: watch::Sender<MeterSnapshot>, commands: mpsc::Receiver<u8>) -> Self {
        let events = bus.subscribe();
        let config_change = read_config(&config).get_change_receiver();
        MeterDriver {
            updater: MeterUpdater::new(&serial.port, slave, serial.is_zigbee),
            bus,
            events,
            config,
            config_change,
            model_tx,
            commands,
            timer_deadline: None,
        }
    }

    async fn run(mut self) {
        let timer = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            if let Err(e) = self.execute().await {
                info!("Stopping driver of slave {}: {e}", self.updater.slave_address());
                return;
            }
            if let Some(deadline) = self.timer_deadline.take() {
                timer.as_mut().reset(deadline);
                armed = true;
            }

            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(event) => self.updater.handle_event(&event),
                    Err(RecvError::Lagged(n)) => warn!("Slave {} missed {n} bus events", self.updater.slave_address()),
                    Err(RecvError::Closed) => return,
                },
                () = &mut timer, if armed => {
                    armed = false;
                    self.updater.on_wait_finished();
                }
                change = self.config_change.recv() => match change {
                    Ok(change) if change.base == "meters" => self.reload_settings(),
                    Ok(_) => {},
                    Err(RecvError::Lagged(_)) => self.reload_settings(),
                    Err(RecvError::Closed) => {},
                },
                Some(address) = self.commands.recv() => self.updater.request_slave_address(address),
                () = self.model_tx.closed() => {
                    debug!("Nobody watches slave {} anymore", self.updater.slave_address());
                    return;
                }
            }
        }
    }

    fn reload_settings(&mut self) {
        let serial = self.updater.primary().serial().to_string();
        if serial.is_empty() {
            return;
        }
        let Some(settings) = read_config(&self.config).meter_settings(&serial) else {
            return;
        };
        if self.updater.settings() != Some(&settings) {
            self.updater.settings_changed(settings);
            self.publish();
        }
    }

    /// Works off the queued actions, including the ones queued while doing so.
    async fn execute(&mut self) -> Result<(), BusError> {
        let mut changed = false;
        loop {
            let actions = self.updater.take_actions();
            if actions.is_empty() {
                break;
            }
            let slave = self.updater.slave_address();
            for action in actions {
                match action {
                    Action::Read { start, count } => self.bus.read_registers(slave, start, count).await?,
                    Action::Write { register, value } => self.bus.write_register(slave, register, value).await?,
                    Action::StartTimer(duration) => self.timer_deadline = Some(Instant::now() + duration),
                    Action::Detected => {
                        let settings = {
                            let identity = &self.updater.primary().identity;
                            write_config(&self.config).meter_settings_or_create(identity.device_type, &identity.serial)
                        };
                        info!("Energy meter {} ({}) detected on slave {}", settings.serial,
                              self.updater.primary().product_name(), slave);
                        self.updater.start_measurements(settings);
                        changed = true;
                    }
                    Action::ModelChanged => changed = true,
                }
            }
        }
        if changed {
            self.publish();
        }
        Ok(())
    }

    fn publish(&self) {
        let snapshot = MeterSnapshot {
            primary: self.updater.primary().clone(),
            piggy: self.updater.piggy().clone(),
            settings: self.updater.settings().cloned(),
        };
        self.model_tx.send_replace(snapshot);
    }
}

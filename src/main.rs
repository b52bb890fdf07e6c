use meter2hub4::{
    config::{read_config, write_config},
    hub4::inverter::InverterData,
    mqtt::{bridge::{InverterBridge, MeterPublisher}, internal_commands::CommandHandler, publish_uptime, MqttManager},
    ConfigHolder, Hub4Manager, ModbusManager,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use std::time::Duration;
use log::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("M2H_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match ConfigHolder::load() {
        Ok(c) => c.into_shared(),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let (mqtt_config, hub4) = {
        let c = read_config(&config);
        (c.config.mqtt.clone(), c.hub4())
    };

    let (mut mqtt, tx) = MqttManager::new(&mqtt_config);
    let mut threads: Vec<JoinHandle<()>> = Vec::new();
    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    let mut modbus = ModbusManager::new(config.clone());

    // Every meter gets published, the grid meter also feeds the control loop
    for meter in modbus.subscribe_all() {
        let mut publisher = MeterPublisher::new(tx.clone(), mqtt_config.base_topic.clone(), meter);
        threads.push(tokio::spawn(async move {
            publisher.start_thread().await;
        }));
    }

    let (inverter_tx, inverter_rx) = watch::channel(InverterData::new());
    let (command_tx, command_rx) = mpsc::channel(10);
    let mut inverter = InverterBridge::new(tx.clone(), hub4.inverter.clone(), hub4.phase, inverter_tx, command_rx);
    threads.push(tokio::spawn(async move {
        inverter.start_thread().await;
    }));

    if hub4.enabled {
        match modbus.subscribe(hub4.meter_slave) {
            Some(meter) => {
                let mut control = Hub4Manager::new(config.clone(), meter, inverter_rx, command_tx);
                threads.push(tokio::spawn(async move {
                    control.start_thread().await;
                }));
            }
            None => error!("Hub4 meter slave {} is not in the serial slave list", hub4.meter_slave),
        }
    }

    let command = CommandHandler::new(tx.clone(), modbus.command_sender(), config.clone(), mqtt_config.base_topic.clone());
    threads.push(tokio::spawn(async move {
        modbus.start_thread().await;
    }));

    /* Make sure to handle the dirty flag of the configuration */
    let save_config = config.clone();
    threads.push(tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let mut c = write_config(&save_config);
            if c.is_dirty() {
                if let Err(e) = c.save() {
                    error!("Saving config failed: {e}");
                }
            }
        }
    }));

    /* Periodic uptime publishing */
    let uptime_sender = tx.clone();
    let base_topic = mqtt_config.base_topic.clone();
    threads.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            publish_uptime(&uptime_sender, &base_topic).await;
        }
    }));

    /* Last but not least start our command handling */
    threads.push(tokio::spawn(async move {
        command.start_thread().await;
    }));
    drop(tx);

    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        if threads.iter().any(|t| t.is_finished()) {
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }

    let mut c = write_config(&config);
    if let Err(e) = c.save() {
        error!("Saving config on exit failed: {e}");
    }
}

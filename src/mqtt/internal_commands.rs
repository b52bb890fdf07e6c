use log::{error, info, warn};
use tokio::sync::mpsc::{Receiver, Sender};

use crate::config::{write_config, SharedConfig};
use crate::metering_modbus::MeterCommand;
use crate::mqtt::{SubscribeData, Transmission};

#[derive(Debug, PartialEq)]
pub enum Command {
    Restart,
    Meter(MeterCommand),
}

pub fn parse_command(text: &str) -> Option<Command> {
    let mut parts = text.split_whitespace();
    match parts.next()? {
        "restart" => Some(Command::Restart),
        "set_address" => {
            let slave = parts.next()?.parse::<u8>().ok()?;
            let address = parts.next()?.parse::<u8>().ok()?;
            if parts.next().is_some() || !(1..=247).contains(&address) {
                return None;
            }
            Some(Command::Meter(MeterCommand::SetSlaveAddress { slave, address }))
        }
        _ => None,
    }
}

pub struct CommandHandler {
    sender: Sender<Transmission>,
    meters: Sender<MeterCommand>,
    config: SharedConfig,
    base_topic: String,
}

impl CommandHandler {
    pub fn new(sender: Sender<Transmission>, meters: Sender<MeterCommand>, config: SharedConfig, base_topic: String) -> Self {
        CommandHandler { sender, meters, config, base_topic }
    }

    async fn subscribe(&self, topic: String) -> Receiver<String> {
        let (sender, receiver) = tokio::sync::mpsc::channel(10);
        let register = Transmission::Subscribe(SubscribeData { topic, sender });
        let _ = self.sender.send(register).await;
        receiver
    }

    pub async fn start_thread(&self) {
        info!("Starting CommandHandler thread");
        let mut commands = self.subscribe(format!("{}/mgt/command", self.base_topic)).await;
        /* Settings arrive as JSON objects, only the given keys change */
        let mut meter_settings = self.subscribe(format!("{}/settings/meter", self.base_topic)).await;
        let mut hub4_settings = self.subscribe(format!("{}/settings/hub4", self.base_topic)).await;

        info!("Start waiting for command messages");
        loop {
            tokio::select! {
                Some(c) = commands.recv() => {
                    info!("Received command {c}");

                    match parse_command(c.trim()) {
                        Some(Command::Restart) => {
                            /* if we exit that thread the rest will exit, too */
                            info!("Request to shutdown received");
                            return;
                        }
                        Some(Command::Meter(command)) => {
                            if self.meters.send(command).await.is_err() {
                                warn!("Meter manager is gone, dropping command");
                            }
                        }
                        None => warn!("Ignoring unknown command {c:?}"),
                    }
                }
                Some(payload) = meter_settings.recv() => {
                    if let Err(e) = write_config(&self.config).apply_meter_settings_json(&payload) {
                        error!("Rejected meter settings {payload}: {e}");
                    }
                }
                Some(payload) = hub4_settings.recv() => {
                    if let Err(e) = write_config(&self.config).apply_hub4_json(&payload) {
                        error!("Rejected hub4 settings {payload}: {e}");
                    }
                }
                else => {
                    info!("Command subscriptions closed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("restart"), Some(Command::Restart));
        assert_eq!(parse_command("set_address 1 12"),
                   Some(Command::Meter(MeterCommand::SetSlaveAddress { slave: 1, address: 12 })));
        assert_eq!(parse_command("set_address 1 0"), None);
        assert_eq!(parse_command("set_address 1 248"), None);
        assert_eq!(parse_command("set_address 1"), None);
        assert_eq!(parse_command("set_address 1 2 3"), None);
        assert_eq!(parse_command("reboot"), None);
        assert_eq!(parse_command(""), None);
    }

    fn shared_config() -> SharedConfig {
        let config = crate::config::ConfigHolder::parse(r#"
serial:
  port: /dev/null
mqtt:
  host: localhost
  port: 1883
"#).unwrap();
        crate::config::ConfigHolder::from_config(config, std::path::PathBuf::from("unused.yaml")).into_shared()
    }

    async fn subscriptions(rx: &mut Receiver<Transmission>) -> Vec<SubscribeData> {
        let mut subs = Vec::new();
        while subs.len() < 3 {
            match rx.recv().await {
                Some(Transmission::Subscribe(s)) => subs.push(s),
                Some(Transmission::Publish(_)) => {}
                None => panic!("handler stopped"),
            }
        }
        subs
    }

    #[tokio::test]
    async fn test_handler_forwards_and_restarts() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let (meter_tx, mut meter_rx) = tokio::sync::mpsc::channel(4);
        let handler = CommandHandler::new(tx, meter_tx, shared_config(), "m2h".to_string());
        let task = tokio::spawn(async move { handler.start_thread().await });

        let subs = subscriptions(&mut rx).await;
        assert_eq!(subs[0].topic, "m2h/mgt/command");
        subs[0].sender.send("set_address 2 5".to_string()).await.unwrap();
        assert_eq!(meter_rx.recv().await, Some(MeterCommand::SetSlaveAddress { slave: 2, address: 5 }));

        subs[0].sender.send("restart".to_string()).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_applies_settings() {
        let config = shared_config();
        write_config(&config).meter_settings_or_create(71, "BV1");
        let mut changes = write_config(&config).get_change_receiver();

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let (meter_tx, _meter_rx) = tokio::sync::mpsc::channel(4);
        let handler = CommandHandler::new(tx, meter_tx, config.clone(), "m2h".to_string());
        tokio::spawn(async move { handler.start_thread().await });

        let subs = subscriptions(&mut rx).await;
        assert_eq!(subs[1].topic, "m2h/settings/meter");
        assert_eq!(subs[2].topic, "m2h/settings/hub4");

        // A broken payload leaves the config alone
        subs[1].sender.send("{not json".to_string()).await.unwrap();
        subs[1].sender.send(r#"{"serial": "BV1", "is_multi_phase": true}"#.to_string()).await.unwrap();
        let change = changes.recv().await.unwrap();
        assert_eq!(change.base, "meters");
        assert!(crate::config::read_config(&config).meter_settings("BV1").unwrap().is_multi_phase);

        subs[2].sender.send(r#"{"maintenance_interval": 0}"#.to_string()).await.unwrap();
        assert_eq!(changes.recv().await.unwrap().base, "hub4");
        assert_eq!(crate::config::read_config(&config).hub4().maintenance_interval, 0);
    }
}

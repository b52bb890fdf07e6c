pub mod bridge;
pub mod internal_commands;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::RwLock;

use crate::config::MqttConfig;

pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

pub struct SubscribeData {
    pub topic: String,
    pub sender: tokio::sync::mpsc::Sender<String>,
}

pub enum Transmission {
    Subscribe(SubscribeData),
    Publish(PublishData),
}

pub struct Callbacks {
    calls: HashMap<String, Vec<tokio::sync::mpsc::Sender<String>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: HashMap::new() };
    }

    pub fn insert(&mut self, topic: String, callback: tokio::sync::mpsc::Sender<String>) {
        debug!("Adding callback for topic {topic}");
        self.calls.entry(topic).or_default().push(callback);
    }

    pub async fn send(&self, topic: &str, payload: String) {
        let Some(v) = self.calls.get(topic) else {
            debug!("Send for unknown topic {topic}");
            return;
        };
        for call in v {
            debug!("Sending to callback: {payload}");
            if call.send(payload.clone()).await.is_err() {
                debug!("Callback for {topic} is gone");
            }
        }
    }

    pub fn get_topics(&self) -> Vec<String> {
        self.calls.keys().cloned().collect()
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
    static ref START_TIME: Instant = Instant::now();
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    client: AsyncClient,
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);
        lazy_static::initialize(&START_TIME);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Spawn a new thread to handle the incoming messages
        let reconnect_c = client.clone();
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let payload = String::from_utf8_lossy(&p.payload).to_string();
                        debug!("Received MQTT message on {}: {payload:?}", p.topic);

                        let callback = CALLBACKS.read().await;
                        callback.send(&p.topic, payload).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");

                        /* We are connected resubscribe to everything */
                        let topics = CALLBACKS.read().await.get_topics();
                        for topic in topics {
                            let client_clone = reconnect_c.clone();
                            tokio::spawn(async move {
                                if let Err(e) = client_clone.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                    error!("Resubscribing {topic} failed: {e}");
                                }
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (MqttManager { client, rx: mrx }, mtx)
    }

    pub async fn start_thread(&mut self) {
        while let Some(transmission) = self.rx.recv().await {
            match transmission {
                Transmission::Subscribe(subscribe_data) => {
                    let topic = subscribe_data.topic;
                    if self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await.is_ok() {
                        CALLBACKS.write().await.insert(topic.clone(), subscribe_data.sender);
                        info!("Registered Callback {topic}");
                    }
                }
                Transmission::Publish(publish_data) => {
                    match self.client.publish(
                        publish_data.topic,
                        match publish_data.qos {
                            0 => QoS::AtMostOnce,
                            1 => QoS::AtLeastOnce,
                            2 => QoS::ExactlyOnce,
                            _ => QoS::AtMostOnce,
                        },
                        publish_data.retain,
                        publish_data.payload,
                    ).await {
                        Err(e) => error!("Error publishing: {}", e),
                        Ok(_) => debug!("Published successfully"),
                    }
                }
            }
        }
        info!("All MQTT senders are gone, thread exit");
    }
}

pub fn uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub async fn publish_uptime(mqtt_sender: &Sender<Transmission>, base_topic: &str) {
    let uptime_publish = PublishData {
        topic: format!("{base_topic}/mgt/uptime"),
        payload: uptime_seconds().to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(uptime_publish)).await;
}

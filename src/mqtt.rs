//! The publish/subscribe side of the bridge.
//!
//! Inbound messages are received by a listener task that owns the MQTT event loop. It only ever
//! parses the message into a [`PendingCommand`] and pushes it onto an unbounded queue, so it never
//! waits for the bridge loop. Everything else goes through the [`Bus`] handle owned by the loop.

use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, ClientError, Event, EventLoop, MqttOptions};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the MQTT client rejected the request")]
    Client(#[source] ClientError),
    #[error("the broker did not accept a connection within {0:?}")]
    ConnectTimeout(Duration),
    #[error("the MQTT event loop is no longer running")]
    ListenerGone,
    #[error("not connected to the broker")]
    NotConnected,
}

/// A connection to a publish/subscribe broker.
pub trait Bus {
    /// Wait until the link to the broker is up.
    async fn connect(&mut self) -> Result<(), Error>;
    async fn subscribe(&mut self, topic: &str) -> Result<(), Error>;
    /// Publish a retained message.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), Error>;
    fn is_connected(&self) -> bool;
    /// Disconnect from the broker.
    async fn close(&mut self) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    SetFanMode,
    SetTemperature,
    ResetAlarms,
}

/// An inbound request waiting to be applied to the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCommand {
    pub kind: CommandKind,
    pub payload: String,
}

#[derive(Clone, Debug)]
pub struct Topics {
    pub base: String,
    pub fan_set: String,
    pub temp_set: String,
    pub alarms_reset: String,
    pub settings: String,
    pub status: String,
    pub sensors: String,
    pub alarms: String,
}

impl Topics {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.to_string(),
            fan_set: format!("{base}/fan/set"),
            temp_set: format!("{base}/temp/set"),
            alarms_reset: format!("{base}/alarms/reset"),
            settings: format!("{base}/settings/sensor"),
            status: format!("{base}/status/sensor"),
            sensors: format!("{base}/sensors/sensor"),
            alarms: format!("{base}/alarms/sensor"),
        }
    }

    pub fn subscriptions(&self) -> [&str; 3] {
        [&self.fan_set, &self.temp_set, &self.alarms_reset]
    }

    /// Interpret a message received on one of the command topics.
    pub fn command(&self, topic: &str, payload: &[u8]) -> Option<PendingCommand> {
        let kind = if topic == self.fan_set {
            CommandKind::SetFanMode
        } else if topic == self.temp_set {
            CommandKind::SetTemperature
        } else if topic == self.alarms_reset {
            CommandKind::ResetAlarms
        } else {
            return None;
        };
        Some(PendingCommand { kind, payload: String::from_utf8_lossy(payload).into_owned() })
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "mqtt::Args")]
pub struct Args {
    /// Hostname of the MQTT broker.
    #[arg(long, default_value = "127.0.0.1")]
    mqtt_host: String,

    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    #[arg(long, default_value = "swegon-modbus-daemon")]
    mqtt_client_id: String,

    #[arg(long, requires = "mqtt_password")]
    mqtt_username: Option<String>,

    #[arg(long, requires = "mqtt_username")]
    mqtt_password: Option<String>,

    /// Prefix of every topic the bridge subscribes or publishes to.
    #[arg(long, default_value = "swegon")]
    pub topic_base: String,

    /// Give up waiting for the broker to accept a connection after this long.
    #[arg(long, default_value = "5s")]
    mqtt_connect_timeout: humantime::Duration,

    /// Pause between connection attempts made by the MQTT event loop.
    #[arg(long, default_value = "1s")]
    mqtt_retry_delay: humantime::Duration,
}

pub struct MqttBus {
    client: AsyncClient,
    /// The current broker session, counting up with each accepted connection.
    link: watch::Receiver<Option<u64>>,
    /// The session the subscriptions were made in.
    session: Option<u64>,
    connect_timeout: Duration,
    #[allow(unused)] // exists for its drop handler
    listener: AbortOnDropHandle<()>,
}

impl MqttBus {
    /// Set up the client and spawn the listener feeding `commands`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(args: &Args, topics: Topics, commands: mpsc::UnboundedSender<PendingCommand>) -> Self {
        let mut options = MqttOptions::new(&args.mqtt_client_id, &args.mqtt_host, args.mqtt_port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&args.mqtt_username, &args.mqtt_password) {
            options.set_credentials(username.clone(), password.clone());
        }
        let (client, event_loop) = AsyncClient::new(options, 64);
        let (link_sender, link) = watch::channel(None);
        let listener = AbortOnDropHandle::new(tokio::spawn(listen(
            event_loop,
            topics,
            commands,
            link_sender,
            *args.mqtt_retry_delay,
        )));
        Self { client, link, session: None, connect_timeout: *args.mqtt_connect_timeout, listener }
    }
}

async fn listen(
    mut event_loop: EventLoop,
    topics: Topics,
    commands: mpsc::UnboundedSender<PendingCommand>,
    link: watch::Sender<Option<u64>>,
    retry_delay: Duration,
) {
    let mut sessions = 0;
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                sessions += 1;
                info!(session = sessions, "connected to the broker");
                link.send_replace(Some(sessions));
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic);
                debug!(%topic, "received message");
                let Some(command) = topics.command(&topic, &publish.payload) else {
                    continue;
                };
                if commands.send(command).is_err() {
                    debug!("command queue closed, listener exits");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect(_))) => {
                warn!("broker closed the connection");
                link.send_replace(None);
            }
            Ok(event) => trace!(?event, "mqtt event"),
            Err(e) => {
                if link.send_replace(None).is_some() {
                    warn!(
                        message = "disconnected from the broker",
                        error = (&e as &dyn std::error::Error)
                    );
                } else {
                    debug!(message = "connection attempt failed", error = (&e as &dyn std::error::Error));
                }
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

impl Bus for MqttBus {
    async fn connect(&mut self) -> Result<(), Error> {
        let up = self.link.wait_for(|session| session.is_some());
        match tokio::time::timeout(self.connect_timeout, up).await {
            Ok(Ok(session)) => {
                self.session = *session;
                Ok(())
            }
            Ok(Err(_)) => Err(Error::ListenerGone),
            Err(_) => Err(Error::ConnectTimeout(self.connect_timeout)),
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Error> {
        debug!(topic, "subscribing");
        self.client.try_subscribe(topic.to_string(), QoS::AtLeastOnce).map_err(Error::Client)
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        trace!(topic, bytes = payload.len(), "publishing");
        self.client.try_publish(topic.to_string(), QoS::AtLeastOnce, true, payload).map_err(Error::Client)
    }

    /// Whether the session the subscriptions were made in is still alive.
    fn is_connected(&self) -> bool {
        self.session.is_some() && *self.link.borrow() == self.session
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.client.disconnect().await.map_err(Error::Client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_topics() {
        let topics = Topics::new("swegon");
        assert_eq!(topics.subscriptions(), ["swegon/fan/set", "swegon/temp/set", "swegon/alarms/reset"]);
        assert_eq!(
            topics.command("swegon/fan/set", b"Boost"),
            Some(PendingCommand { kind: CommandKind::SetFanMode, payload: "Boost".into() })
        );
        assert_eq!(
            topics.command("swegon/temp/set", b"21.4"),
            Some(PendingCommand { kind: CommandKind::SetTemperature, payload: "21.4".into() })
        );
        assert_eq!(
            topics.command("swegon/alarms/reset", b""),
            Some(PendingCommand { kind: CommandKind::ResetAlarms, payload: String::new() })
        );
        assert_eq!(topics.command("swegon/status/sensor", b"{}"), None);
        assert_eq!(topics.status, "swegon/status/sensor");
    }

    #[tokio::test]
    async fn unreachable_broker_times_out() {
        use clap::Parser as _;
        #[derive(clap::Parser)]
        struct Cli {
            #[clap(flatten)]
            mqtt: Args,
        }
        let cli = Cli::try_parse_from([
            "x",
            "--mqtt-port",
            "1",
            "--mqtt-connect-timeout",
            "50ms",
            "--mqtt-retry-delay",
            "10ms",
        ])
        .unwrap();
        let (sender, _receiver) = mpsc::unbounded_channel();
        let mut bus = MqttBus::new(&cli.mqtt, Topics::new("swegon"), sender);
        assert!(matches!(bus.connect().await, Err(Error::ConnectTimeout(_))));
        assert!(!bus.is_connected());
        assert!(matches!(bus.publish("a", vec![]).await, Err(Error::NotConnected)));
    }
}

//! The bridge loop: connects to the bus, applies inbound commands and publishes device state.
//!
//! The loop advances one [`Bridge::tick`] at a time. While connected, every tick first drains
//! the inbound command queue, publishing the state after each applied command, and then counts
//! down towards the next periodic publish.

use crate::connection::Transport;
use crate::gateway::{self, DeviceGateway};
use crate::mqtt::{self, Bus, CommandKind, PendingCommand, Topics};
use crate::projector::StateProjector;
use crate::registers::FanMode;
use std::future::Future;
use std::pin::pin;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "bridge::Timing")]
pub struct Timing {
    /// Idle time between loop iterations.
    #[arg(long, default_value = "1s")]
    pub tick: humantime::Duration,

    /// Publish the full state every this many ticks.
    #[arg(long, default_value = "15")]
    pub publish_every: u32,

    /// After a command, publish again once this many ticks have passed.
    #[arg(long, default_value = "4")]
    pub refresh_after_command: u32,

    /// Time given to the device to apply a written setting before reading it back.
    #[arg(long, default_value = "1s")]
    pub settle_delay: humantime::Duration,

    /// Wait this long between attempts to connect to the broker or to reach the device.
    #[arg(long, default_value = "5s")]
    pub reconnect_delay: humantime::Duration,

    /// How many times a failed register read cycle is re-run before giving up on it.
    #[arg(long, default_value = "3")]
    pub read_retries: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick: std::time::Duration::from_secs(1).into(),
            publish_every: 15,
            refresh_after_command: 4,
            settle_delay: std::time::Duration::from_secs(1).into(),
            reconnect_delay: std::time::Duration::from_secs(5).into(),
            read_retries: 3,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("`{0}` is not a known fan mode")]
    UnknownFanMode(String),
    #[error("`{0}` is not a temperature")]
    InvalidTemperature(String),
    #[error("the device did not accept the new setting")]
    Write(#[source] gateway::Error),
}

/// A failure that takes the bridge back to [`ConnectionState::Disconnected`].
#[derive(thiserror::Error, Debug)]
enum Disruption {
    #[error("message bus failed")]
    Bus(#[from] mqtt::Error),
    #[error("device communication failed")]
    Device(#[from] gateway::Error),
    #[error("could not serialize the device state")]
    Serialize(#[from] serde_json::Error),
}

pub struct Bridge<T, B> {
    gateway: DeviceGateway<T>,
    projector: StateProjector,
    bus: B,
    topics: Topics,
    commands: mpsc::UnboundedReceiver<PendingCommand>,
    timing: Timing,
    state: ConnectionState,
    countdown: u32,
    registration: Option<Vec<(String, Vec<u8>)>>,
}

impl<T: Transport, B: Bus> Bridge<T, B> {
    pub fn new(
        gateway: DeviceGateway<T>,
        bus: B,
        topics: Topics,
        commands: mpsc::UnboundedReceiver<PendingCommand>,
        timing: Timing,
    ) -> Self {
        Self {
            gateway,
            projector: StateProjector::new(),
            bus,
            topics,
            commands,
            timing,
            state: ConnectionState::Disconnected,
            countdown: 0,
            registration: None,
        }
    }

    /// Messages to publish once, after the first successful connection.
    pub fn with_registration(mut self, messages: Vec<(String, Vec<u8>)>) -> Self {
        self.registration = Some(messages);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn gateway_mut(&mut self) -> &mut DeviceGateway<T> {
        &mut self.gateway
    }

    /// Run until `shutdown` resolves, then stop accepting commands and disconnect.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<(), mqtt::Error> {
        let mut shutdown = pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.tick() => {}
            }
        }
        info!("shutting down");
        self.commands.close();
        self.bus.close().await
    }

    /// Advance the state machine by one step.
    pub async fn tick(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {
                info!("connecting to the message bus");
                self.state = ConnectionState::Connecting;
            }
            ConnectionState::Connecting => match self.establish().await {
                Ok(()) => {
                    info!("bridge is online");
                    self.state = ConnectionState::Connected;
                    self.countdown = 0;
                }
                Err(e) => {
                    warn!(
                        message = "could not connect to the message bus, retrying",
                        error = (&e as &dyn std::error::Error)
                    );
                    tokio::time::sleep(*self.timing.reconnect_delay).await;
                }
            },
            ConnectionState::Connected => {
                if let Err(e) = self.serve().await {
                    warn!(
                        message = "lost connectivity, reconnecting",
                        error = (&e as &dyn std::error::Error)
                    );
                    self.state = ConnectionState::Disconnected;
                    if matches!(e, Disruption::Device(_)) {
                        // Back off before retrying the device.
                        tokio::time::sleep(*self.timing.reconnect_delay).await;
                    }
                }
            }
        }
    }

    async fn establish(&mut self) -> Result<(), mqtt::Error> {
        self.bus.connect().await?;
        for topic in self.topics.subscriptions() {
            self.bus.subscribe(topic).await?;
        }
        if let Some(messages) = &self.registration {
            for (topic, payload) in messages {
                self.bus.publish(topic, payload.clone()).await?;
            }
            debug!(count = messages.len(), "published discovery messages");
            self.registration = None;
        }
        Ok(())
    }

    async fn serve(&mut self) -> Result<(), Disruption> {
        if !self.bus.is_connected() {
            return Err(mqtt::Error::NotConnected.into());
        }
        while let Ok(command) = self.commands.try_recv() {
            match self.apply(&command).await {
                Ok(()) => {}
                Err(CommandError::Write(e)) if e.is_transport() => return Err(e.into()),
                Err(e) => {
                    warn!(
                        message = "dropping command",
                        ?command,
                        error = (&e as &dyn std::error::Error)
                    );
                    continue;
                }
            }
            tokio::time::sleep(*self.timing.settle_delay).await;
            self.publish_state().await?;
            self.countdown = self.timing.refresh_after_command;
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown == 0 {
            self.publish_state().await?;
            self.countdown = self.timing.publish_every;
        }
        tokio::time::sleep(*self.timing.tick).await;
        Ok(())
    }

    async fn apply(&mut self, command: &PendingCommand) -> Result<(), CommandError> {
        let payload = command.payload.trim();
        match command.kind {
            CommandKind::SetFanMode => {
                let mode = payload
                    .parse::<FanMode>()
                    .map_err(|_| CommandError::UnknownFanMode(payload.to_string()))?;
                info!(mode = mode.label(), "setting fan mode");
                self.gateway.set_fan_mode(mode).await.map_err(CommandError::Write)
            }
            CommandKind::SetTemperature => {
                let temperature = payload
                    .parse::<f64>()
                    .ok()
                    .filter(|t| t.is_finite())
                    .ok_or_else(|| CommandError::InvalidTemperature(payload.to_string()))?;
                info!(temperature, "setting temperature");
                self.gateway.set_temperature(temperature).await.map_err(CommandError::Write)
            }
            CommandKind::ResetAlarms => {
                // The register map has no known alarm reset register.
                info!("clearing all alarms");
                Ok(())
            }
        }
    }

    async fn publish_state(&mut self) -> Result<(), Disruption> {
        self.gateway.read_cycle().await?;
        let views = self.projector.project(self.gateway.tables());
        let messages = [
            (&self.topics.settings, serde_json::to_vec(&views.settings)?),
            (&self.topics.status, serde_json::to_vec(&views.status)?),
            (&self.topics.sensors, serde_json::to_vec(&views.sensors)?),
            (&self.topics.alarms, serde_json::to_vec(&views.alarms)?),
        ];
        for (topic, payload) in messages {
            self.bus.publish(topic, payload).await?;
        }
        debug!("published device state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBus, FakeDevice};
    use crate::registers::{FAN_MODE_REGISTER, TEMPERATURE_SETPOINT_REGISTER};
    use std::time::Duration;

    fn bridge(bus: FakeBus) -> (Bridge<FakeDevice, FakeBus>, mpsc::UnboundedSender<PendingCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let gateway = DeviceGateway::new(FakeDevice::with_catalog(), 1);
        let bridge = Bridge::new(gateway, bus, Topics::new("swegon"), receiver, Timing::default());
        (bridge, sender)
    }

    async fn connect(bridge: &mut Bridge<FakeDevice, FakeBus>) {
        bridge.tick().await;
        assert_eq!(bridge.state(), ConnectionState::Connecting);
        bridge.tick().await;
        assert_eq!(bridge.state(), ConnectionState::Connected);
    }

    fn command(kind: CommandKind, payload: &str) -> PendingCommand {
        PendingCommand { kind, payload: payload.to_string() }
    }

    #[tokio::test(start_paused = true)]
    async fn connects_subscribes_and_publishes() {
        let (mut bridge, _sender) = bridge(FakeBus::reachable());
        connect(&mut bridge).await;
        assert_eq!(
            bridge.bus_mut().subscriptions,
            vec!["swegon/fan/set", "swegon/temp/set", "swegon/alarms/reset"]
        );
        bridge.tick().await;
        let bus = bridge.bus_mut();
        let topics = bus.published.iter().map(|(t, _)| t.as_str()).collect::<Vec<_>>();
        assert_eq!(
            topics,
            vec![
                "swegon/settings/sensor",
                "swegon/status/sensor",
                "swegon/sensors/sensor",
                "swegon/alarms/sensor"
            ]
        );
        let status = bus.last("swegon/status/sensor").unwrap();
        assert_eq!(status["Mode"], "Home");
        assert_eq!(status["Operating Mode"], 2);
        assert_eq!(bus.last("swegon/sensors/sensor").unwrap()["Supply air temperature"], 18.2);
        assert_eq!(bus.last("swegon/alarms/sensor").unwrap()["Alarms"], "None");
        assert_eq!(bus.last("swegon/settings/sensor").unwrap()["Temperature setpoint"], 20);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_publish_cadence() {
        let (mut bridge, _sender) = bridge(FakeBus::reachable());
        connect(&mut bridge).await;
        for _ in 0..31 {
            bridge.tick().await;
        }
        // Immediately, then after 15 and 30 more ticks.
        assert_eq!(bridge.bus_mut().payloads("swegon/status/sensor").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_applied_in_order_and_published() {
        let (mut bridge, sender) = bridge(FakeBus::reachable());
        sender.send(command(CommandKind::SetTemperature, "21")).unwrap();
        sender.send(command(CommandKind::SetFanMode, "Boost")).unwrap();
        connect(&mut bridge).await;
        bridge.tick().await;

        let device = bridge.gateway_mut().transport_mut();
        let writes = device
            .log
            .iter()
            .filter(|op| matches!(op, crate::modbus::Operation::WriteHolding { .. }))
            .copied()
            .collect::<Vec<_>>();
        assert_eq!(
            writes,
            vec![
                crate::modbus::Operation::WriteHolding { address: 5100, value: 21 },
                crate::modbus::Operation::WriteHolding { address: 5000, value: 3 },
            ]
        );
        assert_eq!(device.get(TEMPERATURE_SETPOINT_REGISTER), Some(21));
        assert_eq!(device.get(FAN_MODE_REGISTER), Some(3));

        let bus = bridge.bus_mut();
        assert_eq!(bus.last("swegon/status/sensor").unwrap()["Mode"], "Boost");
        assert_eq!(bus.last("swegon/settings/sensor").unwrap()["Temperature setpoint"], 21);
        // One publish after each command; the periodic one is postponed.
        assert_eq!(bus.payloads("swegon/status/sensor").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn quick_refresh_after_command() {
        let (mut bridge, sender) = bridge(FakeBus::reachable());
        connect(&mut bridge).await;
        bridge.tick().await;
        sender.send(command(CommandKind::SetFanMode, "Away")).unwrap();
        bridge.tick().await;
        assert_eq!(bridge.bus_mut().payloads("swegon/status/sensor").len(), 2);
        for _ in 0..3 {
            bridge.tick().await;
        }
        assert_eq!(bridge.bus_mut().payloads("swegon/status/sensor").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_commands_are_dropped() {
        let (mut bridge, sender) = bridge(FakeBus::reachable());
        connect(&mut bridge).await;
        bridge.tick().await;
        sender.send(command(CommandKind::SetFanMode, "Turbo")).unwrap();
        sender.send(command(CommandKind::SetTemperature, "warm")).unwrap();
        sender.send(command(CommandKind::SetTemperature, "NaN")).unwrap();
        sender.send(command(CommandKind::SetTemperature, "99999")).unwrap();
        bridge.tick().await;
        assert_eq!(bridge.state(), ConnectionState::Connected);
        let device = bridge.gateway_mut().transport_mut();
        assert!(!device.log.iter().any(|op| matches!(op, crate::modbus::Operation::WriteHolding { .. })));
        assert_eq!(bridge.bus_mut().payloads("swegon/status/sensor").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn alarm_reset_writes_nothing_but_refreshes() {
        let (mut bridge, sender) = bridge(FakeBus::reachable());
        connect(&mut bridge).await;
        bridge.tick().await;
        let reads_before = bridge.gateway_mut().transport_mut().log.len();
        sender.send(command(CommandKind::ResetAlarms, "")).unwrap();
        bridge.tick().await;
        let device = bridge.gateway_mut().transport_mut();
        assert!(device.log[reads_before..].iter().all(|op| matches!(op, crate::modbus::Operation::Read { .. })));
        assert_eq!(bridge.bus_mut().payloads("swegon/alarms/sensor").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_is_retried() {
        let (mut bridge, _sender) = bridge(FakeBus::default());
        bridge.tick().await;
        for _ in 0..3 {
            bridge.tick().await;
            assert_eq!(bridge.state(), ConnectionState::Connecting);
        }
        assert_eq!(bridge.bus_mut().connect_attempts, 3);
        bridge.bus_mut().reachable = true;
        bridge.tick().await;
        assert_eq!(bridge.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn device_failure_disconnects_without_partial_publish() {
        let (mut bridge, _sender) = bridge(FakeBus::reachable());
        connect(&mut bridge).await;
        bridge.tick().await;
        let published = bridge.bus_mut().published.len();

        bridge.gateway_mut().transport_mut().set(6203, 300);
        // Fail the alarms table on every attempt, after status and sensors were read.
        bridge.gateway_mut().transport_mut().fail_address = Some(6131);
        for _ in 0..15 {
            bridge.tick().await;
        }
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
        assert_eq!(bridge.bus_mut().published.len(), published);

        bridge.gateway_mut().transport_mut().fail_address = None;
        connect(&mut bridge).await;
        bridge.tick().await;
        let bus = bridge.bus_mut();
        assert_eq!(bus.published.len(), published + 4);
        assert_eq!(bus.last("swegon/sensors/sensor").unwrap()["Supply air temperature"], 30.0);
        assert_eq!(bus.last("swegon/status/sensor").unwrap()["Mode"], "Home");
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_device_backs_off() {
        let (mut bridge, _sender) = bridge(FakeBus::reachable());
        connect(&mut bridge).await;
        bridge.gateway_mut().transport_mut().failures = usize::MAX;
        let start = tokio::time::Instant::now();
        // Each round: failed publish, Disconnected to Connecting, reconnect.
        for _ in 0..30 {
            bridge.tick().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(50));
        assert_eq!(bridge.bus_mut().connect_attempts, 11);
        assert_eq!(bridge.bus_mut().subscriptions.len(), 33);
        assert_eq!(bridge.gateway_mut().transport_mut().log.len(), 20);
        assert!(bridge.bus_mut().published.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn commands_survive_bus_outage() {
        let (mut bridge, sender) = bridge(FakeBus::reachable());
        connect(&mut bridge).await;
        bridge.tick().await;
        bridge.bus_mut().disrupt();
        sender.send(command(CommandKind::SetFanMode, "Travelling")).unwrap();
        bridge.tick().await;
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
        bridge.tick().await;
        bridge.tick().await;
        assert_eq!(bridge.state(), ConnectionState::Connecting);
        assert_eq!(bridge.gateway_mut().transport_mut().get(FAN_MODE_REGISTER), Some(2));

        bridge.bus_mut().reachable = true;
        bridge.tick().await;
        assert_eq!(bridge.state(), ConnectionState::Connected);
        bridge.tick().await;
        assert_eq!(bridge.gateway_mut().transport_mut().get(FAN_MODE_REGISTER), Some(4));
        assert_eq!(bridge.bus_mut().last("swegon/status/sensor").unwrap()["Mode"], "Travelling");
        // Subscriptions are made again for the new session.
        assert_eq!(bridge.bus_mut().subscriptions.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn registration_is_published_once() {
        let (bridge, _sender) = bridge(FakeBus::reachable());
        let mut bridge = bridge.with_registration(vec![("ha/config".to_string(), b"{}".to_vec())]);
        connect(&mut bridge).await;
        bridge.bus_mut().disrupt();
        bridge.tick().await;
        bridge.bus_mut().reachable = true;
        connect(&mut bridge).await;
        let count = bridge.bus_mut().published.iter().filter(|(t, _)| t == "ha/config").count();
        assert_eq!(count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (mut bridge, sender) = bridge(FakeBus::reachable());
        bridge.run(tokio::time::sleep(Duration::from_secs(60))).await.unwrap();
        assert!(bridge.bus_mut().closed);
        assert!(!bridge.bus_mut().published.is_empty());
        assert!(sender.send(command(CommandKind::ResetAlarms, "")).is_err());
    }
}

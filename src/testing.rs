//! In-memory stand-ins for the device and the message bus.

use crate::connection::{self, Transport};
use crate::modbus::{Operation, Response, ResponseKind};
use crate::mqtt::{self, Bus};
use crate::registers;
use std::collections::BTreeMap;
use std::time::Duration;

/// A ventilation unit keeping its registers in a map keyed by catalog address.
pub struct FakeDevice {
    registers: BTreeMap<u16, u16>,
    /// Every operation received, including failed ones.
    pub log: Vec<Operation>,
    /// Number of upcoming operations to fail with a timeout.
    pub failures: usize,
    /// Fail every operation touching this protocol address.
    pub fail_address: Option<u16>,
    /// Acknowledge writes with a value other than the one written.
    pub corrupt_echo: bool,
}

impl FakeDevice {
    pub fn with_catalog() -> Self {
        let mut map = BTreeMap::new();
        for (_, def) in registers::all_registers() {
            map.insert(def.address, 0);
        }
        let mut device = Self {
            registers: map,
            log: Vec::new(),
            failures: 0,
            fail_address: None,
            corrupt_echo: false,
        };
        for (offset, address) in (6201..=6211).enumerate() {
            device.set(address, 180 + offset as u16);
        }
        device.set(6212, 612);
        device.set(6213, 598);
        device.set(6214, 41);
        device.set(registers::FAN_MODE_REGISTER, 2);
        device.set(registers::TEMPERATURE_SETPOINT_REGISTER, 20);
        device
    }

    pub fn set(&mut self, address: u16, raw: u16) {
        self.registers.insert(address, raw);
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        self.registers.get(&address).copied()
    }

    pub fn remove(&mut self, address: u16) {
        self.registers.remove(&address);
    }
}

impl Transport for FakeDevice {
    async fn call(&mut self, operation: Operation) -> Result<Response, connection::Error> {
        self.log.push(operation);
        let wire_address = match operation {
            Operation::Read { address, .. } | Operation::WriteHolding { address, .. } => address,
        };
        if self.failures > 0 || self.fail_address == Some(wire_address) {
            self.failures = self.failures.saturating_sub(1);
            return Err(connection::Error::Timeout(Duration::from_secs(1)));
        }
        let kind = match operation {
            Operation::Read { address, count, .. } => {
                let mut values = Vec::new();
                let mut missing = false;
                for catalog_address in address + 1..=address + count {
                    match self.get(catalog_address) {
                        Some(v) => values.extend(v.to_be_bytes()),
                        None => missing = true,
                    }
                }
                if missing { ResponseKind::ErrorCode(2) } else { ResponseKind::Registers { values } }
            }
            Operation::WriteHolding { address, value } => {
                self.set(address + 1, value);
                let value = if self.corrupt_echo { value.wrapping_add(1) } else { value };
                ResponseKind::WroteHolding { address, value }
            }
        };
        Ok(Response { device_id: 1, transaction_id: 0, kind })
    }
}

/// A broker that accepts everything while reachable and records what was published.
#[derive(Default)]
pub struct FakeBus {
    pub reachable: bool,
    pub connected: bool,
    pub connect_attempts: usize,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub closed: bool,
}

impl FakeBus {
    pub fn reachable() -> Self {
        Self { reachable: true, ..Default::default() }
    }

    /// Drop the link, as if the broker went away.
    pub fn disrupt(&mut self) {
        self.reachable = false;
        self.connected = false;
    }

    /// The payloads published to a topic, oldest first.
    pub fn payloads(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| serde_json::from_slice(p).expect("published payloads are JSON"))
            .collect()
    }

    pub fn last(&self, topic: &str) -> Option<serde_json::Value> {
        self.payloads(topic).pop()
    }
}

impl Bus for FakeBus {
    async fn connect(&mut self) -> Result<(), mqtt::Error> {
        self.connect_attempts += 1;
        self.connected = self.reachable;
        if self.connected { Ok(()) } else { Err(mqtt::Error::ConnectTimeout(Duration::from_secs(5))) }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), mqtt::Error> {
        if !self.connected {
            return Err(mqtt::Error::NotConnected);
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), mqtt::Error> {
        if !self.connected {
            return Err(mqtt::Error::NotConnected);
        }
        self.published.push((topic.to_string(), payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> Result<(), mqtt::Error> {
        self.connected = false;
        self.closed = true;
        Ok(())
    }
}

//! Reading and writing the catalog registers through a [`Transport`].

use crate::connection::{self, Transport};
use crate::modbus::{MAX_SAFE_READ_COUNT, Operation, ResponseKind};
use crate::registers::{
    AccessKind, FAN_MODE_REGISTER, FanMode, RegisterTable, TEMPERATURE_SETPOINT_REGISTER, Tables,
    Value,
};
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("modbus transport failed")]
    Transport(#[source] connection::Error),
    #[error("device responded to {0:?} with exception code {1}")]
    Exception(Operation, u8),
    #[error("device response does not match the request {0:?}")]
    Malformed(Operation),
    #[error("{value} cannot be stored in register {address} with {decimals} decimals")]
    OutOfRange { address: u16, value: f64, decimals: u8 },
    #[error("register address {0} is not valid, addresses start at 1")]
    InvalidAddress(u16),
    #[error("reading the registers failed {0} times in a row")]
    ReadCycle(usize, #[source] Box<Error>),
}

impl Error {
    /// Whether the error indicates the link to the device is unhealthy, as opposed to the device
    /// refusing a particular request.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Malformed(_) | Error::ReadCycle(..) => true,
            Error::Exception(..) | Error::OutOfRange { .. } | Error::InvalidAddress(_) => false,
        }
    }
}

/// A register whose value differs from the one known before the read.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub address: u16,
    pub name: &'static str,
    pub value: Value,
}

fn wire_address(address: u16) -> Result<u16, Error> {
    address.checked_sub(1).ok_or(Error::InvalidAddress(address))
}

async fn read_words<T: Transport>(
    transport: &mut T,
    access: AccessKind,
    address: u16,
    count: u16,
) -> Result<Vec<u16>, Error> {
    let operation = Operation::Read { access, address: wire_address(address)?, count };
    let response = transport.call(operation).await.map_err(Error::Transport)?;
    match response.kind {
        ResponseKind::Registers { values } if values.len() == 2 * usize::from(count) => {
            Ok(ResponseKind::words(&values).collect())
        }
        ResponseKind::ErrorCode(code) => Err(Error::Exception(operation, code)),
        _ => Err(Error::Malformed(operation)),
    }
}

/// Read out every register of the table, recording the values into the table's entries.
///
/// Tables with one register per address are read with a single request, others register by
/// register. Both produce the same decoded values.
pub async fn read_table<T: Transport>(
    transport: &mut T,
    table: &mut RegisterTable,
) -> Result<Vec<Change>, Error> {
    let raw = if table.is_contiguous() && table.span() <= MAX_SAFE_READ_COUNT {
        read_words(transport, table.access(), table.first_address(), table.span()).await?
    } else {
        let mut raw = Vec::with_capacity(table.entries().len());
        for entry in table.entries() {
            let words = read_words(transport, entry.access, entry.address, 1).await?;
            raw.extend(words);
        }
        raw
    };
    let mut changes = Vec::new();
    for (entry, word) in table.entries_mut().iter_mut().zip(raw) {
        if let Some(value) = entry.record(word) {
            changes.push(Change { address: entry.address, name: entry.name, value });
        }
    }
    Ok(changes)
}

async fn read_all<T: Transport>(transport: &mut T, tables: &mut Tables) -> Result<Vec<Change>, Error> {
    let mut changes = Vec::new();
    for table in tables.iter_mut() {
        changes.extend(read_table(transport, table).await?);
    }
    Ok(changes)
}

pub struct DeviceGateway<T> {
    transport: T,
    tables: Tables,
    read_retries: usize,
}

impl<T: Transport> DeviceGateway<T> {
    pub fn new(transport: T, read_retries: usize) -> Self {
        Self { transport, tables: Tables::from_catalog(), read_retries }
    }

    /// The register values as of the last successful read cycle.
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Read all four tables.
    ///
    /// The tables are only updated if every read succeeds; otherwise the whole cycle is
    /// re-run, up to the configured number of retries.
    pub async fn read_cycle(&mut self) -> Result<Vec<Change>, Error> {
        let mut failures = 0;
        loop {
            let mut staging = self.tables.clone();
            let result = read_all(&mut self.transport, &mut staging).await;
            match result {
                Ok(changes) => {
                    for change in &changes {
                        debug!(
                            register.address = change.address,
                            register.name = change.name,
                            value = %change.value,
                            "read changed value"
                        );
                    }
                    self.tables = staging;
                    return Ok(changes);
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.read_retries {
                        return Err(Error::ReadCycle(failures, Box::new(e)));
                    }
                    warn!(
                        message = "reading registers failed, re-running data reading",
                        failures,
                        error = (&e as &dyn std::error::Error)
                    );
                }
            }
        }
    }

    /// Write a signed, fixed-point value to a holding register.
    pub async fn write(&mut self, address: u16, value: f64, decimals: u8) -> Result<(), Error> {
        let wire = wire_address(address)?;
        let scaled = (value * 10f64.powi(i32::from(decimals))).round_ties_even();
        if !(f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&scaled) {
            return Err(Error::OutOfRange { address, value, decimals });
        }
        let operation = Operation::WriteHolding { address: wire, value: scaled as i16 as u16 };
        let response = self.transport.call(operation).await.map_err(Error::Transport)?;
        match response.kind {
            ResponseKind::WroteHolding { address: echoed, value: raw }
                if operation == (Operation::WriteHolding { address: echoed, value: raw }) =>
            {
                info!(register.address = address, value, "wrote register");
                Ok(())
            }
            ResponseKind::ErrorCode(code) => Err(Error::Exception(operation, code)),
            ResponseKind::Registers { .. } | ResponseKind::WroteHolding { .. } => {
                Err(Error::Malformed(operation))
            }
        }
    }

    pub async fn set_fan_mode(&mut self, mode: FanMode) -> Result<(), Error> {
        self.write(FAN_MODE_REGISTER, f64::from(mode as u8), 0).await
    }

    /// Set the temperature setpoint, rounded to a whole degree with ties going to even.
    pub async fn set_temperature(&mut self, temperature: f64) -> Result<(), Error> {
        self.write(TEMPERATURE_SETPOINT_REGISTER, temperature, 0).await
    }
}

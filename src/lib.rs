pub mod bridge;
pub mod commands;
pub mod connection;
pub mod discovery;
pub mod gateway;
pub mod modbus;
pub mod mqtt;
pub mod output;
pub mod projector;
pub mod registers;

#[cfg(test)]
mod testing;

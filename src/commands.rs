fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

pub mod registers {
    use crate::output;
    use crate::registers::{AccessKind, RegisterDefinition, TableKind, Value, all_registers};

    /// Search and output the registers the bridge reads and writes.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list registers whose name, table or address contains this text.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the register list")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub address: u16,
        pub table: TableKind,
        pub name: &'static str,
        pub access: AccessKind,
        pub decimals: u8,
        pub default: Value,
    }

    impl RegisterSchema {
        fn new(table: TableKind, def: &RegisterDefinition) -> Self {
            Self {
                address: def.address,
                table,
                name: def.name,
                access: def.access,
                decimals: def.decimals,
                default: Value::scaled(i32::from(def.default), def.decimals),
            }
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.name.to_lowercase().contains(&pattern)
                || <&str>::from(self.table).contains(&pattern)
                || self.address.to_string().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.open()?;
        output.header(&["Address", "Table", "Name", "Access", "Decimals", "Default"])?;
        for (table, def) in all_registers() {
            let register = RegisterSchema::new(table, def);
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output.row(
                || {
                    vec![
                        register.address.to_string(),
                        <&str>::from(register.table).to_string(),
                        register.name.to_string(),
                        register.access.to_string(),
                        register.decimals.to_string(),
                        register.default.to_string(),
                    ]
                },
                || &register,
            )?;
        }
        Ok(output.finish()?)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn filter_matches_name_table_and_address() {
            let all = all_registers().map(|(t, d)| RegisterSchema::new(t, d)).collect::<Vec<_>>();
            let count = |pattern: &str| all.iter().filter(|r| r.is_match(pattern)).count();
            assert_eq!(count("temperature"), 12);
            assert_eq!(count("SENSORS"), 14);
            assert_eq!(count("5001"), 1);
            assert_eq!(count("alarm"), 1);
            assert_eq!(count("nothing like this"), 0);
        }

        #[test]
        fn schema_serializes_scaled_defaults() {
            let schema = RegisterSchema::new(TableKind::Sensors, &crate::registers::SENSORS[0]);
            assert_eq!(
                serde_json::to_value(&schema).unwrap(),
                serde_json::json!({
                    "address": 6201,
                    "table": "sensors",
                    "name": "Fresh Air Temperature",
                    "access": "input",
                    "decimals": 1,
                    "default": -55.0,
                })
            );
        }
    }
}

pub mod read {
    use crate::connection::{self, Connection};
    use crate::gateway::{self, DeviceGateway};
    use crate::output;
    use crate::projector::{Field, StateProjector};

    /// Read all registers once and print the views the bridge would publish.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// How many times a failed read cycle is re-run.
        #[arg(long, default_value = "3")]
        read_retries: usize,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not read the device registers")]
        Read(#[from] gateway::Error),
        #[error("could not output the values")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        topic: &'static str,
        key: &'a str,
        value: &'a Field,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let mut gateway = DeviceGateway::new(Connection::new(args.connection), args.read_retries);
        runtime.block_on(gateway.read_cycle())?;
        let views = StateProjector::new().project(gateway.tables());
        let sensors = views
            .sensors
            .0
            .iter()
            .map(|(name, value)| (*name, Field::Value(*value)))
            .collect::<Vec<_>>();
        let sections = [
            ("settings", views.settings.into_iter().collect::<Vec<_>>()),
            ("status", views.status.into_iter().collect()),
            ("sensors", sensors),
            ("alarms", views.alarms.into_iter().collect()),
        ];

        let mut output = args.output.open()?;
        output.header(&["Topic", "Key", "Value"])?;
        for (topic, fields) in &sections {
            for (key, value) in fields {
                output.row(
                    || {
                        let value = match value {
                            Field::Value(v) => v.to_string(),
                            Field::Text(t) => t.clone(),
                        };
                        vec![topic.to_string(), key.to_string(), value]
                    },
                    || Record { topic: *topic, key, value },
                )?;
            }
        }
        Ok(output.finish()?)
    }
}

pub mod bridge {
    use crate::bridge::{self, Bridge};
    use crate::connection::{self, Connection};
    use crate::discovery;
    use crate::gateway::DeviceGateway;
    use crate::mqtt::{self, MqttBus, Topics};
    use tokio::sync::mpsc;
    use tracing::info;

    /// Run the Modbus to MQTT bridge until interrupted.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        mqtt: mqtt::Args,
        #[clap(flatten)]
        timing: bridge::Timing,
        /// Topic prefix Home Assistant listens to for discovery messages.
        #[arg(long, default_value = "homeassistant")]
        discovery_prefix: String,
        /// Do not announce the entities for Home Assistant discovery.
        #[arg(long)]
        no_discovery: bool,
        /// Consider the published sensors unavailable when not refreshed for this long.
        #[arg(long, default_value = "80m")]
        expire_after: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not serialize the discovery messages")]
        Discovery(#[source] serde_json::Error),
        #[error("could not disconnect from the broker cleanly")]
        Close(#[source] mqtt::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        runtime.block_on(async move {
            let topics = Topics::new(&args.mqtt.topic_base);
            let (sender, receiver) = mpsc::unbounded_channel();
            let bus = MqttBus::new(&args.mqtt, topics.clone(), sender);
            let gateway = DeviceGateway::new(Connection::new(args.connection), args.timing.read_retries);
            let registration = if args.no_discovery {
                None
            } else {
                let messages =
                    discovery::registration_messages(&args.discovery_prefix, &topics, *args.expire_after)
                        .map_err(Error::Discovery)?;
                Some(messages)
            };
            let mut bridge = Bridge::new(gateway, bus, topics, receiver, args.timing);
            if let Some(messages) = registration {
                bridge = bridge.with_registration(messages);
            }
            bridge
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(
                            message = "cannot listen for interrupts, running until killed",
                            error = (&e as &dyn std::error::Error)
                        );
                        std::future::pending::<()>().await;
                    }
                    info!("interrupted");
                })
                .await
                .map_err(Error::Close)
        })
    }
}

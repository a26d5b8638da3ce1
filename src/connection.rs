use crate::modbus::{self, AnyCodec, ModbusRTUCodec, ModbusTCPCodec, Operation, Request, Response};
use futures::{SinkExt as _, StreamExt as _};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt as _;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("could not open {1:?} as a serial port")]
    OpenDevice(#[source] tokio_serial::Error, PathBuf),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the device closed the connection")]
    Closed,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("the device stayed busy after {0} attempts")]
    ServerBusy(usize),
}

/// Something that can carry one modbus operation at a time to the device.
pub trait Transport {
    /// Perform the operation and wait for the matching response.
    ///
    /// Exception responses other than "server busy" are returned as responses, not errors.
    async fn call(&mut self, operation: Operation) -> Result<Response, Error>;
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    #[clap(flatten)]
    how: ConnectionGroup,

    /// The modbus device ID.
    #[arg(long, short = 'i', default_value = "1")]
    device_id: u8,

    /// If the modbus response isn't received in this amount of time, consider the request failed
    /// and drop the link to the device.
    #[arg(long, default_value = "1s")]
    read_timeout: humantime::Duration,

    /// The baudrate of the serial line when talking Modbus RTU.
    #[arg(long, default_value = "38400")]
    baudrate: u32,

    /// The amount of time to wait after receiving a server busy exception.
    ///
    /// When busy, modbus proxies can respond with an exception code 6. Give the device
    /// this amount of time to finish its current work before retrying.
    #[arg(long, default_value = "25ms")]
    server_busy_retry_delay: humantime::Duration,

    /// How many times to retry a request the device reports to be busy with.
    #[arg(long, default_value = "3")]
    server_busy_retries: usize,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(required = true, multiple = false)]
pub struct ConnectionGroup {
    /// Connect to the ventilation unit over Modbus TCP (`host:port`).
    #[arg(long)]
    tcp: Option<String>,
    /// Connect to the ventilation unit over Serial Modbus RTU.
    ///
    /// Specify the path to the serial device.
    #[arg(long)]
    rtu: Option<PathBuf>,
}

trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

type Io = Framed<Box<dyn AsyncIo>, AnyCodec>;

/// A link to the device, established on first use and re-established after any failure.
pub struct Connection {
    io: Option<Io>,
    transaction_id: u16,
    args: Args,
}

impl Connection {
    pub fn new(args: Args) -> Connection {
        Self { io: None, transaction_id: 0, args }
    }

    fn new_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    async fn connect(&self) -> Result<Io, Error> {
        if let Some(address) = &self.args.how.tcp {
            info!(message = "connecting...", address);
            let addresses = tokio::net::lookup_host(address)
                .await
                .map_err(|e| Error::LookupHost(e, address.to_string()))?
                .collect::<Vec<_>>();
            debug!(message = "resolved", ?addresses);
            let socket = TcpStream::connect(&*addresses)
                .await
                .map_err(|e| Error::Connect(e, address.to_string()))?;
            let nodelay_result = socket.set_nodelay(true);
            trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
            info!(message = "connected");
            return Ok(Framed::new(Box::new(socket) as Box<dyn AsyncIo>, AnyCodec::Tcp(ModbusTCPCodec {})));
        }
        let path = self.args.how.rtu.clone().unwrap_or_default();
        info!(message = "opening serial port...", ?path, baudrate = self.args.baudrate);
        let port = tokio_serial::new(path.to_string_lossy(), self.args.baudrate)
            .open_native_async()
            .map_err(|e| Error::OpenDevice(e, path.clone()))?;
        info!(message = "serial port open");
        Ok(Framed::new(Box::new(port) as Box<dyn AsyncIo>, AnyCodec::Rtu(ModbusRTUCodec::default())))
    }

    /// Send a single request and wait for its response, dropping the link on any failure.
    pub async fn send(&mut self, operation: Operation) -> Result<Response, Error> {
        let mut io = match self.io.take() {
            Some(io) => io,
            None => self.connect().await?,
        };
        let request =
            Request { device_id: self.args.device_id, transaction_id: self.new_transaction_id(), operation };
        match exchange(&mut io, &request, *self.args.read_timeout).await {
            Ok(response) => {
                self.io = Some(io);
                Ok(response)
            }
            Err(e) => {
                warn!(
                    message = "modbus request failed, will reconnect",
                    error = (&e as &dyn std::error::Error)
                );
                Err(e)
            }
        }
    }
}

async fn exchange(io: &mut Io, request: &Request, timeout: Duration) -> Result<Response, Error> {
    io.send(request).await.map_err(Error::Send)?;
    let deadline = Instant::now() + timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, io.next())
            .await
            .map_err(|_| Error::Timeout(timeout))?;
        let response = match next {
            None => return Err(Error::Closed),
            Some(response) => response.map_err(Error::Receive)?,
        };
        if response.transaction_id != request.transaction_id {
            debug!(
                message = "a response we were not expecting",
                transaction = response.transaction_id
            );
            continue;
        }
        return Ok(response);
    }
}

impl Transport for Connection {
    /// [`Connection::send`] but retries `Server Busy` exceptions.
    async fn call(&mut self, operation: Operation) -> Result<modbus::Response, Error> {
        let attempts = self.args.server_busy_retries + 1;
        for _ in 0..attempts {
            let response = self.send(operation).await?;
            if !response.is_server_busy() {
                return Ok(response);
            }
            tokio::time::sleep(*self.args.server_busy_retry_delay).await;
        }
        Err(Error::ServerBusy(attempts))
    }
}

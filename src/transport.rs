use std::io;
use std::time::Duration;

use log::debug;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use crate::error::*;

pub const DEFAULT_TCP_PORT: u16 = 2000;
pub const DEFAULT_BAUD: u32 = 38_400;

/// Anything the link layer can run over. Both transport variants produce
/// one of these, so nothing above this module knows which is in use.
pub trait RouterIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RouterIo for T {}

/// Where and how to reach the router.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportConfig {
    Tcp { host: String, port: u16 },
    /// RS-232/RS-422 at 8 data bits, 1 stop bit, even parity, no flow
    /// control. Only the baud rate is configurable.
    Serial { path: String, baud: u32 },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Tcp { .. } => "tcp",
            TransportConfig::Serial { .. } => "serial",
        }
    }

    pub fn endpoint(&self) -> String {
        match self {
            TransportConfig::Tcp { host, port } => format!("{}:{}", host, port),
            TransportConfig::Serial { path, .. } => path.clone(),
        }
    }

    /// Open the byte stream to the router. Exclusive: the router speaks to
    /// one controller at a time, and serial ports do not share.
    pub async fn open(&self) -> Result<Box<dyn RouterIo>, TransportError> {
        match self {
            TransportConfig::Tcp { host, port } => {
                debug!("Connecting to router at {}:{}", host, port);
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| classify_io(e.kind(), self.endpoint()))?;
                Ok(Box::new(stream))
            }
            TransportConfig::Serial { path, baud } => {
                debug!("Opening serial port {} at {} baud, 8E1", path, baud);
                let port = tokio_serial::new(path, *baud)
                    .data_bits(DataBits::Eight)
                    .stop_bits(StopBits::One)
                    .parity(Parity::Even)
                    .flow_control(FlowControl::None)
                    .timeout(Duration::from_millis(100))
                    .open_native_async()
                    .map_err(|e| classify_serial(e, path))?;
                Ok(Box::new(port))
            }
        }
    }
}

fn classify_io(kind: io::ErrorKind, endpoint: String) -> TransportError {
    match kind {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut => {
            TransportError::Unreachable(endpoint)
        }
        io::ErrorKind::PermissionDenied => TransportError::Permission(endpoint),
        io::ErrorKind::NotFound => TransportError::NotFound(endpoint),
        other => TransportError::Io(other),
    }
}

fn classify_serial(e: tokio_serial::Error, path: &str) -> TransportError {
    match e.kind {
        tokio_serial::ErrorKind::NoDevice => TransportError::NotFound(path.to_owned()),
        tokio_serial::ErrorKind::Io(kind) => classify_io(kind, path.to_owned()),
        _ => TransportError::Io(io::ErrorKind::Other),
    }
}

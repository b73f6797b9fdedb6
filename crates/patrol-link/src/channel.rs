use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::LinkError;

/// Opens the byte channel to the drive controller. Called again on every reconnect.
pub trait Connector: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn describe(&self) -> String;

    fn connect(&mut self) -> impl Future<Output = Result<Self::Io, LinkError>> + Send;
}

#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub port: String,
    pub baud: u32,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self { port: port.into(), baud }
    }
}

pub(crate) fn open_serial(port: &str, baud: u32) -> Result<SerialStream, LinkError> {
    tokio_serial::new(port, baud)
        .open_native_async()
        .map_err(|source| LinkError::Open { port: port.to_string(), baud, source })
}

impl Connector for SerialConnector {
    type Io = SerialStream;

    fn describe(&self) -> String {
        format!("{} @ {}", self.port, self.baud)
    }

    fn connect(&mut self) -> impl Future<Output = Result<SerialStream, LinkError>> + Send {
        let opened = open_serial(&self.port, self.baud);
        async move { opened }
    }
}

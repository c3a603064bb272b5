//! Serial link to the load.
//!
//! [`Transport`] owns an open byte stream and exposes the handful of primitives
//! the protocol engine needs: exact reads, CR LF terminated line reads, whole
//! frame writes and a best-effort drain of stale input. Every read and write
//! is bounded by a timeout; expiry surfaces as [`LoadError::Timeout`], which the
//! engine treats as fatal.
//!
//! Any `AsyncRead + AsyncWrite` stream can back a transport, so tests plug in
//! `tokio::io::duplex` halves instead of real hardware. Opening is abstracted
//! behind [`Connector`] for the same reason.

use crate::error::{LoadError, LoadResult};
use crate::protocol::{OutboundCommand, BAUD_RATE};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, trace};

/// Async byte stream usable as a serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased serial stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Per-connection link parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Read timeout for every read primitive.
    pub read_timeout: Duration,
    /// Write timeout for every write primitive.
    pub write_timeout: Duration,
    /// Pause after opening while the microcontroller resets.
    pub reset_delay: Duration,
    /// Assert DTR and RTS after opening (native USB boards need this).
    pub rts_dtr: bool,
}

impl LinkSettings {
    /// Time for a queued command to reach the device in the worst case.
    pub fn load_delay(&self) -> Duration {
        self.read_timeout + self.write_timeout
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(400),
            reset_delay: Duration::from_millis(300),
            rts_dtr: false,
        }
    }
}

/// An open serial link.
pub struct Transport {
    port: BufReader<DynSerial>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Wrap an already-open stream.
    pub fn new(port: DynSerial, settings: &LinkSettings) -> Self {
        Self {
            port: BufReader::new(port),
            read_timeout: settings.read_timeout,
            write_timeout: settings.write_timeout,
        }
    }

    /// Fill `buf` completely or fail.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> LoadResult<()> {
        let timeout = self.read_timeout;
        match tokio::time::timeout(timeout, self.port.read_exact(buf)).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(LoadError::Timeout {
                operation: "read",
                timeout,
            }),
        }
    }

    /// Read a single byte.
    pub async fn read_byte(&mut self) -> LoadResult<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    /// Read one text line and strip its CR LF terminator.
    pub async fn read_line(&mut self) -> LoadResult<String> {
        let timeout = self.read_timeout;
        let mut raw = Vec::new();
        let n = match tokio::time::timeout(timeout, self.port.read_until(b'\n', &mut raw)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(LoadError::Timeout {
                    operation: "read line",
                    timeout,
                })
            }
        };
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }

        while matches!(raw.last(), Some(b'\n' | b'\r')) {
            raw.pop();
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        trace!(%line, "read line");
        Ok(line)
    }

    /// Write all of `bytes` and flush.
    pub async fn write(&mut self, bytes: &[u8]) -> LoadResult<()> {
        let timeout = self.write_timeout;
        let port = self.port.get_mut();
        let write = async {
            port.write_all(bytes).await?;
            port.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(LoadError::Timeout {
                operation: "write",
                timeout,
            }),
        }
    }

    /// Frame and write one outbound command.
    pub async fn send(&mut self, command: &OutboundCommand) -> LoadResult<()> {
        let frame = command.encode();
        trace!(header = command.header(), len = frame.len(), "send");
        self.write(&frame).await
    }

    /// Discard buffered and pending input until the line has been quiet for
    /// `window`. Returns the number of bytes thrown away.
    pub async fn drain(&mut self, window: Duration) -> usize {
        let buffered = self.port.buffer().len();
        self.port.consume(buffered);
        let discarded = buffered + drain_input(self.port.get_mut(), window).await;
        if discarded > 0 {
            debug!(discarded, "drained stale input");
        }
        discarded
    }

    /// Shut the stream down. Errors are ignored; the port is going away.
    pub async fn close(mut self) {
        let _ = self.port.get_mut().shutdown().await;
    }
}

/// Read and discard until nothing arrives within `window`.
async fn drain_input<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let mut total = 0usize;
    loop {
        match tokio::time::timeout(window, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }
    total
}

/// Opens transports by port name.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open `port`, wait out the device reset and discard stale input.
    async fn open(&self, port: &str, settings: &LinkSettings) -> LoadResult<Transport>;
}

/// Opens real serial ports through `tokio-serial` at the fixed 500 kBd 8N1.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, port: &str, settings: &LinkSettings) -> LoadResult<Transport> {
        let stream = open_serial(port, settings.rts_dtr).await?;
        // Arduino boards reset when the port opens.
        tokio::time::sleep(settings.reset_delay).await;
        let mut transport = Transport::new(Box::new(stream), settings);
        transport.drain(Duration::from_millis(20)).await;
        Ok(transport)
    }
}

async fn open_serial(port: &str, rts_dtr: bool) -> LoadResult<tokio_serial::SerialStream> {
    use tokio_serial::{SerialPort, SerialPortBuilderExt};

    let path = port.to_string();
    tokio::task::spawn_blocking(move || -> LoadResult<tokio_serial::SerialStream> {
        let mut stream = tokio_serial::new(&path, BAUD_RATE)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        stream.write_data_terminal_ready(rts_dtr)?;
        stream.write_request_to_send(rts_dtr)?;
        Ok(stream)
    })
    .await?
}

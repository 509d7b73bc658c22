//! Messenger - byte I/O for one comm link
//!
//! A messenger owns the transport of one link. It opens lazily on the first
//! exchange, closes on I/O failure and reopens under a backoff gate. Multidrop
//! protocols share it between controllers; each property builds its own
//! drop-addressed frame on top of the plain byte surface.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

use crate::error::{CommError, Result};
use crate::reconnect::{ReconnectHelper, ReconnectPolicy};

/// Largest single read
const READ_CHUNK: usize = 2048;

/// Format bytes as space separated hex for frame logging
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Messenger trait
// ============================================================================

/// Byte-oriented transport surface of one comm link
#[async_trait]
pub trait Messenger: Send {
    /// Write one complete request frame
    async fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Append at least one received byte to `buf`, waiting up to the read timeout
    ///
    /// Returns the number of bytes appended. A closed stream is an end-of-input
    /// error, never a zero-length success.
    async fn recv(&mut self, buf: &mut BytesMut) -> Result<usize>;

    /// Discard any pending input
    async fn drain(&mut self);

    /// Close the transport; the next exchange reopens it
    async fn close(&mut self);

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);

    /// Delay before the transport may be reopened
    fn reopen_delay(&self) -> Option<Duration> {
        None
    }

    /// Receive until `buf` holds at least `n` bytes
    async fn recv_exact(&mut self, buf: &mut BytesMut, n: usize) -> Result<()> {
        while buf.len() < n {
            self.recv(buf).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Endpoint parsing
// ============================================================================

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: String,
}

/// Transport endpoint parsed from a link URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`
    Tcp(String),
    /// `udp://host:port`
    Udp(String),
    /// `serial:///dev/ttyS0?baud=9600&parity=none&data_bits=8&stop_bits=1`
    Serial(SerialSettings),
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(addr) = uri.strip_prefix("tcp://") {
            return Self::check_host_port(addr).map(|a| Endpoint::Tcp(a.to_string()));
        }
        if let Some(addr) = uri.strip_prefix("udp://") {
            return Self::check_host_port(addr).map(|a| Endpoint::Udp(a.to_string()));
        }
        if let Some(rest) = uri.strip_prefix("serial://") {
            let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
            if path.is_empty() {
                return Err(CommError::config(format!("Missing serial device in {uri}")));
            }
            let mut settings = SerialSettings {
                path: path.to_string(),
                baud_rate: 9600,
                data_bits: 8,
                stop_bits: 1,
                parity: "none".to_string(),
            };
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| CommError::config(format!("Bad serial option '{pair}'")))?;
                let bad = |_| CommError::config(format!("Bad value for {key}: {value}"));
                match key {
                    "baud" => settings.baud_rate = value.parse().map_err(bad)?,
                    "data_bits" => settings.data_bits = value.parse().map_err(bad)?,
                    "stop_bits" => settings.stop_bits = value.parse().map_err(bad)?,
                    "parity" => settings.parity = value.to_lowercase(),
                    _ => {
                        return Err(CommError::config(format!("Unknown serial option '{key}'")))
                    },
                }
            }
            return Ok(Endpoint::Serial(settings));
        }
        Err(CommError::config(format!("Unsupported link URI: {uri}")))
    }

    fn check_host_port(addr: &str) -> Result<&str> {
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(addr),
            _ => Err(CommError::config(format!("Expected host:port, got '{addr}'"))),
        }
    }
}

// ============================================================================
// Stream messenger
// ============================================================================

/// Open transport handle
#[derive(Debug)]
enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Serial(SerialStream),
}

/// Messenger over a TCP, UDP or serial transport
#[derive(Debug)]
pub struct StreamMessenger {
    name: String,
    endpoint: Endpoint,
    read_timeout: Duration,
    connect_timeout: Duration,
    transport: Option<Transport>,
    reconnect: ReconnectHelper,
}

impl StreamMessenger {
    pub fn new(name: impl Into<String>, uri: &str, read_timeout: Duration) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            endpoint: Endpoint::parse(uri)?,
            read_timeout,
            connect_timeout: Duration::from_secs(5),
            transport: None,
            reconnect: ReconnectHelper::new(ReconnectPolicy::default()),
        })
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = ReconnectHelper::new(policy);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    async fn open(&self) -> Result<Transport> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| CommError::timeout(format!("Connect to {addr} timed out")))??;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                Ok(Transport::Tcp(stream))
            },
            Endpoint::Udp(addr) => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(addr).await?;
                Ok(Transport::Udp(socket))
            },
            Endpoint::Serial(s) => {
                let parity = match s.parity.as_str() {
                    "even" => tokio_serial::Parity::Even,
                    "odd" => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };
                let data_bits = match s.data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };
                let stop_bits = match s.stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };
                let port = tokio_serial::new(&s.path, s.baud_rate)
                    .data_bits(data_bits)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .timeout(self.read_timeout)
                    .open_native_async()
                    .map_err(|e| CommError::io(format!("Failed to open {}: {e}", s.path)))?;
                Ok(Transport::Serial(port))
            },
        }
    }

    /// Open the transport if needed, honoring the reconnect backoff
    async fn ensure_open(&mut self) -> Result<&mut Transport> {
        if self.transport.is_none() {
            if let Some(wait) = self.reconnect.remaining_backoff() {
                return Err(CommError::not_connected(format!(
                    "{}: reopen backoff, {:?} left",
                    self.name, wait
                )));
            }
            self.reconnect.begin_attempt();
            match self.open().await {
                Ok(transport) => {
                    info!("Link {} opened: {:?}", self.name, self.endpoint);
                    self.reconnect.mark_connected();
                    self.transport = Some(transport);
                },
                Err(e) => {
                    self.reconnect.mark_failed(&e.to_string());
                    return Err(e);
                },
            }
        }
        self.transport
            .as_mut()
            .ok_or_else(|| CommError::not_connected("transport unavailable"))
    }
}

async fn read_some<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut BytesMut) -> Result<usize> {
    buf.reserve(READ_CHUNK);
    let n = stream.read_buf(buf).await?;
    if n == 0 {
        return Err(CommError::eof("stream closed by peer"));
    }
    Ok(n)
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &[u8]) -> Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

#[async_trait]
impl Messenger for StreamMessenger {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let name = self.name.clone();
        let transport = self.ensure_open().await?;
        let result = match transport {
            Transport::Tcp(stream) => write_frame(stream, frame).await,
            Transport::Serial(port) => write_frame(port, frame).await,
            Transport::Udp(socket) => socket.send(frame).await.map(|_| ()).map_err(Into::into),
        };
        match &result {
            Ok(()) => trace!(link = %name, "TX {}", hex_dump(frame)),
            Err(e) => warn!(link = %name, "TX failed: {}", e),
        }
        result
    }

    async fn recv(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let read_timeout = self.read_timeout;
        let name = self.name.clone();
        let start = buf.len();
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| CommError::not_connected(format!("{name}: receive before send")))?;
        let read = async {
            match transport {
                Transport::Tcp(stream) => read_some(stream, buf).await,
                Transport::Serial(port) => read_some(port, buf).await,
                Transport::Udp(socket) => {
                    let mut datagram = [0u8; READ_CHUNK];
                    let n = socket.recv(&mut datagram).await?;
                    buf.extend_from_slice(&datagram[..n]);
                    Ok(n)
                },
            }
        };
        let n = timeout(read_timeout, read)
            .await
            .map_err(|_| CommError::timeout(format!("{name}: no response in {read_timeout:?}")))??;
        trace!(link = %name, "RX {}", hex_dump(&buf[start..]));
        Ok(n)
    }

    async fn drain(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let mut scratch = BytesMut::new();
        // Short grace period; whatever arrives late belongs to the failed exchange
        let grace = Duration::from_millis(20);
        loop {
            let read = async {
                match transport {
                    Transport::Tcp(stream) => read_some(stream, &mut scratch).await,
                    Transport::Serial(port) => read_some(port, &mut scratch).await,
                    Transport::Udp(socket) => {
                        let mut datagram = [0u8; READ_CHUNK];
                        Ok(socket.recv(&mut datagram).await?)
                    },
                }
            };
            match timeout(grace, read).await {
                Ok(Ok(_)) if scratch.len() < 64 * 1024 => continue,
                _ => break,
            }
        }
        if !scratch.is_empty() {
            debug!(link = %self.name, "Drained {} bytes: {}", scratch.len(), hex_dump(&scratch));
        }
    }

    async fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Transport::Tcp(mut stream) = transport {
                let _ = stream.shutdown().await;
            }
            self.reconnect.mark_disconnected();
            info!(link = %self.name, "Link closed");
        }
    }

    fn timeout(&self) -> Duration {
        self.read_timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    fn reopen_delay(&self) -> Option<Duration> {
        self.reconnect.remaining_backoff()
    }
}

//! # Physical Channels and Connectors
//!
//! A [`Channel`] opens a byte stream (TCP, UDP or serial). A
//! [`ChannelConnector`] owns one open stream, runs a receive task that cuts
//! the inbound bytes into frames with a [`FrameSplitter`], and pairs frames
//! with outbound messages through a [`Controller`].
//!
//! ## Exchange
//!
//! 1. register the message with the controller (fails when saturated)
//! 2. wait for send permission (half duplex channels send one at a time)
//! 3. write the frame
//! 4. wait for the reply; on timeout the message is resent exactly once
//!
//! A connector is shared by every machine using the same physical link,
//! see [`ConnectionPool`].

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_serial::SerialStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ChannelSettings;
use crate::controller::Controller;
use crate::error::{FieldbusError, FieldbusResult};
use crate::logging::CallbackLogger;

/// Buffered inbound bytes without a complete frame are discarded past this size
pub const MAX_BUFFERED_BYTES: usize = 8192;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Something that can be opened into a byte stream
#[async_trait]
pub trait Channel: Send + Sync {
    async fn open(&self) -> FieldbusResult<(BoxedReader, BoxedWriter)>;

    /// Human readable endpoint, also used as the pool key
    fn describe(&self) -> String;
}

/// TCP client channel
#[derive(Debug, Clone)]
pub struct TcpChannel {
    address: String,
}

impl TcpChannel {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self { address: address.into() }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn open(&self) -> FieldbusResult<(BoxedReader, BoxedWriter)> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| FieldbusError::connection(format!("Failed to connect to {}: {}", self.address, e)))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// UDP channel bound to one remote endpoint
#[derive(Debug, Clone)]
pub struct UdpChannel {
    remote: String,
}

impl UdpChannel {
    pub fn new<S: Into<String>>(remote: S) -> Self {
        Self { remote: remote.into() }
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn open(&self) -> FieldbusResult<(BoxedReader, BoxedWriter)> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(&self.remote)
            .await
            .map_err(|e| FieldbusError::connection(format!("Failed to connect to {}: {}", self.remote, e)))?;
        let socket = Arc::new(socket);
        Ok((
            Box::new(UdpReader { socket: socket.clone() }),
            Box::new(UdpWriter { socket }),
        ))
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.remote)
    }
}

/// One datagram per read
struct UdpReader {
    socket: Arc<UdpSocket>,
}

impl AsyncRead for UdpReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

/// One datagram per write
struct UdpWriter {
    socket: Arc<UdpSocket>,
}

impl AsyncWrite for UdpWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Serial port channel (RS-232, RS-485)
#[derive(Debug, Clone)]
pub struct SerialChannel {
    port: String,
    settings: ChannelSettings,
}

impl SerialChannel {
    pub fn new<S: Into<String>>(port: S, settings: ChannelSettings) -> Self {
        Self {
            port: port.into(),
            settings,
        }
    }
}

#[async_trait]
impl Channel for SerialChannel {
    async fn open(&self) -> FieldbusResult<(BoxedReader, BoxedWriter)> {
        let builder = tokio_serial::new(&self.port, self.settings.baud_rate)
            .data_bits(self.settings.serial_data_bits())
            .stop_bits(self.settings.serial_stop_bits())
            .parity(self.settings.parity.into())
            .timeout(self.settings.timeout);
        let port = SerialStream::open(&builder)?;
        let (reader, writer) = tokio::io::split(port);
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.port, self.settings.baud_rate)
    }
}

/// Rule for cutting the inbound byte stream into frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSplitter {
    /// Big-endian u16 length at `offset`; the frame is `length + adjust` bytes
    LengthField { offset: usize, adjust: usize },
    /// Frames between an optional start byte and an end sequence
    Delimited { start: Option<u8>, end: Vec<u8> },
    /// Modbus RTU, length derived from the function code
    ModbusRtu,
    /// A frame ends when the line goes quiet
    Idle,
    /// Every read is one frame
    Datagram,
}

impl FrameSplitter {
    /// Modbus TCP: length at byte 4 counts everything after the first 6 bytes
    pub fn mbap() -> Self {
        FrameSplitter::LengthField { offset: 4, adjust: 6 }
    }

    /// ISO-on-TCP: TPKT length at byte 2 covers the whole frame
    pub fn tpkt() -> Self {
        FrameSplitter::LengthField { offset: 2, adjust: 0 }
    }

    /// Modbus ASCII: `:` ... CRLF
    pub fn modbus_ascii() -> Self {
        FrameSplitter::Delimited {
            start: Some(b':'),
            end: b"\r\n".to_vec(),
        }
    }

    /// HJ212: `##` ... CRLF
    pub fn hj212() -> Self {
        FrameSplitter::Delimited {
            start: Some(b'#'),
            end: b"\r\n".to_vec(),
        }
    }

    pub fn flushes_on_idle(&self) -> bool {
        matches!(self, FrameSplitter::Idle | FrameSplitter::ModbusRtu)
    }

    /// Take one complete frame off the front of `buf`
    pub fn next_frame(&self, buf: &mut BytesMut) -> Option<Vec<u8>> {
        if buf.is_empty() {
            return None;
        }
        match self {
            FrameSplitter::LengthField { offset, adjust } => {
                if buf.len() < offset + 2 {
                    return None;
                }
                let length = u16::from_be_bytes([buf[*offset], buf[offset + 1]]) as usize + adjust;
                if length < offset + 2 {
                    // nonsense header, hand over everything and let validation fail it
                    return Some(buf.split().to_vec());
                }
                (buf.len() >= length).then(|| buf.split_to(length).to_vec())
            }
            FrameSplitter::Delimited { start, end } => {
                if let Some(start) = start {
                    match buf.iter().position(|b| b == start) {
                        Some(pos) => buf.advance(pos),
                        None => {
                            buf.clear();
                            return None;
                        }
                    }
                }
                let pos = buf.windows(end.len()).position(|window| window == end.as_slice())?;
                Some(buf.split_to(pos + end.len()).to_vec())
            }
            FrameSplitter::ModbusRtu => {
                let length = rtu_frame_length(buf)?;
                (buf.len() >= length).then(|| buf.split_to(length).to_vec())
            }
            FrameSplitter::Idle => None,
            FrameSplitter::Datagram => Some(buf.split().to_vec()),
        }
    }
}

/// Expected length of a Modbus RTU reply, `None` until enough header is buffered
fn rtu_frame_length(buf: &[u8]) -> Option<usize> {
    let function = *buf.get(1)?;
    if function & 0x80 != 0 {
        return Some(5);
    }
    match function {
        0x01..=0x04 | 0x17 => buf.get(2).map(|count| 5 + *count as usize),
        0x05 | 0x06 | 0x0F | 0x10 => Some(8),
        // unknown function, wait for the line to go idle
        _ => None,
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    /// Messages sent a second time after a missing reply
    pub retries: u64,
    pub stale_frames: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Owner of one physical link shared by any number of machines
#[async_trait]
pub trait Connector: Send + Sync {
    /// Identity of the physical link
    fn connection_token(&self) -> String;

    /// Open the link if it is not open; true when connected afterwards
    async fn connect(&self, cancel: &CancellationToken) -> bool;

    async fn disconnect(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Send a framed message and wait for its reply
    ///
    /// `Ok(None)` means no reply arrived, after one resend, or that the
    /// channel never replies.
    async fn send_msg(&self, message: &[u8], cancel: &CancellationToken) -> FieldbusResult<Option<Vec<u8>>>;

    fn get_stats(&self) -> TransportStats;
}

struct Link {
    writer: BoxedWriter,
    shutdown: CancellationToken,
    reader: JoinHandle<()>,
}

/// [`Connector`] over any [`Channel`]
pub struct ChannelConnector {
    channel: Arc<dyn Channel>,
    controller: Arc<dyn Controller>,
    splitter: FrameSplitter,
    settings: ChannelSettings,
    logger: CallbackLogger,
    link: tokio::sync::Mutex<Option<Link>>,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<TransportStats>>,
}

impl ChannelConnector {
    pub fn new(
        channel: Arc<dyn Channel>,
        controller: Arc<dyn Controller>,
        splitter: FrameSplitter,
        settings: ChannelSettings,
        logger: CallbackLogger,
    ) -> Self {
        Self {
            channel,
            controller,
            splitter,
            settings,
            logger,
            link: tokio::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(TransportStats::default())),
        }
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    fn timeout_ms(&self) -> u64 {
        self.settings.timeout.as_millis() as u64
    }

    async fn write_frame(&self, message: &[u8]) -> FieldbusResult<()> {
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or_else(|| FieldbusError::connection(format!("{} is not connected", self.channel.describe())))?;

        let written = timeout(self.settings.timeout, async {
            link.writer.write_all(message).await?;
            link.writer.flush().await
        })
        .await;

        match written {
            Ok(Ok(())) => {
                let mut stats = self.stats.lock();
                stats.requests_sent += 1;
                stats.bytes_sent += message.len() as u64;
                drop(stats);
                if self.settings.packet_logging {
                    self.logger.log_frame(&self.channel.describe(), "send", message);
                }
                Ok(())
            }
            Ok(Err(e)) => {
                self.connected.store(false, Ordering::Release);
                self.stats.lock().errors += 1;
                Err(FieldbusError::io(format!("Failed to send request: {}", e)))
            }
            Err(_) => {
                self.connected.store(false, Ordering::Release);
                self.stats.lock().timeouts += 1;
                Err(FieldbusError::timeout("send request", self.timeout_ms()))
            }
        }
    }

    /// One attempt; `Ok(None)` when no reply arrived in time
    async fn exchange(&self, message: &[u8], cancel: &CancellationToken) -> FieldbusResult<Option<Vec<u8>>> {
        if !self.is_connected() {
            return Err(FieldbusError::connection(format!(
                "{} is not connected",
                self.channel.describe()
            )));
        }

        let def = self.controller.add_message(message).ok_or_else(|| {
            FieldbusError::saturated(format!(
                "{} has {} messages pending",
                self.channel.describe(),
                self.controller.pending_count()
            ))
        })?;

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                self.controller.force_remove_waiting_message(&def);
                return Err(FieldbusError::cancelled("wait for send permission"));
            }
            permit = timeout(self.settings.timeout, self.controller.acquire_send(&def)) => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.controller.force_remove_waiting_message(&def);
                    self.stats.lock().timeouts += 1;
                    return Err(FieldbusError::timeout("wait for send permission", self.timeout_ms()));
                }
            },
        };

        def.mark_sent();
        if let Err(e) = self.write_frame(message).await {
            self.controller.force_remove_waiting_message(&def);
            return Err(e);
        }

        if !self.controller.waits_for_reply() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.settings.no_response_sleep) => {}
            }
            self.controller.force_remove_waiting_message(&def);
            drop(permit);
            return Ok(None);
        }

        let reply = tokio::select! {
            _ = cancel.cancelled() => {
                self.controller.force_remove_waiting_message(&def);
                return Err(FieldbusError::cancelled("wait for reply"));
            }
            reply = timeout(self.settings.timeout, def.wait_reply()) => reply,
        };
        drop(permit);

        match reply {
            Ok(reply) => Ok(Some(reply)),
            Err(_) => {
                self.controller.force_remove_waiting_message(&def);
                self.stats.lock().timeouts += 1;
                debug!("{}: no reply within {}ms", self.channel.describe(), self.timeout_ms());
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    fn connection_token(&self) -> String {
        self.channel.describe()
    }

    async fn connect(&self, cancel: &CancellationToken) -> bool {
        let mut guard = self.link.lock().await;
        if guard.is_some() && self.is_connected() {
            return true;
        }
        if let Some(stale) = guard.take() {
            stale.shutdown.cancel();
        }

        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                self.logger.warn(&format!("connect to {} cancelled", self.channel.describe()));
                return false;
            }
            opened = timeout(self.settings.connect_timeout, self.channel.open()) => opened,
        };
        let (reader, writer) = match opened {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.logger.error(&format!("connect to {} failed: {}", self.channel.describe(), e));
                return false;
            }
            Err(_) => {
                self.logger.error(&format!(
                    "connect to {} timed out after {}ms",
                    self.channel.describe(),
                    self.settings.connect_timeout.as_millis()
                ));
                return false;
            }
        };

        let shutdown = CancellationToken::new();
        self.connected.store(true, Ordering::Release);
        let receiver = Receiver {
            name: self.channel.describe(),
            controller: self.controller.clone(),
            splitter: self.splitter.clone(),
            idle_gap: self.settings.frame_gap().max(Duration::from_millis(2)),
            connected: self.connected.clone(),
            stats: self.stats.clone(),
            logger: self.settings.packet_logging.then(|| self.logger.clone()),
        };
        let reader = tokio::spawn(receiver.run(reader, shutdown.clone()));
        *guard = Some(Link {
            writer,
            shutdown,
            reader,
        });
        self.logger.info(&format!("connected to {}", self.channel.describe()));
        true
    }

    async fn disconnect(&self) -> bool {
        let mut guard = self.link.lock().await;
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        if let Some(mut link) = guard.take() {
            link.shutdown.cancel();
            let _ = link.writer.shutdown().await;
            let _ = link.reader.await;
        }
        self.controller.clear();
        if was_connected {
            self.logger.info(&format!("disconnected from {}", self.channel.describe()));
        }
        true
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn send_msg(&self, message: &[u8], cancel: &CancellationToken) -> FieldbusResult<Option<Vec<u8>>> {
        let mut repeat = false;
        loop {
            match self.exchange(message, cancel).await? {
                Some(reply) => return Ok(Some(reply)),
                None if !self.controller.waits_for_reply() => return Ok(None),
                None if !repeat => {
                    repeat = true;
                    self.stats.lock().retries += 1;
                    self.logger
                        .warn(&format!("{}: no reply, sending again", self.channel.describe()));
                }
                None => return Ok(None),
            }
        }
    }

    fn get_stats(&self) -> TransportStats {
        let mut stats = self.stats.lock().clone();
        stats.stale_frames = self.controller.stale_frames();
        stats
    }
}

/// Receive task state
struct Receiver {
    name: String,
    controller: Arc<dyn Controller>,
    splitter: FrameSplitter,
    idle_gap: Duration,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<TransportStats>>,
    logger: Option<CallbackLogger>,
}

impl Receiver {
    async fn run(self, mut reader: BoxedReader, shutdown: CancellationToken) {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            buf.reserve(2048);
            let pending_idle = self.splitter.flushes_on_idle() && !buf.is_empty();
            let read = if pending_idle {
                let read = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    read = timeout(self.idle_gap, reader.read_buf(&mut buf)) => read,
                };
                match read {
                    Ok(read) => read,
                    Err(_) => {
                        // line went quiet
                        let frame = buf.split().to_vec();
                        self.deliver(frame);
                        continue;
                    }
                }
            } else {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    read = reader.read_buf(&mut buf) => read,
                }
            };

            match read {
                Ok(0) => {
                    debug!("{}: connection closed by peer", self.name);
                    break;
                }
                Ok(n) => {
                    self.stats.lock().bytes_received += n as u64;
                    while let Some(frame) = self.splitter.next_frame(&mut buf) {
                        self.deliver(frame);
                    }
                    if buf.len() > MAX_BUFFERED_BYTES {
                        warn!("{}: discarding {} unframed bytes", self.name, buf.len());
                        buf.clear();
                        self.stats.lock().errors += 1;
                    }
                }
                Err(e) => {
                    warn!("{}: receive failed: {}", self.name, e);
                    self.stats.lock().errors += 1;
                    break;
                }
            }
        }
        if !shutdown.is_cancelled() {
            self.connected.store(false, Ordering::Release);
        }
    }

    fn deliver(&self, frame: Vec<u8>) {
        if let Some(logger) = &self.logger {
            logger.log_frame(&self.name, "recv", &frame);
        }
        self.stats.lock().responses_received += 1;
        if !self.controller.dispatch(frame) {
            debug!("{}: dropped stale frame", self.name);
        }
    }
}

/// Connectors keyed by physical link, so machines on one bus share a link
#[derive(Default)]
pub struct ConnectionPool {
    connectors: Mutex<HashMap<String, Arc<dyn Connector>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector for `key`, created by `create` on first use
    pub fn get_or_create<F>(&self, key: &str, create: F) -> FieldbusResult<Arc<dyn Connector>>
    where
        F: FnOnce() -> FieldbusResult<Arc<dyn Connector>>,
    {
        let mut connectors = self.connectors.lock();
        if let Some(connector) = connectors.get(key) {
            return Ok(connector.clone());
        }
        let connector = create()?;
        connectors.insert(key.to_string(), connector.clone());
        Ok(connector)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.connectors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.lock().is_empty()
    }

    pub async fn disconnect_all(&self) {
        let connectors: Vec<_> = self.connectors.lock().values().cloned().collect();
        for connector in connectors {
            connector.disconnect().await;
        }
    }
}

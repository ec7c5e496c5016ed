//! Line-oriented serial transport.
//!
//! A [`Transport`] owns one serial connection at a time. While connected, a
//! dedicated I/O thread writes queued command lines, never more than one
//! awaiting a response, and pushes every received line onto a queue. The
//! queue is drained into observer callbacks by [`Transport::poll_received`],
//! which keeps listener code off the I/O thread.

use crate::observers::{Observers, SubscriptionId};
use crate::pin::ConnectionState;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_BAUD_RATE: u32 = 9600;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Could not open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("Serial connection is not open")]
    NotConnected,

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Byte-level access to an open serial line.
pub trait LineIo: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Return the next complete, non-blank line if one is available.
    /// Must not block longer than the port's read timeout.
    fn read_line(&mut self) -> io::Result<Option<String>>;

    /// Discard anything received but not yet consumed.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Opens serial lines and enumerates the ports they can be opened on.
pub trait SerialBackend: Send + Sync {
    fn list_ports(&self) -> Result<Vec<String>, TransportError>;

    fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn LineIo>, TransportError>;
}

/// Splits a raw byte stream into trimmed text lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next non-blank line. Bytes after the last newline stay buffered.
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// [`LineIo`] over a `serialport` handle.
pub struct SerialLineIo {
    serial: Box<dyn SerialPort>,
    buffer: LineBuffer,
}

impl SerialLineIo {
    const READ_TIMEOUT: Duration = Duration::from_millis(10);

    pub fn open(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let serial = serialport::new(port, baud_rate)
            .timeout(Self::READ_TIMEOUT)
            .open()?;
        Ok(Self::new(serial))
    }

    pub fn new(serial: Box<dyn SerialPort>) -> Self {
        Self {
            serial,
            buffer: LineBuffer::new(),
        }
    }
}

impl LineIo for SerialLineIo {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.serial.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.serial.flush()
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = self.buffer.next_line() {
            return Ok(Some(line));
        }

        let available = self.serial.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(None);
        }

        let mut chunk = vec![0u8; available];
        match self.serial.read(&mut chunk) {
            Ok(n) => self.buffer.extend(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }
        Ok(self.buffer.next_line())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.serial.clear(serialport::ClearBuffer::Input)?;
        self.buffer.clear();
        Ok(())
    }
}

/// The operating system's serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerial;

impl SerialBackend for SystemSerial {
    fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(|info| info.port_name)
            .collect())
    }

    fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn LineIo>, TransportError> {
        log::debug!("Opening serial port {} at {} baud", port, baud_rate);
        Ok(Box::new(SerialLineIo::open(port, baud_rate)?))
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Wait after opening the port before traffic starts.
    pub settle_delay: Duration,
    /// How long the send slot stays reserved for an unanswered command.
    pub response_timeout: Duration,
    /// Sleep between I/O loop iterations.
    pub poll_slice: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            response_timeout: Duration::from_millis(300),
            poll_slice: Duration::from_millis(5),
        }
    }
}

/// Origin of a line reported to message observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Sent,
    Received,
    System,
    Error,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
            Self::System => "system",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialMessage {
    pub source: MessageSource,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStats {
    pub sent_count: u64,
    pub received_count: u64,
    pub connected: bool,
    pub port_name: Option<String>,
    pub baud_rate: u32,
}

#[derive(Debug, Clone)]
struct LinkInfo {
    port_name: Option<String>,
    baud_rate: u32,
}

/// State reachable from both the caller side and the I/O thread.
struct Shared {
    state: Mutex<ConnectionState>,
    link: Mutex<LinkInfo>,
    outgoing_tx: Sender<String>,
    outgoing_rx: Receiver<String>,
    incoming_tx: Sender<String>,
    incoming_rx: Receiver<String>,
    messages: Observers<SerialMessage>,
    connection: Observers<bool>,
    sent_count: AtomicU64,
    received_count: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (outgoing_tx, outgoing_rx) = unbounded();
        let (incoming_tx, incoming_rx) = unbounded();
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            link: Mutex::new(LinkInfo {
                port_name: None,
                baud_rate: DEFAULT_BAUD_RATE,
            }),
            outgoing_tx,
            outgoing_rx,
            incoming_tx,
            incoming_rx,
            messages: Observers::new(),
            connection: Observers::new(),
            sent_count: AtomicU64::new(0),
            received_count: AtomicU64::new(0),
        }
    }

    fn emit(&self, source: MessageSource, text: impl Into<String>) {
        self.messages.notify(&SerialMessage {
            source,
            text: text.into(),
        });
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Move from `Disconnected` to `Connecting`. Returns `false` if a
    /// connection is live or another connect is already under way.
    fn begin_connecting(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ConnectionState::Disconnected {
            return false;
        }
        *state = ConnectionState::Connecting;
        true
    }

    /// Returns `true` if this call performed the transition.
    fn mark_disconnected(&self) -> bool {
        let was_connected = {
            let mut state = self.state.lock();
            let was_connected = *state == ConnectionState::Connected;
            *state = ConnectionState::Disconnected;
            was_connected
        };
        if was_connected {
            self.connection.notify(&false);
        }
        was_connected
    }
}

struct Session {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                // Stopping from inside the loop; it exits on its next check.
                return;
            }
            if worker.join().is_err() {
                log::error!("Serial I/O thread panicked");
            }
        }
    }
}

struct IoLoop {
    io: Box<dyn LineIo>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    config: TransportConfig,
    port: String,
    awaiting_response: bool,
    last_send: Instant,
}

impl IoLoop {
    fn run(mut self) {
        let span = tracing::debug_span!("serial_io", port = %self.port);
        let _entered = span.enter();
        log::debug!("Serial I/O loop started on {}", self.port);

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.step() {
                log::warn!("Serial I/O on {} failed: {}", self.port, e);
                // Receiver lives in `shared`, so this cannot fail.
                let _ = self
                    .shared
                    .incoming_tx
                    .send(format!("Serial I/O error: {e}"));
                self.shared.mark_disconnected();
                break;
            }
            thread::sleep(self.config.poll_slice);
        }

        log::debug!("Serial I/O loop on {} stopped", self.port);
    }

    fn step(&mut self) -> io::Result<()> {
        if !self.awaiting_response {
            if let Ok(line) = self.shared.outgoing_rx.try_recv() {
                self.io.write_all(line.as_bytes())?;
                self.io.flush()?;
                tracing::trace!(line = line.trim_end(), "tx");
                self.awaiting_response = true;
                self.last_send = Instant::now();
            }
        }

        if let Some(line) = self.io.read_line()? {
            tracing::trace!(line = line.as_str(), "rx");
            let _ = self.shared.incoming_tx.send(line);
            self.awaiting_response = false;
        }

        if self.awaiting_response && self.last_send.elapsed() > self.config.response_timeout {
            log::debug!(
                "No response within {:?}, releasing the send slot",
                self.config.response_timeout
            );
            self.awaiting_response = false;
        }

        Ok(())
    }
}

pub struct Transport {
    config: TransportConfig,
    backend: Arc<dyn SerialBackend>,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_backend(config, Arc::new(SystemSerial))
    }

    pub fn with_backend(config: TransportConfig, backend: Arc<dyn SerialBackend>) -> Self {
        Self {
            config,
            backend,
            shared: Arc::new(Shared::new()),
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn SerialBackend> {
        &self.backend
    }

    /// Open `port` and start the I/O loop. Succeeds immediately when a
    /// connection is already live.
    pub fn connect(&self, port: &str, baud_rate: u32) -> Result<(), TransportError> {
        if !self.shared.begin_connecting() {
            log::debug!(
                "Already {:?}, ignoring connect to {}",
                self.shared.state(),
                port
            );
            return Ok(());
        }

        let io = match self.backend.open(port, baud_rate) {
            Ok(io) => io,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                let reason = e.to_string();
                log::warn!("Could not open {}: {}", port, reason);
                self.shared.emit(
                    MessageSource::Error,
                    format!("Could not open serial port {port}: {reason}"),
                );
                return Err(TransportError::Open {
                    port: port.to_string(),
                    reason,
                });
            }
        };

        thread::sleep(self.config.settle_delay);
        self.attach(io, port, baud_rate)
    }

    /// Adopt an already-open line as the live connection.
    pub fn attach(
        &self,
        io: Box<dyn LineIo>,
        port: &str,
        baud_rate: u32,
    ) -> Result<(), TransportError> {
        let previous = self.session.lock().take();
        if let Some(previous) = previous {
            previous.stop();
        }

        {
            let mut session = self.session.lock();

            // Commands queued for an earlier connection are stale.
            while self.shared.outgoing_rx.try_recv().is_ok() {}

            *self.shared.link.lock() = LinkInfo {
                port_name: Some(port.to_string()),
                baud_rate,
            };

            let running = Arc::new(AtomicBool::new(true));
            self.shared.set_state(ConnectionState::Connected);

            let io_loop = IoLoop {
                io,
                shared: Arc::clone(&self.shared),
                running: Arc::clone(&running),
                config: self.config.clone(),
                port: port.to_string(),
                awaiting_response: false,
                last_send: Instant::now(),
            };

            let worker = thread::Builder::new()
                .name(format!("serial-io {port}"))
                .spawn(move || io_loop.run());

            match worker {
                Ok(worker) => {
                    *session = Some(Session {
                        running,
                        worker: Some(worker),
                    });
                }
                Err(e) => {
                    self.shared.set_state(ConnectionState::Disconnected);
                    return Err(e.into());
                }
            }
        }

        log::info!("Connected to {} at {} baud", port, baud_rate);
        self.shared.connection.notify(&true);
        self.shared.emit(
            MessageSource::System,
            format!("Connected to {port} at {baud_rate} baud"),
        );
        Ok(())
    }

    /// Stop the I/O loop and close the port. Calling it again is a no-op.
    pub fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.stop();
        }

        if self.shared.mark_disconnected() {
            log::info!("Serial connection closed");
            self.shared
                .emit(MessageSource::System, "Serial connection closed");
        }
    }

    /// Queue `line` for transmission, appending a newline when missing.
    pub fn send(&self, line: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            self.shared
                .emit(MessageSource::Error, "Serial connection is not open");
            return Err(TransportError::NotConnected);
        }

        let mut framed = line.to_string();
        if !framed.ends_with('\n') {
            framed.push('\n');
        }
        self.shared
            .outgoing_tx
            .send(framed)
            .map_err(|_| TransportError::NotConnected)?;

        self.shared.sent_count.fetch_add(1, Ordering::Relaxed);
        self.shared.emit(MessageSource::Sent, line.trim());
        Ok(())
    }

    /// Switch every output on or off at once.
    pub fn send_all(&self, on: bool) -> Result<(), TransportError> {
        self.send(&format!("ALL {}", u8::from(on)))
    }

    /// Deliver queued received lines to message observers, in arrival
    /// order. Returns the number of lines delivered.
    pub fn poll_received(&self) -> usize {
        let mut delivered = 0;
        while let Ok(line) = self.shared.incoming_rx.try_recv() {
            self.shared.received_count.fetch_add(1, Ordering::Relaxed);
            self.shared.emit(MessageSource::Received, line);
            delivered += 1;
        }
        delivered
    }

    /// Publish a status line to message observers without touching the wire.
    pub fn report(&self, source: MessageSource, text: &str) {
        self.shared.emit(source, text);
    }

    pub fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SerialMessage) + Send + Sync + 'static,
    {
        self.shared.messages.subscribe(handler)
    }

    pub fn remove_message_observer(&self, id: SubscriptionId) -> bool {
        self.shared.messages.unsubscribe(id)
    }

    pub fn on_connection_changed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.shared.connection.subscribe(handler)
    }

    pub fn remove_connection_observer(&self, id: SubscriptionId) -> bool {
        self.shared.connection.unsubscribe(id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected
    }

    /// Port of the live connection.
    pub fn port_name(&self) -> Option<String> {
        if self.is_connected() {
            self.shared.link.lock().port_name.clone()
        } else {
            None
        }
    }

    pub fn stats(&self) -> TransportStats {
        let link = self.shared.link.lock().clone();
        TransportStats {
            sent_count: self.shared.sent_count.load(Ordering::Relaxed),
            received_count: self.shared.received_count.load(Ordering::Relaxed),
            connected: self.is_connected(),
            port_name: link.port_name,
            baud_rate: link.baud_rate,
        }
    }

    pub fn reset_stats(&self) {
        self.shared.sent_count.store(0, Ordering::Relaxed);
        self.shared.received_count.store(0, Ordering::Relaxed);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.stop();
        }
    }
}

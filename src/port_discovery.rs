use crate::settings::SettingsStore;
use crate::transport::{
    LineIo, MessageSource, SerialBackend, Transport, TransportError, DEFAULT_BAUD_RATE,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Serial transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Port {port} did not answer the probe")]
    NoResponse { port: String },

    #[error("No device found. Please check the connection or pick a port manually")]
    NoDeviceFound,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub baud_rate: u32,
    /// Line sent to a candidate port.
    pub probe_token: String,
    /// Line compatible firmware answers with.
    pub expected_response: String,
    /// Wait for the line to settle after opening.
    pub settle_delay: Duration,
    /// Extra wait for the board's bootloader; opening the port resets it.
    pub boot_delay: Duration,
    pub read_slice: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            probe_token: "PING".to_string(),
            expected_response: "PONG".to_string(),
            settle_delay: Duration::from_millis(200),
            boot_delay: Duration::from_secs(2),
            read_slice: Duration::from_millis(5),
        }
    }
}

/// Finds the serial port running compatible firmware.
pub struct PortDiscovery {
    backend: Arc<dyn SerialBackend>,
    config: DiscoveryConfig,
}

impl PortDiscovery {
    pub fn new(backend: Arc<dyn SerialBackend>, config: DiscoveryConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Serial devices visible to the OS. Empty if enumeration fails.
    pub fn list_ports(&self) -> Vec<String> {
        match self.backend.list_ports() {
            Ok(ports) => ports,
            Err(e) => {
                log::warn!("Could not enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }

    /// Put `last` first when it is still attached.
    pub fn order_candidates(mut ports: Vec<String>, last: Option<&str>) -> Vec<String> {
        if let Some(last) = last {
            if let Some(index) = ports.iter().position(|p| p == last) {
                let remembered = ports.remove(index);
                ports.insert(0, remembered);
            }
        }
        ports
    }

    /// Open `port` and run the handshake. Blocks for the settle and boot
    /// delays plus up to `timeout` waiting for the answer. On success the
    /// open line is handed back so it can be kept.
    pub fn probe(&self, port: &str, timeout: Duration) -> Result<Box<dyn LineIo>, DiscoveryError> {
        log::debug!("Probing {} at {} baud", port, self.config.baud_rate);
        let mut io = self.backend.open(port, self.config.baud_rate)?;

        thread::sleep(self.config.settle_delay);
        thread::sleep(self.config.boot_delay);
        io.clear_input()?;

        io.write_all(format!("{}\n", self.config.probe_token).as_bytes())?;
        io.flush()?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = io.read_line()? {
                if line.trim() == self.config.expected_response {
                    log::debug!("{} answered the probe", port);
                    return Ok(io);
                }
                log::debug!("{} sent unexpected line during probe: {}", port, line);
            }
            if Instant::now() >= deadline {
                return Err(DiscoveryError::NoResponse {
                    port: port.to_string(),
                });
            }
            thread::sleep(self.config.read_slice);
        }
    }

    /// Locate the device and make its connection the live transport
    /// connection.
    ///
    /// Returns the current port straight away when already connected.
    /// Otherwise every candidate is probed, the remembered port first. The
    /// winning probe connection is attached to `transport` as is, and the
    /// port is remembered in `settings`.
    pub fn find_device_port(
        &self,
        transport: &Transport,
        settings: &SettingsStore,
        timeout: Duration,
    ) -> Option<String> {
        if let Some(port) = transport.port_name() {
            return Some(port);
        }

        let candidates =
            Self::order_candidates(self.list_ports(), settings.last_successful_port().as_deref());
        log::debug!("Discovery candidates: {:?}", candidates);

        for port in candidates {
            let io = match self.probe(&port, timeout) {
                Ok(io) => io,
                Err(e) => {
                    log::debug!("Skipping {}: {}", port, e);
                    continue;
                }
            };

            if let Err(e) = transport.attach(io, &port, self.config.baud_rate) {
                log::warn!("Could not start I/O on {}: {}", port, e);
                continue;
            }
            if let Err(e) = settings.remember_port(&port) {
                log::warn!("Could not persist last successful port: {}", e);
            }
            log::info!("Device found on {}", port);
            return Some(port);
        }

        log::warn!("{}", DiscoveryError::NoDeviceFound);
        transport.report(MessageSource::Error, &DiscoveryError::NoDeviceFound.to_string());
        None
    }
}

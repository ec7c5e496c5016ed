//! Process-wide wiring of the transport, parser, pin store and scheduler.

use crate::message_parser::MessageRouter;
use crate::pin_store::{CommandSink, PinError, PinStore};
use crate::port_discovery::{DiscoveryConfig, PortDiscovery};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::settings::SettingsStore;
use crate::transport::{SerialBackend, SystemSerial, Transport, TransportConfig, TransportError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const PUMP_JOB: &str = "serial_pump";
pub const DIGITAL_POLL_JOB: &str = "digital_poll";
pub const ANALOG_POLL_JOB: &str = "analog_poll";

/// How often received lines are pumped to observers.
pub const PUMP_INTERVAL: Duration = Duration::from_millis(20);

/// Owns one instance of every service. Construct once at startup and call
/// [`PinController::shutdown`] on exit.
pub struct PinController {
    transport: Arc<Transport>,
    router: Arc<MessageRouter>,
    store: Arc<PinStore>,
    scheduler: Scheduler,
    settings: Arc<SettingsStore>,
    discovery: PortDiscovery,
}

impl PinController {
    /// Controller on the system's serial ports with default timings.
    pub fn new(settings_path: impl Into<PathBuf>) -> Self {
        Self::with_backend(
            settings_path,
            Arc::new(SystemSerial),
            TransportConfig::default(),
            DiscoveryConfig::default(),
        )
    }

    pub fn with_backend(
        settings_path: impl Into<PathBuf>,
        backend: Arc<dyn SerialBackend>,
        transport_config: TransportConfig,
        discovery_config: DiscoveryConfig,
    ) -> Self {
        let settings = Arc::new(SettingsStore::load(settings_path));
        let discovery = PortDiscovery::new(Arc::clone(&backend), discovery_config);
        let transport = Arc::new(Transport::with_backend(transport_config, backend));

        let router = Arc::new(MessageRouter::new());
        router.attach(&transport);

        let store = Arc::new(PinStore::new(
            Arc::clone(&transport) as Arc<dyn CommandSink>
        ));
        store.attach(&router);

        Self {
            transport,
            router,
            store,
            scheduler: Scheduler::new(),
            settings,
            discovery,
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn pins(&self) -> &Arc<PinStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    /// Start pumping received lines into the parser.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let transport = Arc::clone(&self.transport);
        self.scheduler.add_job(
            PUMP_JOB,
            move || {
                transport.poll_received();
                Ok(())
            },
            PUMP_INTERVAL,
            true,
        )
    }

    /// Blocks for several seconds per candidate port; call it from a thread
    /// that may wait.
    pub fn find_device_port(&self, timeout: Duration) -> Option<String> {
        self.discovery
            .find_device_port(&self.transport, &self.settings, timeout)
    }

    /// Connect to `port`, or to the configured baud rate when `baud_rate`
    /// is `None`.
    pub fn connect(&self, port: &str, baud_rate: Option<u32>) -> Result<(), TransportError> {
        let baud_rate = baud_rate.unwrap_or_else(|| self.settings.get().baudrate);
        self.transport.connect(port, baud_rate)
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Push the stored pin configuration to the device.
    pub fn apply_settings(&self) -> Result<(), PinError> {
        self.store.apply_config(&self.settings.get())
    }

    pub fn start_digital_polling(&self, interval: Duration) -> Result<(), SchedulerError> {
        let store = Arc::clone(&self.store);
        self.scheduler.add_job(
            DIGITAL_POLL_JOB,
            move || Ok(store.request_digital_read()?),
            interval,
            true,
        )
    }

    pub fn start_analog_polling(&self, interval: Duration) -> Result<(), SchedulerError> {
        let store = Arc::clone(&self.store);
        self.scheduler.add_job(
            ANALOG_POLL_JOB,
            move || Ok(store.request_analog_read()?),
            interval,
            true,
        )
    }

    pub fn stop_polling(&self) {
        self.scheduler.remove_job(DIGITAL_POLL_JOB);
        self.scheduler.remove_job(ANALOG_POLL_JOB);
    }

    /// Stop every job, then close the connection.
    pub fn shutdown(&self) {
        self.scheduler.stop_all();
        self.transport.disconnect();
    }
}

impl Drop for PinController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! In-memory serial doubles shared by the unit tests.

use crate::transport::{LineIo, SerialBackend, TransportError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

#[derive(Default)]
struct DeviceState {
    raw_writes: Vec<String>,
    written: Vec<String>,
    inbound: VecDeque<String>,
    responder: Option<Responder>,
    broken: bool,
    clears: usize,
}

/// A scripted device. Clones share the same state.
#[derive(Clone, Default)]
pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to every written line with whatever `responder` returns.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let device = Self::new();
        device.state.lock().responder = Some(Box::new(responder));
        device
    }

    pub fn io(&self) -> Box<dyn LineIo> {
        Box::new(FakeIo {
            state: Arc::clone(&self.state),
        })
    }

    pub fn push_line(&self, line: &str) {
        self.state.lock().inbound.push_back(line.to_string());
    }

    /// Lines written by the host, terminators stripped.
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    pub fn raw_writes(&self) -> Vec<String> {
        self.state.lock().raw_writes.clone()
    }

    pub fn clears(&self) -> usize {
        self.state.lock().clears
    }

    pub fn break_link(&self) {
        self.state.lock().broken = true;
    }
}

struct FakeIo {
    state: Arc<Mutex<DeviceState>>,
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
}

impl LineIo for FakeIo {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.broken {
            return Err(gone());
        }
        let text = String::from_utf8_lossy(bytes).to_string();
        state.raw_writes.push(text.clone());
        for line in text.lines() {
            state.written.push(line.to_string());
            let reply = state.responder.as_mut().and_then(|respond| respond(line));
            if let Some(reply) = reply {
                state.inbound.push_back(reply);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.state.lock().broken {
            return Err(gone());
        }
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut state = self.state.lock();
        if state.broken {
            return Err(gone());
        }
        Ok(state.inbound.pop_front())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.inbound.clear();
        state.clears += 1;
        Ok(())
    }
}

/// Ports in listing order; `None` marks a port that fails to open.
#[derive(Default)]
pub struct FakeBackend {
    ports: Mutex<Vec<(String, Option<FakeDevice>)>>,
    opened: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&self, name: &str, device: Option<FakeDevice>) {
        self.ports.lock().push((name.to_string(), device));
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl SerialBackend for FakeBackend {
    fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        Ok(self
            .ports
            .lock()
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn open(&self, port: &str, _baud_rate: u32) -> Result<Box<dyn LineIo>, TransportError> {
        self.opened.lock().push(port.to_string());
        self.ports
            .lock()
            .iter()
            .find(|(name, _)| name == port)
            .and_then(|(_, device)| device.as_ref().map(FakeDevice::io))
            .ok_or_else(|| TransportError::Open {
                port: port.to_string(),
                reason: "no such device".to_string(),
            })
    }
}

/// Backend whose enumeration always fails.
pub struct BrokenBackend;

impl SerialBackend for BrokenBackend {
    fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        Err(TransportError::Io(io::Error::other("enumeration failed")))
    }

    fn open(&self, port: &str, _baud_rate: u32) -> Result<Box<dyn LineIo>, TransportError> {
        Err(TransportError::Open {
            port: port.to_string(),
            reason: "unavailable".to_string(),
        })
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

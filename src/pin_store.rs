use crate::message_parser::{DeviceEvent, MessageRouter};
use crate::observers::{Observers, SubscriptionId};
use crate::pin::{PinMode, PinRef, PWM_MAX};
use crate::settings::{PinModeSetting, Settings};
use crate::transport::{Transport, TransportError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Destination for outbound command lines.
pub trait CommandSink: Send + Sync {
    fn send(&self, line: &str) -> Result<(), TransportError>;
}

impl CommandSink for Transport {
    fn send(&self, line: &str) -> Result<(), TransportError> {
        Transport::send(self, line)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PinError {
    #[error("Pin {0} is outside the device address space")]
    OutOfRange(PinRef),

    #[error("Pin {0} is disabled")]
    Disabled(PinRef),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A cache entry changed because the device reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinUpdate {
    Digital { pin: u8, value: u32 },
    Analog { label: String, value: u32 },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PinSnapshot {
    pub modes: HashMap<u8, PinMode>,
    pub values: HashMap<u8, u32>,
    pub analog_values: HashMap<String, u32>,
}

/// Last known mode and value of every pin.
///
/// Written optimistically whenever a command is issued and authoritatively
/// whenever the device reports a state. Commands are recorded even if the
/// send fails; the error is still returned to the caller.
pub struct PinStore {
    sink: Arc<dyn CommandSink>,
    cache: RwLock<PinSnapshot>,
    updates: Observers<PinUpdate>,
}

impl PinStore {
    pub fn new(sink: Arc<dyn CommandSink>) -> Self {
        Self {
            sink,
            cache: RwLock::new(PinSnapshot::default()),
            updates: Observers::new(),
        }
    }

    /// Apply device events published by `router` to this store.
    pub fn attach(self: &Arc<Self>, router: &MessageRouter) -> SubscriptionId {
        let store = Arc::downgrade(self);
        router.subscribe(move |event| {
            if let Some(store) = store.upgrade() {
                store.handle_event(event);
            }
        })
    }

    fn wire_address(pin: PinRef) -> Result<u8, PinError> {
        pin.checked_address().ok_or_else(|| {
            log::warn!("Rejecting command for out-of-range pin {}", pin);
            PinError::OutOfRange(pin)
        })
    }

    /// Address of a pin that may carry read/write traffic.
    fn writable_address(&self, pin: PinRef) -> Result<u8, PinError> {
        let address = Self::wire_address(pin)?;
        if self.cache.read().modes.get(&address) == Some(&PinMode::Disabled) {
            log::debug!("Skipping write to disabled pin {}", pin);
            return Err(PinError::Disabled(pin));
        }
        Ok(address)
    }

    pub fn set_mode(&self, pin: impl Into<PinRef>, mode: PinMode) -> Result<(), PinError> {
        let address = Self::wire_address(pin.into())?;
        let result = self
            .sink
            .send(&format!("MODE {},{}", address, mode.code()));
        self.cache.write().modes.insert(address, mode);
        Ok(result?)
    }

    /// Like [`PinStore::set_mode`] with a raw mode number; unknown numbers
    /// select `Input`.
    pub fn set_mode_code(&self, pin: impl Into<PinRef>, code: i64) -> Result<(), PinError> {
        self.set_mode(pin, PinMode::from_code(code))
    }

    /// Drive a pin high or low. Disabled pins are left alone.
    pub fn write_digital(&self, pin: impl Into<PinRef>, high: bool) -> Result<(), PinError> {
        let address = self.writable_address(pin.into())?;
        let value = u32::from(high);
        let result = self.sink.send(&format!("{address},{value}"));
        self.cache.write().values.insert(address, value);
        Ok(result?)
    }

    /// Set a PWM duty cycle, clamped to `0..=255`.
    pub fn write_pwm(&self, pin: impl Into<PinRef>, value: i64) -> Result<(), PinError> {
        let address = self.writable_address(pin.into())?;
        let value = u32::try_from(value.clamp(0, i64::from(PWM_MAX))).unwrap_or(PWM_MAX);
        let result = self.sink.send(&format!("PWM {address},{value}"));
        self.cache.write().values.insert(address, value);
        Ok(result?)
    }

    pub fn request_digital_read(&self) -> Result<(), TransportError> {
        self.sink.send("DIG")
    }

    pub fn request_analog_read(&self) -> Result<(), TransportError> {
        self.sink.send("ANA")
    }

    /// Push the configured mode of every pin to the device, digital pins
    /// ascending and then `A0` .. `A5`. Every pin is issued even if a send
    /// fails; the first failure is returned.
    pub fn apply_config(&self, settings: &Settings) -> Result<(), PinError> {
        let mut first_error = None;
        for pin in PinRef::all() {
            let mode = match settings.pin_config(pin).mode {
                PinModeSetting::Disabled => PinMode::Disabled,
                PinModeSetting::Output => PinMode::Output,
                PinModeSetting::Input => PinMode::Input,
            };
            if let Err(e) = self.set_mode(pin, mode) {
                first_error.get_or_insert(e);
            }
        }
        log::debug!("Applied pin configuration");
        first_error.map_or(Ok(()), Err)
    }

    pub fn handle_event(&self, event: &DeviceEvent) {
        let update = match event {
            DeviceEvent::PinState { pin, value } => {
                self.cache.write().values.insert(*pin, *value);
                PinUpdate::Digital {
                    pin: *pin,
                    value: *value,
                }
            }
            DeviceEvent::AnalogValue { label, value } => {
                self.cache
                    .write()
                    .analog_values
                    .insert(label.clone(), *value);
                PinUpdate::Analog {
                    label: label.clone(),
                    value: *value,
                }
            }
            DeviceEvent::Stat(_) | DeviceEvent::Raw(_) => return,
        };
        self.updates.notify(&update);
    }

    /// Cached value, `0` if nothing is known yet.
    pub fn pin_value(&self, pin: impl Into<PinRef>) -> u32 {
        let address = pin.into().address();
        self.cache.read().values.get(&address).copied().unwrap_or(0)
    }

    pub fn pin_mode(&self, pin: impl Into<PinRef>) -> Option<PinMode> {
        let address = pin.into().address();
        self.cache.read().modes.get(&address).copied()
    }

    /// Last reading of an analog input by label (`"A0"` ..), `0` if none.
    pub fn analog_value(&self, label: &str) -> u32 {
        self.cache
            .read()
            .analog_values
            .get(&label.trim().to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> PinSnapshot {
        self.cache.read().clone()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PinUpdate) + Send + Sync + 'static,
    {
        self.updates.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.updates.unsubscribe(id)
    }
}

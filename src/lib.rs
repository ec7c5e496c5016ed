//! # PinLink RS
//!
//! A Rust library for driving and monitoring the digital and analog pins of a
//! microcontroller over a serial (USB-CDC) link.
//!
//! The board runs a small firmware speaking a line-based text protocol. This
//! crate provides the host side of that protocol: a background serial
//! transport, automatic port discovery, a parser for the device's replies, a
//! cache of pin states and a scheduler for periodic polling.
//!
//! ## Features
//!
//! - **Serial transport**: full-duplex I/O thread with one command in flight
//!   and a 300 ms soft response timeout
//! - **Device discovery**: probes every port with a handshake and remembers
//!   the last port that answered
//! - **Protocol parsing**: `PIN`, `D<n>:<v>`, `A0:<v>` and status dump lines
//!   become typed events
//! - **Pin state cache**: optimistic updates on every command, corrected by
//!   what the device reports
//! - **Scheduler**: named interval jobs for read polling
//!
//! ## Examples
//!
//! ### Discover the board and poll its inputs
//!
//! ```rust,no_run
//! use pinlink::PinController;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = PinController::new("config.json");
//! controller.start()?;
//!
//! let port = controller
//!     .find_device_port(Duration::from_secs(3))
//!     .ok_or("no device found")?;
//! println!("Board found on {}", port);
//!
//! controller.apply_settings()?;
//! controller.pins().subscribe(|update| println!("{:?}", update));
//! controller.start_digital_polling(Duration::from_millis(500))?;
//! controller.start_analog_polling(Duration::from_millis(500))?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Writing pins
//!
//! ```rust,no_run
//! use pinlink::{PinController, PinMode, PinRef};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = PinController::new("config.json");
//! controller.start()?;
//! controller.connect("/dev/ttyACM0", Some(9600))?;
//!
//! let pins = controller.pins();
//! pins.set_mode(PinRef::Digital(7), PinMode::Output)?;
//! pins.write_digital(PinRef::Digital(7), true)?; // sends "7,1"
//! pins.write_digital("A2".parse::<PinRef>()?, true)?; // sends "16,1"
//! pins.write_pwm(PinRef::Digital(9), 128)?; // sends "PWM 9,128"
//! # Ok(())
//! # }
//! ```
//!
//! ### Parsing device lines
//!
//! ```rust
//! use pinlink::{parse_line, DeviceEvent};
//!
//! let events = parse_line("D2:1,Dx:y,D3:0");
//! assert_eq!(
//!     events,
//!     vec![
//!         DeviceEvent::PinState { pin: 2, value: 1 },
//!         DeviceEvent::PinState { pin: 3, value: 0 },
//!     ]
//! );
//! assert!(parse_line("PIN ALL : ON").is_empty());
//! ```

pub mod controller;
pub mod message_parser;
pub mod observers;
pub mod pin;
pub mod pin_store;
pub mod port_discovery;
pub mod scheduler;
pub mod settings;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export the main types for convenience
pub use controller::PinController;

pub use message_parser::{parse_line, DeviceEvent, MessageRouter, StatEntry};

pub use observers::{Observers, SubscriptionId};

pub use pin::{ConnectionState, PinMode, PinParseError, PinRef};

pub use pin_store::{CommandSink, PinError, PinSnapshot, PinStore, PinUpdate};

pub use port_discovery::{DiscoveryConfig, DiscoveryError, PortDiscovery};

pub use scheduler::{JobError, Scheduler, SchedulerError};

pub use settings::{PinConfig, PinKind, PinModeSetting, Settings, SettingsError, SettingsStore};

pub use transport::{
    LineIo, MessageSource, SerialBackend, SerialMessage, SystemSerial, Transport,
    TransportConfig, TransportError, TransportStats,
};

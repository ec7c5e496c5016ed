use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Digital pins exposed by the firmware.
pub const DIGITAL_PINS: RangeInclusive<u8> = 2..=13;

/// Digital pins able to drive an 8-bit PWM duty cycle.
pub const PWM_PINS: [u8; 6] = [3, 5, 6, 9, 10, 11];

/// Number of analog inputs, labelled `A0` .. `A5`.
pub const ANALOG_PIN_COUNT: u8 = 6;

/// Device address of `A0`; `A<k>` lives at `ANALOG_BASE_ADDRESS + k`.
pub const ANALOG_BASE_ADDRESS: u8 = 14;

/// Highest PWM duty value accepted by the firmware.
pub const PWM_MAX: u32 = 255;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PinParseError {
    #[error("Empty pin identifier")]
    Empty,

    #[error("Invalid pin identifier '{0}'")]
    Invalid(String),

    #[error("Pin {0} is outside the device address space")]
    OutOfRange(String),
}

/// A pin as addressed by callers: either a plain device number or an
/// analog label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PinRef {
    Digital(u8),
    Analog(u8),
}

impl PinRef {
    /// Address used on the wire for outbound commands. Out-of-range analog
    /// indices saturate instead of wrapping onto a real pin; see
    /// [`PinRef::checked_address`].
    pub fn address(self) -> u8 {
        match self {
            Self::Digital(pin) => pin,
            Self::Analog(index) => ANALOG_BASE_ADDRESS.saturating_add(index),
        }
    }

    /// The wire address if it lies inside the device address space.
    pub fn checked_address(self) -> Option<u8> {
        let address = match self {
            Self::Digital(pin) => pin,
            Self::Analog(index) if index < ANALOG_PIN_COUNT => ANALOG_BASE_ADDRESS + index,
            Self::Analog(_) => return None,
        };
        (address < ANALOG_BASE_ADDRESS + ANALOG_PIN_COUNT).then_some(address)
    }

    /// Map a device address back to its canonical reference.
    pub fn from_address(address: u8) -> Option<Self> {
        match address {
            0..ANALOG_BASE_ADDRESS => Some(Self::Digital(address)),
            a if a < ANALOG_BASE_ADDRESS + ANALOG_PIN_COUNT => {
                Some(Self::Analog(a - ANALOG_BASE_ADDRESS))
            }
            _ => None,
        }
    }

    pub fn analog(index: u8) -> Option<Self> {
        (index < ANALOG_PIN_COUNT).then_some(Self::Analog(index))
    }

    pub fn is_pwm_capable(self) -> bool {
        matches!(self, Self::Digital(pin) if PWM_PINS.contains(&pin))
    }

    pub fn is_analog(self) -> bool {
        matches!(self, Self::Analog(_))
    }

    /// Every configurable pin in the order bulk operations visit them:
    /// digital ascending, then `A0` .. `A5`.
    pub fn all() -> impl Iterator<Item = Self> {
        DIGITAL_PINS
            .map(Self::Digital)
            .chain((0..ANALOG_PIN_COUNT).map(Self::Analog))
    }
}

impl From<u8> for PinRef {
    fn from(address: u8) -> Self {
        Self::from_address(address).unwrap_or(Self::Digital(address))
    }
}

impl fmt::Display for PinRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digital(pin) => write!(f, "{pin}"),
            Self::Analog(index) => write!(f, "A{index}"),
        }
    }
}

impl FromStr for PinRef {
    type Err = PinParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PinParseError::Empty);
        }

        if let Some(index) = s.strip_prefix('A').or_else(|| s.strip_prefix('a')) {
            let index: u8 = index
                .parse()
                .map_err(|_| PinParseError::Invalid(s.to_string()))?;
            return Self::analog(index).ok_or_else(|| PinParseError::OutOfRange(s.to_string()));
        }

        let address: u8 = s
            .parse()
            .map_err(|_| PinParseError::Invalid(s.to_string()))?;
        Self::from_address(address).ok_or_else(|| PinParseError::OutOfRange(s.to_string()))
    }
}

/// Direction of a pin as understood by the firmware's `MODE` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PinMode {
    #[default]
    Input,
    Output,
    /// Excluded from all read/write traffic.
    Disabled,
}

impl PinMode {
    pub fn code(self) -> u8 {
        match self {
            Self::Input => 0,
            Self::Output => 1,
            Self::Disabled => 2,
        }
    }

    /// Decode a mode number. Anything unknown falls back to `Input`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Output,
            2 => Self::Disabled,
            _ => Self::Input,
        }
    }
}

/// Lifecycle of the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

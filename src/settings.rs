//! Persistent key-value settings: the last port a device answered on and
//! the per-pin configuration pushed by [`crate::PinStore::apply_config`].

use crate::pin::{PinRef, DIGITAL_PINS};
use crate::transport::DEFAULT_BAUD_RATE;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Settings format error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PinModeSetting {
    Input,
    Output,
    Disabled,
}

impl PinModeSetting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Disabled => "disabled",
        }
    }
}

impl From<String> for PinModeSetting {
    /// Unknown names read as `input`; `pas` is the legacy name of `disabled`.
    fn from(name: String) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "output" => Self::Output,
            "disabled" | "pas" => Self::Disabled,
            _ => Self::Input,
        }
    }
}

impl From<PinModeSetting> for String {
    fn from(mode: PinModeSetting) -> Self {
        mode.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PinKind {
    Digital,
    Pwm,
    Analog,
}

impl PinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Digital => "digital",
            Self::Pwm => "pwm",
            Self::Analog => "analog",
        }
    }
}

impl From<String> for PinKind {
    /// Unknown names read as `digital`.
    fn from(name: String) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pwm" => Self::Pwm,
            "analog" => Self::Analog,
            _ => Self::Digital,
        }
    }
}

impl From<PinKind> for String {
    fn from(kind: PinKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PinConfig {
    pub mode: PinModeSetting,
    #[serde(rename = "type")]
    pub kind: PinKind,
}

impl PinConfig {
    pub fn new(mode: PinModeSetting, kind: PinKind) -> Self {
        Self { mode, kind }
    }

    pub fn default_for(pin: PinRef) -> Self {
        if pin.is_analog() {
            Self::new(PinModeSetting::Input, PinKind::Analog)
        } else if pin.is_pwm_capable() {
            Self::new(PinModeSetting::Output, PinKind::Pwm)
        } else {
            Self::new(PinModeSetting::Output, PinKind::Digital)
        }
    }

    /// Replace a type the pin cannot provide with plain `digital`.
    fn constrained_to(self, pin: PinRef) -> Self {
        let supported = match self.kind {
            PinKind::Digital => true,
            PinKind::Pwm => pin.is_pwm_capable(),
            PinKind::Analog => pin.is_analog(),
        };
        if supported {
            self
        } else {
            log::warn!(
                "Pin {} cannot be {:?}, falling back to digital",
                pin,
                self.kind
            );
            Self::new(self.mode, PinKind::Digital)
        }
    }
}

/// A pin entry as found in the file. Absent fields take the pin's default.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PinEntry {
    mode: Option<PinModeSetting>,
    #[serde(rename = "type")]
    kind: Option<PinKind>,
}

/// Read the pin table one entry at a time so a single bad entry cannot
/// discard the rest of the document. Keys are canonicalised (`a2` -> `A2`).
fn deserialize_pins<'de, D>(deserializer: D) -> Result<BTreeMap<String, PinConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    let mut pins = BTreeMap::new();
    for (name, value) in raw {
        let Ok(pin) = name.parse::<PinRef>() else {
            log::warn!("Ignoring settings for unknown pin '{}'", name);
            continue;
        };
        let entry = PinEntry::deserialize(value).unwrap_or_else(|e| {
            log::warn!("Ignoring malformed settings for pin {}: {}", pin, e);
            PinEntry::default()
        });
        let fallback = PinConfig::default_for(pin);
        pins.insert(
            pin.to_string(),
            PinConfig::new(
                entry.mode.unwrap_or(fallback.mode),
                entry.kind.unwrap_or(fallback.kind),
            ),
        );
    }
    Ok(pins)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub last_successful_port: Option<String>,
    pub baudrate: u32,
    #[serde(deserialize_with = "deserialize_pins")]
    pub pins: BTreeMap<String, PinConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        let pins = PinRef::all()
            .map(|pin| (pin.to_string(), PinConfig::default_for(pin)))
            .collect();
        Self {
            last_successful_port: None,
            baudrate: DEFAULT_BAUD_RATE,
            pins,
        }
    }
}

impl Settings {
    /// Read settings from `path`. A missing or unreadable file yields the
    /// defaults; missing pins are filled in and unsupported pin types are
    /// coerced.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut settings = match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str::<Self>(&text).unwrap_or_else(|e| {
                log::warn!("Ignoring malformed settings file {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("No settings file at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                log::warn!("Could not read settings file {}: {}", path.display(), e);
                Self::default()
            }
        };
        settings.normalize();
        settings
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Fill in missing pins and coerce unsupported pin types.
    pub fn normalize(&mut self) {
        for pin in PinRef::all() {
            let entry = self
                .pins
                .entry(pin.to_string())
                .or_insert_with(|| PinConfig::default_for(pin));
            *entry = entry.constrained_to(pin);
        }
        if self.baudrate == 0 {
            self.baudrate = DEFAULT_BAUD_RATE;
        }
    }

    pub fn pin_config(&self, pin: PinRef) -> PinConfig {
        self.pins
            .get(&pin.to_string())
            .copied()
            .unwrap_or_else(|| PinConfig::default_for(pin))
    }

    pub fn set_pin_config(&mut self, pin: PinRef, config: PinConfig) {
        self.pins.insert(pin.to_string(), config.constrained_to(pin));
    }

    /// Digital pins currently configured as PWM outputs.
    pub fn pwm_outputs(&self) -> Vec<u8> {
        DIGITAL_PINS
            .filter(|&pin| {
                let config = self.pin_config(PinRef::Digital(pin));
                config.kind == PinKind::Pwm && config.mode == PinModeSetting::Output
            })
            .collect()
    }
}

/// Settings document bound to a file, shared between components.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: RwLock<Settings>,
}

impl SettingsStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = Settings::load(&path);
        Self {
            path,
            settings: RwLock::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Modify the settings in memory; call [`SettingsStore::save`] to persist.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        let mut settings = self.settings.write();
        f(&mut settings);
        settings.normalize();
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        self.settings.read().save(&self.path)
    }

    pub fn last_successful_port(&self) -> Option<String> {
        self.settings.read().last_successful_port.clone()
    }

    /// Record `port` as the first candidate for the next discovery and
    /// write the file immediately.
    pub fn remember_port(&self, port: &str) -> Result<(), SettingsError> {
        self.settings.write().last_successful_port = Some(port.to_string());
        self.save()
    }
}

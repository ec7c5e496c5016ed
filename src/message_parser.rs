//! Inbound line protocol.
//!
//! [`parse_line`] turns one received line into typed events; anything it
//! cannot classify yields nothing. [`MessageRouter`] feeds it from the
//! transport and republishes the results.

use crate::observers::{Observers, SubscriptionId};
use crate::transport::{MessageSource, SerialMessage, Transport};
use std::sync::Arc;

/// One `<pin>:<mode>:<value>` triple of a status dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatEntry {
    pub pin: u32,
    pub mode: u32,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    PinState { pin: u8, value: u32 },
    AnalogValue { label: String, value: u32 },
    Stat(Vec<StatEntry>),
    /// Every received line, matched or not.
    Raw(String),
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn number<T: std::str::FromStr>(s: &str) -> Option<T> {
    let s = s.trim();
    if is_number(s) {
        s.parse().ok()
    } else {
        None
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &s[prefix.len()..])
}

/// Parse a received line into zero or more events. Never fails; malformed
/// entries inside a comma-separated group are skipped one by one.
pub fn parse_line(line: &str) -> Vec<DeviceEvent> {
    let line = line.trim();

    if let Some(rest) = strip_prefix_ignore_case(line, "PIN ") {
        return parse_pin_feedback(rest).into_iter().collect();
    }
    if strip_prefix_ignore_case(line, "A0:").is_some() {
        return parse_analog_readings(line);
    }
    if line.starts_with(['D', 'd']) && line.contains(':') {
        return parse_digital_readings(line);
    }
    if line.contains(':') && !line.starts_with(['A', 'a', 'D', 'd']) {
        return parse_stat(line).into_iter().collect();
    }

    Vec::new()
}

/// `PIN <n> : <ON|OFF|value>`; mode announcements and `PIN ALL` are ignored.
fn parse_pin_feedback(rest: &str) -> Option<DeviceEvent> {
    let rest = rest.trim();
    if strip_prefix_ignore_case(rest, "ALL").is_some() {
        return None;
    }

    let (pin, value) = rest.split_once(':')?;
    let pin: u8 = number(pin)?;
    let value = value.trim();

    let value = if is_number(value) {
        value.parse().ok()?
    } else if value.eq_ignore_ascii_case("ON") {
        1
    } else if value.eq_ignore_ascii_case("OFF") {
        0
    } else {
        return None;
    };

    Some(DeviceEvent::PinState { pin, value })
}

/// `D2:1,D3:0,...`
fn parse_digital_readings(line: &str) -> Vec<DeviceEvent> {
    line.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let body = entry.strip_prefix(['D', 'd'])?;
            let (pin, value) = body.split_once(':')?;
            Some(DeviceEvent::PinState {
                pin: number(pin)?,
                value: number(value)?,
            })
        })
        .collect()
}

/// `A0:512,A1:3,...`
fn parse_analog_readings(line: &str) -> Vec<DeviceEvent> {
    line.split(',')
        .filter_map(|entry| {
            let (label, value) = entry.split_once(':')?;
            let label = label.trim();
            if label.is_empty() {
                return None;
            }
            Some(DeviceEvent::AnalogValue {
                label: label.to_ascii_uppercase(),
                value: number(value)?,
            })
        })
        .collect()
}

/// `2:1:1,3:0:1,...`
fn parse_stat(line: &str) -> Option<DeviceEvent> {
    let entries: Vec<StatEntry> = line
        .split(',')
        .filter_map(|entry| {
            let mut fields = entry.split(':');
            Some(StatEntry {
                pin: number(fields.next()?)?,
                mode: number(fields.next()?)?,
                value: number(fields.next()?)?,
            })
        })
        .collect();

    (!entries.is_empty()).then_some(DeviceEvent::Stat(entries))
}

/// Parses every received line and republishes the resulting events.
#[derive(Debug, Default)]
pub struct MessageRouter {
    events: Observers<DeviceEvent>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe this router to `transport`'s message stream.
    pub fn attach(self: &Arc<Self>, transport: &Transport) -> SubscriptionId {
        let router = Arc::downgrade(self);
        transport.on_message(move |message| {
            if let Some(router) = router.upgrade() {
                router.handle_message(message);
            }
        })
    }

    /// Only lines received from the device are parsed; locally echoed
    /// traffic is ignored.
    pub fn handle_message(&self, message: &SerialMessage) {
        if message.source != MessageSource::Received {
            return;
        }

        let line = message.text.trim();
        self.events.notify(&DeviceEvent::Raw(line.to_string()));
        for event in parse_line(line) {
            self.events.notify(&event);
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn pin(pin: u8, value: u32) -> DeviceEvent {
        DeviceEvent::PinState { pin, value }
    }

    fn analog(label: &str, value: u32) -> DeviceEvent {
        DeviceEvent::AnalogValue {
            label: label.to_string(),
            value,
        }
    }

    #[test]
    fn test_pin_feedback() {
        assert_eq!(parse_line("PIN 7 : ON"), vec![pin(7, 1)]);
        assert_eq!(parse_line("PIN 7  : off"), vec![pin(7, 0)]);
        assert_eq!(parse_line("PIN 11 : 127"), vec![pin(11, 127)]);
        assert_eq!(parse_line("pin 4:On"), vec![pin(4, 1)]);
    }

    #[test]
    fn test_pin_feedback_ignored_forms() {
        assert!(parse_line("PIN ALL : ON").is_empty());
        assert!(parse_line("PIN all 1").is_empty());
        assert!(parse_line("PIN 7 : OUT").is_empty());
        assert!(parse_line("PIN 7 : IN").is_empty());
        assert!(parse_line("PIN 7 ON").is_empty());
        assert!(parse_line("PIN x : 1").is_empty());
        assert!(parse_line("PIN 999 : 1").is_empty());
    }

    #[test]
    fn test_digital_readings() {
        assert_eq!(
            parse_line("D2:1,D3:0,D13:1"),
            vec![pin(2, 1), pin(3, 0), pin(13, 1)]
        );
    }

    #[test]
    fn test_malformed_digital_entries_are_skipped() {
        assert_eq!(parse_line("D2:1,Dx:y,D3:0"), vec![pin(2, 1), pin(3, 0)]);
        assert_eq!(parse_line("D2:1,garbage,D4:1:1,D5:"), vec![pin(2, 1)]);
    }

    #[test]
    fn test_analog_readings() {
        assert_eq!(
            parse_line("A0:512,A1:0,A5:1023"),
            vec![analog("A0", 512), analog("A1", 0), analog("A5", 1023)]
        );
        assert_eq!(parse_line("A0:1,A1:-3,A2:7"), vec![analog("A0", 1), analog("A2", 7)]);
    }

    #[test]
    fn test_analog_must_start_at_a0() {
        assert!(parse_line("A1:512,A2:3").is_empty());
    }

    #[test]
    fn test_stat_dump() {
        assert_eq!(
            parse_line("2:1:1,3:0:0,bad,4:1"),
            vec![DeviceEvent::Stat(vec![
                StatEntry { pin: 2, mode: 1, value: 1 },
                StatEntry { pin: 3, mode: 0, value: 0 },
            ])]
        );
        assert_eq!(
            parse_line("9:2:0"),
            vec![DeviceEvent::Stat(vec![StatEntry { pin: 9, mode: 2, value: 0 }])]
        );
        assert!(parse_line("x:y:z,1:2").is_empty());
    }

    #[test]
    fn test_unclassified_lines() {
        assert!(parse_line("").is_empty());
        assert!(parse_line("Ready").is_empty());
        assert!(parse_line("OK").is_empty());
        assert!(parse_line("ALL 1").is_empty());
    }

    #[test]
    fn test_router_publishes_raw_then_parsed() {
        let router = MessageRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        router.subscribe(move |event| sink.lock().push(event.clone()));

        router.handle_message(&SerialMessage {
            source: MessageSource::Received,
            text: " D2:1,D3:0 ".to_string(),
        });
        router.handle_message(&SerialMessage {
            source: MessageSource::Received,
            text: "hello".to_string(),
        });

        assert_eq!(
            *seen.lock(),
            vec![
                DeviceEvent::Raw("D2:1,D3:0".to_string()),
                pin(2, 1),
                pin(3, 0),
                DeviceEvent::Raw("hello".to_string()),
            ]
        );
    }

    #[test]
    fn test_router_ignores_local_traffic() {
        let router = MessageRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        router.subscribe(move |event| sink.lock().push(event.clone()));

        for source in [MessageSource::Sent, MessageSource::System, MessageSource::Error] {
            router.handle_message(&SerialMessage {
                source,
                text: "PIN 7 : ON".to_string(),
            });
        }
        assert!(seen.lock().is_empty());
    }
}

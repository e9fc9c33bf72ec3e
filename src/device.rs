//! Decoding of the vendor's device objects
//!
//! The status endpoint nests the interesting fields in detail groups:
//!
//! ```text
//! {
//!   "modem_details": { "IMEI": "...", "NICK": "...", "IS_LOCKED": "no", ... },
//!   "net_details":   { "DEV": "modem3", "IS_ONLINE": "yes", "ping_stats": "35ms, 0% loss" },
//!   "android":       { "battery": "80%" }
//! }
//! ```
//!
//! Values arrive as strings, booleans or numbers depending on firmware, so
//! flags are kept raw and interpreted by [`coerce_flag`].
//!
//! The port endpoint groups ports by IMEI:
//!
//! ```text
//! { "861234...": [ { "portID": "p1", "LOGIN": "user1", ... }, ... ], ... }
//! ```

use serde_json::Value;

use crate::{DeviceRecord, ProxyPort};

/// String tokens (after trim + lowercase) that count as a set flag
pub const ACCEPTED_TOKENS: [&str; 5] = ["yes", "true", "1", "ok", "online"];

/// Keys some firmware versions wrap the device array in
const WRAPPER_KEYS: [&str; 3] = ["data", "items", "result"];

/// Interpret a vendor flag value.
///
/// `true`, non-zero numbers and the [`ACCEPTED_TOKENS`] are set; everything
/// else, `null` included, is unset.
pub fn coerce_flag(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => {
            let token = text.trim().to_ascii_lowercase();
            ACCEPTED_TOKENS.contains(&token.as_str())
        }
        _ => false,
    }
}

/// Same as [`coerce_flag`] for an optional field
pub fn flag_set(value: Option<&Value>) -> bool {
    value.is_some_and(coerce_flag)
}

/// Battery percent from a number or a string like `"80%"` / `" ~80"`.
///
/// Values outside `0..=100` and strings without digits yield `None`.
pub fn parse_battery(value: &Value) -> Option<u8> {
    match value {
        Value::Number(number) => {
            let percent = number.as_f64()?.trunc();
            (0.0..=100.0).contains(&percent).then_some(percent as u8)
        }
        Value::String(text) => {
            let text = text.trim();
            let text = text.strip_suffix('%').unwrap_or(text);
            let digits: String = text.chars().filter(char::is_ascii_digit).collect();
            if digits.is_empty() {
                return None;
            }
            let percent: u32 = digits.parse().ok()?;
            (percent <= 100).then_some(percent as u8)
        }
        _ => None,
    }
}

/// Unwrap the device array from a status response body.
///
/// Returns `None` when the body is neither an array nor an object wrapping
/// one under a known key.
pub fn device_list(body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(devices) => Some(devices),
        Value::Object(mut map) => WRAPPER_KEYS.iter().find_map(|key| match map.remove(*key) {
            Some(Value::Array(devices)) => Some(devices),
            _ => None,
        }),
        _ => None,
    }
}

/// Flatten a port listing into one entry per port.
///
/// Entries without a port id are skipped, non-array groups ignored. `None`
/// when the body is not an object.
pub fn port_list(body: &Value) -> Option<Vec<ProxyPort>> {
    let groups = body.as_object()?;

    let ports = groups
        .iter()
        .filter_map(|(imei, entries)| Some((imei, entries.as_array()?)))
        .flat_map(|(imei, entries)| {
            entries.iter().filter_map(move |entry| {
                let entry = Some(entry);
                let port_id = ["portID", "portId", "port_id"]
                    .iter()
                    .find_map(|key| text_field(entry, key))?;
                Some(ProxyPort {
                    device_id: imei.clone(),
                    port_id,
                    login: text_field(entry, "LOGIN").or_else(|| text_field(entry, "login")),
                })
            })
        })
        .collect();
    Some(ports)
}

fn text_field(group: Option<&Value>, key: &str) -> Option<String> {
    match group?.get(key)? {
        Value::String(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn raw_field(group: Option<&Value>, key: &str) -> Option<Value> {
    group?.get(key).filter(|value| !value.is_null()).cloned()
}

impl DeviceRecord {
    /// Build a record from one element of the status array.
    ///
    /// Missing groups or fields simply leave the corresponding field empty.
    pub fn from_value(value: &Value) -> DeviceRecord {
        let root = Some(value);
        let modem = value.get("modem_details");
        let net = value.get("net_details");
        let android = value.get("android");

        DeviceRecord {
            id: text_field(modem, "IMEI").or_else(|| text_field(root, "IMEI")),
            dev: text_field(net, "DEV").unwrap_or_default(),
            nick: text_field(modem, "NICK")
                .or_else(|| text_field(modem, "name"))
                .or_else(|| text_field(root, "name")),
            online: raw_field(net, "IS_ONLINE").or_else(|| raw_field(root, "IS_ONLINE")),
            locked: raw_field(modem, "IS_LOCKED"),
            rebooting: raw_field(modem, "IS_REBOOTING"),
            rotating: raw_field(modem, "IS_ROTATING"),
            battery: android
                .and_then(|group| group.get("battery"))
                .and_then(parse_battery),
            ping_stats: text_field(net, "ping_stats"),
        }
    }

    pub fn is_busy(&self) -> bool {
        flag_set(self.locked.as_ref())
            || flag_set(self.rebooting.as_ref())
            || flag_set(self.rotating.as_ref())
    }
}

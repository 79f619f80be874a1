//! Canonical device identifiers.
//!
//! A device identifier has the shape `scheme:value[/service[/…]]`:
//!
//! - `scheme` is one of `mac`, `uuid`, `dns`, `serial`, `event` (any case on
//!   input, lowercased on output).
//! - For `mac`, the value is normalised to exactly 12 lowercase hex digits;
//!   input may carry `:`, `-` or `,` separators and uppercase digits.
//! - For the other schemes the value is preserved verbatim.
//! - An optional `/service[/anything…]` suffix is normalised to `/service/`;
//!   everything past the second `/` is discarded.
//!
//! Parsing is total and idempotent: re-parsing any canonical identifier
//! yields the same identifier.

use axum::http::HeaderMap;
use serde::Serialize;

use crate::error::DeviceError;

/// HTTP header the connect handshake reads the device name from when the
/// configuration doesn't override it.
pub const DEFAULT_DEVICE_NAME_HEADER: &str = "X-Webpa-Device-Name";

/// Separators accepted (and stripped) inside a MAC value.
const MAC_SEPARATORS: [char; 3] = [':', '-', ','];

/// Number of hex digits in a canonical MAC value.
const MAC_LENGTH: usize = 12;

/// A canonicalised device identifier.
///
/// Construct via [`DeviceId::parse`] or [`DeviceId::from_int`]; the inner
/// string is always in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse and canonicalise a device identifier.
    pub fn parse(s: &str) -> Result<Self, DeviceError> {
        let (scheme_raw, rest) = s.split_once(':').ok_or(DeviceError::InvalidDeviceName)?;
        let scheme = scheme_raw.to_ascii_lowercase();

        let (value_raw, suffix) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };
        if value_raw.is_empty() {
            return Err(DeviceError::InvalidDeviceName);
        }

        let value = match scheme.as_str() {
            "mac" => canonicalize_mac(value_raw)?,
            "uuid" | "dns" | "serial" | "event" => value_raw.to_string(),
            _ => return Err(DeviceError::InvalidDeviceName),
        };

        let canonical = match suffix {
            None => format!("{scheme}:{value}"),
            Some(sfx) => {
                // Everything past the second '/' is discarded.
                let service = sfx.split('/').next().unwrap_or("");
                if service.is_empty() {
                    return Err(DeviceError::InvalidDeviceName);
                }
                format!("{scheme}:{value}/{service}/")
            }
        };

        Ok(DeviceId(canonical))
    }

    /// Render the low 48 bits of `n` as a `mac:` identifier.
    #[must_use]
    pub fn from_int(n: u64) -> Self {
        DeviceId(format!("mac:{:012x}", n & 0x0000_ffff_ffff_ffff))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for DeviceId {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceId::parse(s)
    }
}

/// Strip separators, validate, and lowercase a MAC value.
fn canonicalize_mac(raw: &str) -> Result<String, DeviceError> {
    let mut digits = String::with_capacity(MAC_LENGTH);
    for c in raw.chars() {
        if MAC_SEPARATORS.contains(&c) {
            continue;
        }
        if !c.is_ascii_hexdigit() {
            return Err(DeviceError::InvalidDeviceName);
        }
        digits.push(c.to_ascii_lowercase());
    }
    if digits.len() != MAC_LENGTH {
        return Err(DeviceError::InvalidDeviceName);
    }
    Ok(digits)
}

/// Read the device name from `header` (e.g. `X-Webpa-Device-Name`) and return
/// the canonical identifier. A missing, non-ASCII, or invalid header value is
/// an error — the connect handshake turns it into a 400.
pub fn id_from_headers(headers: &HeaderMap, header: &str) -> Result<DeviceId, DeviceError> {
    let raw = headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .ok_or(DeviceError::InvalidDeviceName)?;
    DeviceId::parse(raw)
}

//! The convey header: device inventory attributes supplied at connect time.
//!
//! Devices send a free-form JSON object, base64-encoded, in `X-Webpa-Convey`.
//! Four base64 alphabets are in the wild, so decoding tries each in order
//! (raw-url, url, raw-std, std) and remembers which one worked — replies to
//! the device re-encode with the same alphabet.
//!
//! A malformed header never rejects the connection; it is recorded as a
//! [`Compliance`] value for observability and the connect proceeds without
//! convey data.

use axum::http::HeaderMap;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::engine::GeneralPurpose;
use base64::Engine;
use serde::Serialize;
use serde_json::{Map, Value};

/// HTTP header carrying the convey payload.
pub const CONVEY_HEADER: &str = "X-Webpa-Convey";

/// Base64 alphabet negotiated for a connection's convey payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConveyEncoding {
    RawUrl,
    Url,
    RawStd,
    Std,
}

impl ConveyEncoding {
    /// Decode order: permissive alphabets first.
    pub const ALL: [ConveyEncoding; 4] = [Self::RawUrl, Self::Url, Self::RawStd, Self::Std];

    fn engine(self) -> &'static GeneralPurpose {
        match self {
            Self::RawUrl => &URL_SAFE_NO_PAD,
            Self::Url => &URL_SAFE,
            Self::RawStd => &STANDARD_NO_PAD,
            Self::Std => &STANDARD,
        }
    }

    /// Parse the configuration name (`std`, `url`, `raw-std`, `raw-url`).
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "raw-url" => Some(Self::RawUrl),
            "url" => Some(Self::Url),
            "raw-std" => Some(Self::RawStd),
            "std" => Some(Self::Std),
            _ => None,
        }
    }
}

/// How well the device's convey header conformed to the expected format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Compliance {
    /// Header present and decoded to a JSON object.
    Full,
    /// Header absent.
    Missing,
    /// Header present but not decodable as base64 JSON object.
    Invalid,
}

/// Decoded convey attributes plus the alphabet they arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct Convey {
    encoding: ConveyEncoding,
    fields: Map<String, Value>,
}

impl Convey {
    /// Build a convey map for encoding with the given alphabet.
    #[must_use]
    pub fn new(encoding: ConveyEncoding, fields: Map<String, Value>) -> Self {
        Self { encoding, fields }
    }

    /// Try each base64 alphabet in order until one yields a JSON object.
    pub fn parse(header: &str) -> Option<Self> {
        for encoding in ConveyEncoding::ALL {
            let Ok(bytes) = encoding.engine().decode(header) else {
                continue;
            };
            if let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(&bytes) {
                return Some(Self { encoding, fields });
            }
        }
        None
    }

    /// Read `X-Webpa-Convey` from the connect request.
    ///
    /// Always returns a [`Compliance`]; the connection is accepted regardless.
    pub fn from_headers(headers: &HeaderMap) -> (Option<Self>, Compliance) {
        let Some(raw) = headers.get(CONVEY_HEADER).and_then(|v| v.to_str().ok()) else {
            return (None, Compliance::Missing);
        };
        match Self::parse(raw) {
            Some(convey) => (Some(convey), Compliance::Full),
            None => (None, Compliance::Invalid),
        }
    }

    /// Re-encode the fields with the negotiated alphabet.
    #[must_use]
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(&Value::Object(self.fields.clone()))
            .expect("convey fields serialize");
        self.encoding.engine().encode(json)
    }

    #[must_use]
    pub fn encoding(&self) -> ConveyEncoding {
        self.encoding
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_fields() -> Map<String, Value> {
        let Value::Object(fields) = json!({
            "fw-name": "fw-2.1.0",
            "hw-model": "xb6",
            "boot-time": 1_712_000_000,
            "interfaces": ["erouter0", "wlan0"],
        }) else {
            unreachable!()
        };
        fields
    }

    #[test]
    fn test_round_trip_all_alphabets() {
        for encoding in ConveyEncoding::ALL {
            let convey = Convey::new(encoding, sample_fields());
            let encoded = convey.encode();
            let parsed = Convey::parse(&encoded).expect("parses back");
            assert_eq!(parsed.fields(), &sample_fields(), "{encoding:?}");
        }
    }

    #[test]
    fn test_raw_bytes_round_trip_all_alphabets() {
        let payload: Vec<u8> = (0u8..16).collect();
        for encoding in ConveyEncoding::ALL {
            let engine = encoding.engine();
            assert_eq!(engine.decode(engine.encode(&payload)).unwrap(), payload);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Convey::parse("!!! not base64 !!!").is_none());
    }

    #[test]
    fn test_parse_rejects_non_object_json() {
        let encoded = URL_SAFE_NO_PAD.encode(b"[1,2,3]");
        assert!(Convey::parse(&encoded).is_none());
    }

    #[test]
    fn test_from_headers_missing() {
        let headers = HeaderMap::new();
        let (convey, compliance) = Convey::from_headers(&headers);
        assert!(convey.is_none());
        assert_eq!(compliance, Compliance::Missing);
    }

    #[test]
    fn test_from_headers_invalid_still_yields_compliance() {
        let mut headers = HeaderMap::new();
        headers.insert(CONVEY_HEADER, "%%%".parse().unwrap());
        let (convey, compliance) = Convey::from_headers(&headers);
        assert!(convey.is_none());
        assert_eq!(compliance, Compliance::Invalid);
    }

    #[test]
    fn test_from_headers_full() {
        let convey = Convey::new(ConveyEncoding::Std, sample_fields());
        let mut headers = HeaderMap::new();
        headers.insert(CONVEY_HEADER, convey.encode().parse().unwrap());
        let (parsed, compliance) = Convey::from_headers(&headers);
        assert_eq!(compliance, Compliance::Full);
        assert_eq!(parsed.unwrap().get("hw-model"), Some(&json!("xb6")));
    }

    #[test]
    fn test_encoding_name_parsing() {
        assert_eq!(ConveyEncoding::from_str_opt("raw-url"), Some(ConveyEncoding::RawUrl));
        assert_eq!(ConveyEncoding::from_str_opt("std"), Some(ConveyEncoding::Std));
        assert_eq!(ConveyEncoding::from_str_opt("base85"), None);
    }
}

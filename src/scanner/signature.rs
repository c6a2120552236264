use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::wire::{rcode_text, HeaderFlag, Opcode, ResponseHeader};

pub const TIMEOUT_REASON: &str = "timeout";

const KEY_ERROR: &str = "error";
const KEY_LEGACY_ERROR: &str = "other_exception";
const KEY_OPCODE: &str = "Opcode";
const KEY_RCODE: &str = "RCODE";
const KEY_QDCOUNT: &str = "QDCOUNT";
const KEY_ANCOUNT: &str = "ANCOUNT";
const KEY_NSCOUNT: &str = "NSCOUNT";
const KEY_ARCOUNT: &str = "ARCOUNT";
const KEY_TTL: &str = "TTL";

/// Header-level characteristics of one answered probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeaderSignature {
    pub flags: BTreeSet<HeaderFlag>,
    pub opcode: String,
    pub rcode: String,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
    pub ttl_bucket: Option<u8>,
}

impl Default for HeaderSignature {
    fn default() -> Self {
        HeaderSignature {
            flags: BTreeSet::new(),
            opcode: Opcode::Query.to_string(),
            rcode: rcode_text(0),
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
            ttl_bucket: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignatureValue {
    Int(u64),
    Text(String),
}

impl fmt::Display for SignatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureValue::Int(value) => write!(f, "{}", value),
            SignatureValue::Text(value) => f.write_str(value),
        }
    }
}

/// Canonical, order-independent record of how a server answered one test case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Signature {
    Success(HeaderSignature),
    Failure { reason: String },
}

impl Signature {
    pub fn timeout() -> Self {
        Signature::failure(TIMEOUT_REASON)
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Signature::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Signature::Failure { .. })
    }

    /// Every tracked field as a (field, value) pair, sorted by field name.
    pub fn fields(&self) -> Vec<(&'static str, SignatureValue)> {
        let mut fields = match self {
            Signature::Failure { reason } => {
                vec![(KEY_ERROR, SignatureValue::Text(reason.clone()))]
            }
            Signature::Success(header) => {
                let mut fields: Vec<(&'static str, SignatureValue)> = HeaderFlag::ALL
                    .iter()
                    .map(|flag| {
                        let set = header.flags.contains(flag) as u64;
                        (flag.as_str(), SignatureValue::Int(set))
                    })
                    .collect();
                fields.push((KEY_OPCODE, SignatureValue::Text(header.opcode.clone())));
                fields.push((KEY_RCODE, SignatureValue::Text(header.rcode.clone())));
                fields.push((KEY_QDCOUNT, SignatureValue::Int(header.qdcount as u64)));
                fields.push((KEY_ANCOUNT, SignatureValue::Int(header.ancount as u64)));
                fields.push((KEY_NSCOUNT, SignatureValue::Int(header.nscount as u64)));
                fields.push((KEY_ARCOUNT, SignatureValue::Int(header.arcount as u64)));
                if let Some(bucket) = header.ttl_bucket {
                    fields.push((KEY_TTL, SignatureValue::Int(bucket as u64)));
                }
                fields
            }
        };
        fields.sort_by(|a, b| a.0.cmp(b.0));
        fields
    }

    /// Rebuild a signature from loosely ordered fields, e.g. a stored JSON object.
    ///
    /// Tracked fields start at their defaults and are overlaid by whatever is
    /// present; unknown fields are ignored. An `error` (or legacy
    /// `other_exception`) field makes the whole record a failure.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let fields: BTreeMap<&str, &Value> = fields.into_iter().collect();

        for key in [KEY_ERROR, KEY_LEGACY_ERROR] {
            if let Some(reason) = fields.get(key) {
                let reason = match reason {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                return Ok(Signature::Failure { reason });
            }
        }

        let mut header = HeaderSignature::default();
        for (key, value) in fields {
            if let Ok(flag) = key.parse::<HeaderFlag>() {
                if as_int(key, value)? != 0 {
                    header.flags.insert(flag);
                }
                continue;
            }
            match key {
                KEY_OPCODE => {
                    header.opcode = match value {
                        Value::String(text) => text.clone(),
                        other => Opcode::from_code(as_int(key, other)? as u8).to_string(),
                    }
                }
                KEY_RCODE => match value {
                    Value::Null => {}
                    Value::String(text) => header.rcode = text.clone(),
                    other => header.rcode = rcode_text(as_int(key, other)? as u8),
                },
                KEY_QDCOUNT => header.qdcount = as_count(key, value)?,
                KEY_ANCOUNT => header.ancount = as_count(key, value)?,
                KEY_NSCOUNT => header.nscount = as_count(key, value)?,
                KEY_ARCOUNT => header.arcount = as_count(key, value)?,
                KEY_TTL => header.ttl_bucket = Some(as_int(key, value)?.min(1) as u8),
                _ => {}
            }
        }

        Ok(Signature::Success(header))
    }
}

fn as_int(key: &str, value: &Value) -> Result<u64, String> {
    match value {
        Value::Bool(flag) => Ok(*flag as u64),
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| format!("field {} is not a non-negative integer: {}", key, number)),
        other => Err(format!("field {} is not an integer: {}", key, other)),
    }
}

fn as_count(key: &str, value: &Value) -> Result<u16, String> {
    let count = as_int(key, value)?;
    u16::try_from(count).map_err(|_| format!("field {} out of range: {}", key, count))
}

/// Turn a parsed response into its canonical signature.
pub fn canonicalize(response: &ResponseHeader) -> Signature {
    Signature::Success(HeaderSignature {
        flags: response.flags.clone(),
        opcode: response.opcode.to_string(),
        rcode: rcode_text(response.rcode),
        qdcount: response.qdcount,
        ancount: response.ancount,
        nscount: response.nscount,
        arcount: response.arcount,
        ttl_bucket: response.first_answer_ttl.map(|ttl| (ttl > 0) as u8),
    })
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .fields()
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        f.write_str(&rendered.join(","))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = self.fields();
        let mut map = serializer.serialize_map(Some(fields.len()))?;
        for (key, value) in fields {
            match value {
                SignatureValue::Int(number) => map.serialize_entry(key, &number)?,
                SignatureValue::Text(text) => map.serialize_entry(key, &text)?,
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Signature::from_fields(raw.iter().map(|(key, value)| (key.as_str(), value)))
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_order_does_not_change_signature() {
        let first: Signature = serde_json::from_str(
            r#"{"QR": 1, "Opcode": "QUERY", "AA": 0, "RCODE": "REFUSED", "QDCOUNT": 1, "ANCOUNT": 0}"#,
        )
        .unwrap();
        let second: Signature = serde_json::from_str(
            r#"{"ANCOUNT": 0, "QDCOUNT": 1, "RCODE": "REFUSED", "AA": 0, "Opcode": "QUERY", "QR": 1}"#,
        )
        .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let value = json!({"QR": 1, "RCODE": null});
        let pairs = value.as_object().unwrap();
        let signature = Signature::from_fields(pairs.iter().map(|(k, v)| (k.as_str(), v))).unwrap();
        match signature {
            Signature::Success(header) => {
                assert_eq!(header.flags.len(), 1);
                assert_eq!(header.opcode, "QUERY");
                assert_eq!(header.rcode, "NOERROR");
                assert_eq!(header.arcount, 0);
                assert_eq!(header.ttl_bucket, None);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_error_records_become_failures() {
        let timeout: Signature = serde_json::from_str(r#"{"error": "timeout"}"#).unwrap();
        assert_eq!(timeout, Signature::timeout());
        assert_eq!(serde_json::to_string(&timeout).unwrap(), r#"{"error":"timeout"}"#);

        let legacy: Signature =
            serde_json::from_str(r#"{"other_exception": "connection refused"}"#).unwrap();
        assert_eq!(legacy, Signature::failure("connection refused"));
    }

    #[test]
    fn test_canonicalize_tracks_every_field() {
        let header = ResponseHeader {
            id: 7,
            flags: [HeaderFlag::QR, HeaderFlag::RA].into_iter().collect(),
            opcode: Opcode::Status,
            rcode: 4,
            qdcount: 1,
            ancount: 1,
            nscount: 0,
            arcount: 2,
            first_answer_ttl: Some(0),
        };
        let signature = canonicalize(&header);
        let fields = signature.fields();
        assert_eq!(fields.len(), 14);
        assert!(fields.contains(&("QR", SignatureValue::Int(1))));
        assert!(fields.contains(&("CD", SignatureValue::Int(0))));
        assert!(fields.contains(&("Opcode", SignatureValue::Text("STATUS".to_string()))));
        assert!(fields.contains(&("RCODE", SignatureValue::Text("NOTIMP".to_string()))));
        assert!(fields.contains(&("TTL", SignatureValue::Int(0))));

        let keys: Vec<&str> = fields.iter().map(|(key, _)| *key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_stored_signature_reads_back_equal() {
        let header = ResponseHeader {
            id: 1,
            flags: [HeaderFlag::QR, HeaderFlag::AA].into_iter().collect(),
            opcode: Opcode::IQuery,
            rcode: 5,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
            first_answer_ttl: None,
        };
        let signature = canonicalize(&header);
        let stored = serde_json::to_string(&signature).unwrap();
        let restored: Signature = serde_json::from_str(&stored).unwrap();
        assert_eq!(signature, restored);
    }
}

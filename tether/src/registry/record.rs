use faststr::FastStr;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The value advertised under a service key.
///
/// The wire format is a UTF-8 JSON object with this exact field order:
/// `{"timestamp":…,"ip":"…","port":"…","meta":…}`. `meta` is free-form;
/// consumers only interpret `weight` and `healthy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Registration time, unix seconds.
    pub timestamp: i64,
    pub ip: FastStr,
    pub port: FastStr,
    pub meta: Option<Map<String, Value>>,
}

impl InstanceRecord {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn address_str(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Load-balancing weight: integer, float, or integer-valued string.
    /// Absent, malformed, or non-positive values all mean 1.
    pub fn weight(&self) -> u32 {
        let value = match self.meta.as_ref().and_then(|m| m.get("weight")) {
            Some(v) => v,
            None => return 1,
        };
        let parsed = match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        match parsed {
            Some(w) if w > 0 => w as u32,
            _ => 1,
        }
    }

    /// Health flag: boolean, `"true"`/`"1"` string, or numeric 1.
    /// Defaults to healthy.
    pub fn healthy(&self) -> bool {
        match self.meta.as_ref().and_then(|m| m.get("healthy")) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1"),
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            _ => true,
        }
    }
}

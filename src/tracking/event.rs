// src/tracking/event.rs
//! Single tracking events and the request environment they were captured in

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Parameter carrying the numeric site id
pub const SITE_ID_PARAM: &str = "idsite";

/// Parameter carrying the tracked URL
pub const URL_PARAM: &str = "url";

/// Scalar value of a tracking parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ParamValue {
    /// Interpret the value as an integer, parsing strings
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::String(s) => s.trim().parse().ok(),
            ParamValue::Bool(_) | ParamValue::Float(_) => None,
        }
    }

    /// Whether the value can be written to JSON and read back unchanged
    ///
    /// JSON has no NaN or infinity, so such floats would be encoded as
    /// `null` and fail to decode.
    pub fn is_encodable(&self) -> bool {
        match self {
            ParamValue::Float(v) => v.is_finite(),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::String(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

/// One tracking ping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Tracking parameters, e.g. `idsite`, `url`, `action_name`
    params: BTreeMap<String, ParamValue>,

    /// Token supplied with this event, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_auth: Option<String>,

    /// Wall-clock time the event was received
    #[serde(with = "chrono::serde::ts_milliseconds")]
    captured_at: DateTime<Utc>,
}

impl Event {
    /// Create an event captured now
    pub fn new<K, V, I>(params: I) -> Self
    where
        K: Into<String>,
        V: Into<ParamValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            params: params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            token_auth: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_token_auth(mut self, token: impl Into<String>) -> Self {
        self.token_auth = Some(token.into());
        self
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn token_auth(&self) -> Option<&str> {
        self.token_auth.as_deref()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Site the event belongs to, if the `idsite` parameter is a valid id
    pub fn site_id(&self) -> Option<i64> {
        self.param(SITE_ID_PARAM)
            .and_then(ParamValue::as_i64)
            .filter(|id| *id > 0)
    }
}

/// Snapshot of the request context needed to attribute an event later
///
/// Replaying happens outside the ingesting request, so anything the
/// persistence engine reads from the request (client address, user agent,
/// language headers) travels with the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_ip: Option<String>,

    /// Header names are stored lowercased
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    pub fn is_empty(&self) -> bool {
        self.client_ip.is_none() && self.headers.is_empty()
    }
}

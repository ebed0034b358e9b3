//! Dialect translation for the router appliance
//!
//! Maps orchestrator policy vocabulary (algorithm names, versions,
//! Diffie-Hellman groups) onto the values the appliance REST API accepts,
//! and range-checks policy lifetimes. Each resource kind owns its own
//! table; a lookup never crosses kinds.

use serde_json::{Map, Value};

use crate::error::{VpnError, VpnResult};

/// Appliance resources whose attributes need translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    IkePolicy,
    IpsecPolicy,
}

/// A backend value: the appliance mixes keywords and integers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialectValue {
    Str(&'static str),
    Int(u64),
}

impl From<DialectValue> for Value {
    fn from(value: DialectValue) -> Self {
        match value {
            DialectValue::Str(s) => Value::from(s),
            DialectValue::Int(n) => Value::from(n),
        }
    }
}

use DialectValue::{Int, Str};

const IKE_POLICY_DIALECT: &[(&str, DialectValue)] = &[
    // ike_version
    ("v1", Str("v1")),
    // auth_algorithm
    ("sha1", Str("sha")),
    // encryption_algorithm
    ("3des", Str("3des")),
    ("aes-128", Str("aes")),
    ("aes-192", Str("aes192")),
    ("aes-256", Str("aes256")),
    // pfs
    ("group2", Int(2)),
    ("group5", Int(5)),
    ("group14", Int(14)),
];

const IPSEC_POLICY_DIALECT: &[(&str, DialectValue)] = &[
    // auth_algorithm
    ("sha1", Str("esp-sha-hmac")),
    // transform_protocol: the encryption algorithm is always configured,
    // so AH is only ever layered on top of ESP
    ("esp", Str("ah-sha-hmac")),
    ("ah", Str("ah-sha-hmac")),
    ("ah-esp", Str("ah-sha-hmac")),
    // encryption_algorithm
    ("3des", Str("esp-3des")),
    ("aes-128", Str("esp-aes")),
    ("aes-192", Str("esp-192-aes")),
    ("aes-256", Str("esp-256-aes")),
    // pfs
    ("group2", Str("group2")),
    ("group5", Str("group5")),
    ("group14", Str("group14")),
];

impl PolicyKind {
    /// Human readable resource name used in errors and logs
    pub fn title(&self) -> &'static str {
        match self {
            PolicyKind::IkePolicy => "IKE Policy",
            PolicyKind::IpsecPolicy => "IPSec Policy",
        }
    }

    fn table(&self) -> &'static [(&'static str, DialectValue)] {
        match self {
            PolicyKind::IkePolicy => IKE_POLICY_DIALECT,
            PolicyKind::IpsecPolicy => IPSEC_POLICY_DIALECT,
        }
    }

    /// Closed lifetime range in seconds
    pub fn lifetime_range(&self) -> (u64, u64) {
        match self {
            PolicyKind::IkePolicy => (60, 86_400),
            PolicyKind::IpsecPolicy => (120, 2_592_000),
        }
    }
}

/// Map one attribute of `info` into the appliance dialect.
///
/// A missing attribute is an implementation error; a present value with no
/// mapping is a validation failure.
pub fn translate(kind: PolicyKind, attribute: &str, info: &Map<String, Value>) -> VpnResult<Value> {
    let raw = info
        .get(attribute)
        .ok_or_else(|| VpnError::implementation(kind.title(), attribute))?;

    let value = match raw.as_str() {
        Some(s) => s.to_lowercase(),
        None => return Err(VpnError::validation(kind.title(), attribute, raw.to_string())),
    };

    kind.table()
        .iter()
        .find(|(key, _)| *key == value)
        .map(|(_, mapped)| Value::from(*mapped))
        .ok_or_else(|| VpnError::validation(kind.title(), attribute, value))
}

/// Check the policy lifetime is in seconds and within the supported range.
///
/// Returns the value unchanged when valid.
pub fn validate_lifetime(kind: PolicyKind, policy_info: &Map<String, Value>) -> VpnResult<u64> {
    let name = kind.title();
    let lifetime = policy_info
        .get("lifetime")
        .ok_or_else(|| VpnError::implementation(name, "lifetime"))?;

    let units = lifetime
        .get("units")
        .ok_or_else(|| VpnError::implementation(name, "lifetime:units"))?;
    if units.as_str() != Some("seconds") {
        let units = units.as_str().map(str::to_string).unwrap_or_else(|| units.to_string());
        return Err(VpnError::validation(name, "lifetime:units", units));
    }

    let value = lifetime
        .get("value")
        .ok_or_else(|| VpnError::implementation(name, "lifetime:value"))?;
    let seconds = value
        .as_u64()
        .ok_or_else(|| VpnError::validation(name, "lifetime:value", value.to_string()))?;

    let (min, max) = kind.lifetime_range();
    if (min..=max).contains(&seconds) {
        Ok(seconds)
    } else {
        Err(VpnError::validation(name, "lifetime:value", seconds.to_string()))
    }
}

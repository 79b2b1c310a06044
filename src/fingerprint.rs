//! Content addressing for query specifications.
//!
//! A spec's identity is the digest of its canonical serialisation: keys
//! sorted, dates in a single representation, and nested specs replaced by
//! their own fingerprint before hashing, so structurally identical subtrees
//! alias no matter how they were supplied.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::spec::QuerySpec;

/// A 32-character lowercase hex digest identifying one query spec.
///
/// Ids arriving over the wire are wrapped as-is: an id the server has never
/// seen is answered with the `awol` state rather than rejected at parse
/// time, so no validation happens here.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        QueryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the materialised relation for this id, by convention
    /// `x<digest>` in the `cache` schema.
    pub fn table_name(&self) -> String {
        format!("x{}", self.0)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryId({})", self.0)
    }
}

impl From<&str> for QueryId {
    fn from(s: &str) -> Self {
        QueryId(s.to_owned())
    }
}

/// Compute the fingerprint of a spec.
///
/// Deterministic and pure: independent of time, host and process. Two specs
/// differing only in key order or in whether a subexpression was supplied
/// inline produce the same id.
pub fn fingerprint(spec: &QuerySpec) -> QueryId {
    let canonical = canonical_json(spec);
    digest(canonical.as_bytes())
}

/// The canonical serialisation that gets hashed. Also what the cache stores
/// as the authoritative copy of the spec (`get_query_params` returns it).
pub fn canonical_json(spec: &QuerySpec) -> String {
    let value = canonical_value(spec);
    // Object keys are sorted because serde_json's default map is a BTreeMap.
    serde_json::to_string(&value).expect("canonical value serialises")
}

/// Canonical `Value` tree for a spec: the `query_kind` discriminator plus
/// all parameters, with nested specs collapsed to `{"__ref__": <id>}`
/// bottom-up, Merkle-style.
pub fn canonical_value(spec: &QuerySpec) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "query_kind".to_owned(),
        Value::String(spec.kind().name().to_owned()),
    );
    for (key, value) in spec.params() {
        map.insert(key.clone(), canonicalise_param(value));
    }
    Value::Object(map)
}

fn canonicalise_param(value: &Value) -> Value {
    match value {
        Value::Object(_) => match QuerySpec::from_value(value) {
            Ok(nested) => {
                let mut reference = serde_json::Map::new();
                reference.insert(
                    "__ref__".to_owned(),
                    Value::String(fingerprint(&nested).to_string()),
                );
                Value::Object(reference)
            }
            // A plain mapping, not a nested spec: recurse into its values.
            Err(_) => Value::Object(
                value
                    .as_object()
                    .expect("matched object")
                    .iter()
                    .map(|(k, v)| (k.clone(), canonicalise_param(v)))
                    .collect(),
            ),
        },
        Value::Array(items) => Value::Array(items.iter().map(canonicalise_param).collect()),
        Value::String(s) => Value::String(canonical_date(s).unwrap_or_else(|| s.clone())),
        Value::Number(n) => Value::Number(canonical_number(n)),
        other => other.clone(),
    }
}

/// Date values are hashed in one representation: anything that parses as an
/// ISO date is re-emitted zero-padded, so `2016-1-1` and `2016-01-01` alias.
fn canonical_date(s: &str) -> Option<String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|date| date.to_string())
}

/// Numbers likewise: an integral float is re-emitted as the integer it
/// denotes, so `radius: 1` and `radius: 1.0` alias. Floats too large to
/// round-trip through `i64` keep their float form.
fn canonical_number(n: &Number) -> Number {
    if let Some(f) = n.as_f64() {
        if n.is_f64() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
            return Number::from(f as i64);
        }
    }
    n.clone()
}

/// 32 lowercase hex chars: the first 16 bytes of SHA-256 over the canonical
/// bytes. The width matches the `CHAR(32)` columns of the persisted cache
/// layout, and every component that observes ids uses this same digest.
fn digest(bytes: &[u8]) -> QueryId {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let full = format!("{:x}", hasher.finalize());
    QueryId(full[..32].to_owned())
}

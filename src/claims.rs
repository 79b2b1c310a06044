//! Bearer-token claims: which query kinds, at which spatial aggregations,
//! with which permissions.
//!
//! Token issuance is someone else's job; this module is the verifier side
//! of the contract. A token is an RS256 JWT signed by the auth service and
//! checked against `TOKEN_VERIFIER_PUBLIC_KEY`. Unverified requests never
//! reach the server.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

use crate::error::Result;

/// The permission an action requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    Run,
    Poll,
    GetResult,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Run => "run",
            Permission::Poll => "poll",
            Permission::GetResult => "get_result",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind capabilities inside a token.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct KindClaims {
    #[serde(default)]
    pub permissions: HashMap<String, bool>,
    /// Aggregation units this caller may see results at.
    #[serde(default)]
    pub spatial_aggregation: Vec<String>,
}

/// The decoded claims set, keyed by `query_kind`.
#[derive(Clone, Debug, Deserialize)]
pub struct Claims {
    pub identity: String,
    #[allow(dead_code)]
    exp: u64,
    #[serde(default)]
    pub user_claims: HashMap<String, KindClaims>,
}

impl Claims {
    /// Whether this caller may perform `permission` on `kind`, at
    /// `aggregation_unit` when the kind is spatially scoped.
    pub fn allows(&self, kind: &str, permission: Permission, aggregation_unit: Option<&str>) -> bool {
        let Some(kind_claims) = self.user_claims.get(kind) else {
            return false;
        };
        if !kind_claims
            .permissions
            .get(permission.as_str())
            .copied()
            .unwrap_or(false)
        {
            return false;
        }
        match aggregation_unit {
            Some(unit) => kind_claims.spatial_aggregation.iter().any(|u| u == unit),
            None => true,
        }
    }
}

/// RS256 verifier over the auth service's public key.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn from_pem(pem: &str) -> Result<TokenVerifier> {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        Ok(TokenVerifier { key, validation })
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims() -> Claims {
        serde_json::from_value(json!({
            "identity": "analyst",
            "exp": 4102444800u64,
            "user_claims": {
                "daily_location": {
                    "permissions": {"run": true, "poll": true, "get_result": false},
                    "spatial_aggregation": ["admin3"],
                },
                "dummy_query": {
                    "permissions": {"run": true, "poll": true, "get_result": true},
                },
            },
        }))
        .unwrap()
    }

    #[test]
    fn permission_and_unit_are_both_checked() {
        let c = claims();
        assert!(c.allows("daily_location", Permission::Run, Some("admin3")));
        assert!(!c.allows("daily_location", Permission::Run, Some("admin1")));
        assert!(!c.allows("daily_location", Permission::GetResult, Some("admin3")));
        assert!(!c.allows("modal_location", Permission::Run, Some("admin3")));
    }

    #[test]
    fn kinds_without_spatial_scope_skip_the_unit_check() {
        let c = claims();
        assert!(c.allows("dummy_query", Permission::GetResult, None));
        assert!(!c.allows("dummy_query", Permission::GetResult, Some("admin3")));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(TokenVerifier::from_pem("not a key").is_err());
    }
}

//! Signed bearer tokens.
//!
//! Every caller — human, agent, or integration — presents the same token
//! format; there is no cheaper credential for "internal" traffic. A token
//! is a dot-separated payload plus a SHA-256 keyed signature:
//!
//!   arb1.<principal>.<role>.<scope+scope>.<expiry-unix>.<sig-hex>
//!
//! The signature covers the full payload, so any altered segment — id,
//! role, scopes, or expiry — invalidates the token.

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

use arbiter_contracts::{
    error::{ArbiterError, ArbiterResult},
    principal::{Principal, PrincipalId, Role, Scope},
};

/// Token format marker and version.
const TOKEN_PREFIX: &str = "arb1";

/// Separator between scope names inside the scope segment.
const SCOPE_SEPARATOR: char = '+';

/// Compute the signature for a token payload under `secret`.
///
/// Returns a lowercase 64-character hex string.
fn sign(secret: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b".");
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Issue a signed token for `principal`, valid until `expires_at`.
///
/// Fails with `ConfigError` when a segment would break the token framing —
/// empty id or role, or a `.`/`+` inside any component.
pub fn issue_token(
    secret: &str,
    principal: &Principal,
    expires_at: DateTime<Utc>,
) -> ArbiterResult<String> {
    let components: Vec<&str> = std::iter::once(principal.id.0.as_str())
        .chain(std::iter::once(principal.role.0.as_str()))
        .chain(principal.scopes.iter().map(|s| s.0.as_str()))
        .collect();
    for component in &components {
        if component.contains('.') || component.contains(SCOPE_SEPARATOR) {
            return Err(ArbiterError::ConfigError {
                reason: format!("token component '{}' contains a reserved character", component),
            });
        }
    }
    if principal.id.0.is_empty() || principal.role.0.is_empty() {
        return Err(ArbiterError::ConfigError {
            reason: "token principal id and role must be non-empty".to_string(),
        });
    }

    let scopes = principal
        .scopes
        .iter()
        .map(|s| s.0.as_str())
        .collect::<Vec<_>>()
        .join(&SCOPE_SEPARATOR.to_string());

    let payload = format!(
        "{TOKEN_PREFIX}.{}.{}.{}.{}",
        principal.id.0,
        principal.role.0,
        scopes,
        expires_at.timestamp()
    );
    let signature = sign(secret, &payload);

    Ok(format!("{payload}.{signature}"))
}

/// Verify `token` under `secret` and reconstruct its principal.
///
/// Verification order: framing, then signature, then expiry — an attacker
/// learns nothing about expiry from a token they could not sign.
///
/// # Errors
///
/// `InvalidCredential` for malformed framing or a signature mismatch;
/// `ExpiredCredential` for a well-signed token past its expiry.
pub fn verify_token(secret: &str, token: &str, now: DateTime<Utc>) -> ArbiterResult<Principal> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 6 {
        return Err(ArbiterError::InvalidCredential {
            reason: format!("expected 6 token segments, found {}", parts.len()),
        });
    }

    let [prefix, id, role, scopes, expiry, signature] = [
        parts[0], parts[1], parts[2], parts[3], parts[4], parts[5],
    ];

    if prefix != TOKEN_PREFIX {
        return Err(ArbiterError::InvalidCredential {
            reason: format!("unknown token prefix '{prefix}'"),
        });
    }
    if id.is_empty() || role.is_empty() {
        return Err(ArbiterError::InvalidCredential {
            reason: "token principal id and role must be non-empty".to_string(),
        });
    }

    let payload = format!("{prefix}.{id}.{role}.{scopes}.{expiry}");
    if sign(secret, &payload) != signature {
        return Err(ArbiterError::InvalidCredential {
            reason: "signature mismatch".to_string(),
        });
    }

    let expiry_secs: i64 = expiry.parse().map_err(|_| ArbiterError::InvalidCredential {
        reason: format!("unparseable expiry '{expiry}'"),
    })?;
    let expires_at = Utc
        .timestamp_opt(expiry_secs, 0)
        .single()
        .ok_or_else(|| ArbiterError::InvalidCredential {
            reason: format!("expiry '{expiry}' out of range"),
        })?;
    if expires_at < now {
        return Err(ArbiterError::ExpiredCredential { expired_at: expires_at });
    }

    Ok(Principal {
        id: PrincipalId::new(id),
        role: Role::new(role),
        scopes: scopes
            .split(SCOPE_SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(Scope::new)
            .collect(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use arbiter_contracts::{
        error::ArbiterError,
        principal::{Principal, PrincipalId, Role, Scope},
    };

    use super::{issue_token, verify_token};

    fn analyst() -> Principal {
        Principal {
            id: PrincipalId::new("analyst-1"),
            role: Role::new("analyst"),
            scopes: vec![Scope::new("pipeline:start"), Scope::new("pipeline:read")],
        }
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    /// A freshly issued token verifies back to the same principal.
    #[test]
    fn test_token_round_trip() {
        let token = issue_token("secret", &analyst(), now() + Duration::hours(1)).unwrap();
        let principal = verify_token("secret", &token, now()).unwrap();
        assert_eq!(principal, analyst());
    }

    /// A token with no scopes round-trips with an empty scope list.
    #[test]
    fn test_token_empty_scopes() {
        let bare = Principal {
            id: PrincipalId::new("probe"),
            role: Role::new("integration"),
            scopes: vec![],
        };
        let token = issue_token("secret", &bare, now() + Duration::hours(1)).unwrap();
        let principal = verify_token("secret", &token, now()).unwrap();
        assert!(principal.scopes.is_empty());
    }

    /// Altering any payload segment invalidates the signature.
    #[test]
    fn test_tampered_token_rejected() {
        let token = issue_token("secret", &analyst(), now() + Duration::hours(1)).unwrap();
        let tampered = token.replace("analyst-1", "admin-1");
        let result = verify_token("secret", &tampered, now());
        assert!(matches!(result, Err(ArbiterError::InvalidCredential { .. })));
    }

    /// A token signed under a different secret does not verify.
    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token("secret-a", &analyst(), now() + Duration::hours(1)).unwrap();
        let result = verify_token("secret-b", &token, now());
        assert!(matches!(result, Err(ArbiterError::InvalidCredential { .. })));
    }

    /// Garbage is InvalidCredential, not a panic.
    #[test]
    fn test_malformed_token_rejected() {
        for garbage in ["", "arb1", "not.a.token", "arb1.a.b.c.d.e.f.g"] {
            let result = verify_token("secret", garbage, now());
            assert!(
                matches!(result, Err(ArbiterError::InvalidCredential { .. })),
                "'{garbage}' should be invalid"
            );
        }
    }

    /// An expired token fails with ExpiredCredential, carrying the expiry.
    #[test]
    fn test_expired_token() {
        let expiry = now() - Duration::minutes(5);
        let token = issue_token("secret", &analyst(), expiry).unwrap();
        match verify_token("secret", &token, now()) {
            Err(ArbiterError::ExpiredCredential { expired_at }) => {
                assert_eq!(expired_at, expiry);
            }
            other => panic!("expected ExpiredCredential, got {:?}", other),
        }
    }

    /// Reserved characters in principal components are refused at issue time.
    #[test]
    fn test_reserved_characters_refused() {
        let bad = Principal {
            id: PrincipalId::new("dotted.id"),
            role: Role::new("analyst"),
            scopes: vec![],
        };
        let result = issue_token("secret", &bad, now() + Duration::hours(1));
        assert!(matches!(result, Err(ArbiterError::ConfigError { .. })));
    }
}

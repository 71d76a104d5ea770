//! JWT account verification against an issuer-keyed HMAC secret map.
//! `jsonwebtoken` handles the decode/verify step rather than hand-rolling
//! HMAC-SHA256 and base64url framing.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::Settings;
use crate::error::AppError;
use crate::protocol::RequestIdentity;

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(rename = "sub")]
    account: String,
    iss: String,
}

/// Verifies `token` against the secret registered for its claimed issuer
/// (falling back to the `*` entry), returning the resolved account/issuer.
/// Returns `Unauthorized` for any malformed, unverifiable, or unknown-issuer
/// token so callers cannot distinguish the failure modes.
pub fn verify(settings: &Settings, token: &str) -> Result<RequestIdentity, AppError> {
    let unverified = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(&[]),
        &{
            let mut v = Validation::new(Algorithm::HS256);
            v.insecure_disable_signature_validation();
            v.validate_exp = false;
            v
        },
    )
    .map_err(|_| AppError::Unauthorized)?;

    let issuer = unverified.claims.iss.clone();
    let secret = settings
        .jwt_secrets_by_issuer
        .get(&issuer)
        .or_else(|| settings.jwt_secrets_by_issuer.get("*"))
        .ok_or(AppError::Unauthorized)?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[issuer.clone()]);

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation).map_err(|_| AppError::Unauthorized)?;

    Ok(RequestIdentity { remote_ip: String::new(), account: data.claims.account, issuer: data.claims.iss })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::collections::HashMap;

    #[derive(serde::Serialize)]
    struct SignClaims<'a> {
        sub: &'a str,
        iss: &'a str,
    }

    fn settings_with_secret(issuer: &str, secret: &str) -> Settings {
        let mut map = HashMap::new();
        map.insert(issuer.to_string(), secret.to_string());
        Settings {
            server: ServerConfig {
                listen_address: "127.0.0.1:8080".into(),
                base_path: "/files".into(),
                cors_origins: Vec::new(),
                trusted_reverse_proxy_ranges: Vec::new(),
                require_jwt_account: false,
            },
            storage: StorageConfig { path: "/tmp".into(), shard_layers: 3, maximum_upload_size: 1024 },
            database: DatabaseConfig { kind: DatabaseKind::Sqlite, dsn: "sqlite::memory:".into() },
            expiration: ExpirationConfig { anonymous_ttl_seconds: 1, identified_ttl_seconds: 1, check_interval_seconds: 1, grace_seconds: 1 },
            pre_finish_commands: Vec::new(),
            jwt_secrets_by_issuer: map,
            otlp_endpoint: None,
        }
    }

    #[test]
    fn verifies_token_signed_with_the_registered_secret() {
        let settings = settings_with_secret("issuer.example", "topsecret");
        let token = encode(
            &Header::new(Algorithm::HS256),
            &SignClaims { sub: "alice", iss: "issuer.example" },
            &EncodingKey::from_secret(b"topsecret"),
        )
        .unwrap();

        let identity = verify(&settings, &token).unwrap();
        assert_eq!(identity.account, "alice");
        assert_eq!(identity.issuer, "issuer.example");
    }

    #[test]
    fn rejects_token_signed_with_wrong_secret() {
        let settings = settings_with_secret("issuer.example", "topsecret");
        let token = encode(
            &Header::new(Algorithm::HS256),
            &SignClaims { sub: "alice", iss: "issuer.example" },
            &EncodingKey::from_secret(b"wrongsecret"),
        )
        .unwrap();

        let err = verify(&settings, &token).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[test]
    fn rejects_unknown_issuer_without_wildcard_secret() {
        let settings = settings_with_secret("issuer.example", "topsecret");
        let token = encode(
            &Header::new(Algorithm::HS256),
            &SignClaims { sub: "alice", iss: "other.example" },
            &EncodingKey::from_secret(b"whatever"),
        )
        .unwrap();

        let err = verify(&settings, &token).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }
}

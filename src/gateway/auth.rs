//! Agent-token validation policy hook.
//!
//! When `SKYBRIDGE_JWT_SECRET` (wired into [`GatewayConfig`]) is set, the
//! token presented at registration must be an HS256 JWT whose `sub` claim
//! equals the registering agent id. When unset, any token is accepted —
//! the development path. Deployers needing a different scheme replace
//! this module.
//!
//! [`GatewayConfig`]: super::GatewayConfig

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct AgentClaims {
    /// Subject — must match the registering agent id.
    sub: String,
}

/// Validate a registration token against the configured secret.
///
/// Returns the rejection reason on failure; the caller turns it into a
/// `RegisterAck{success: false}` reply.
pub(super) fn validate_agent_token(
    secret: Option<&str>,
    agent_id: &str,
    token: &str,
) -> Result<(), String> {
    let Some(secret) = secret else {
        // Dev mode: no secret configured, accept any token.
        return Ok(());
    };
    if token.is_empty() {
        return Err("agent token is required".to_string());
    }
    let key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<AgentClaims>(token, &key, &validation)
        .map_err(|e| format!("token verification failed: {}", e))?;
    if data.claims.sub != agent_id {
        return Err(format!(
            "token subject {:?} does not match agent id {:?}",
            data.claims.sub, agent_id
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Claims {
        sub: String,
        exp: i64,
    }

    fn token_for(sub: &str, secret: &str, exp_offset_secs: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn dev_mode_accepts_anything() {
        assert!(validate_agent_token(None, "a1", "").is_ok());
        assert!(validate_agent_token(None, "a1", "garbage").is_ok());
    }

    #[test]
    fn valid_token_with_matching_subject_passes() {
        let token = token_for("a1", "s3cret", 600);
        assert!(validate_agent_token(Some("s3cret"), "a1", &token).is_ok());
    }

    #[test]
    fn subject_mismatch_is_rejected() {
        let token = token_for("a2", "s3cret", 600);
        let err = validate_agent_token(Some("s3cret"), "a1", &token).unwrap_err();
        assert!(err.contains("does not match"));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = token_for("a1", "other", 600);
        assert!(validate_agent_token(Some("s3cret"), "a1", &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = token_for("a1", "s3cret", -600);
        assert!(validate_agent_token(Some("s3cret"), "a1", &token).is_err());
    }

    #[test]
    fn empty_token_with_secret_is_rejected() {
        assert!(validate_agent_token(Some("s3cret"), "a1", "").is_err());
    }
}

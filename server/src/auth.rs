//! Pluggable post-handshake credential check (spec §4.2, §9; SPEC_FULL.md
//! §B.5). Concrete validation against an external IAM system is out of
//! scope (spec §1's "external collaborators"); this is the seam plus a
//! default implementation usable standalone.

use async_trait::async_trait;
use tunnel_protocol::envelope::AuthMethod;
use tunnel_protocol::session::AuthValidator;

/// Accepts any `auth_request` whose method matches the configured
/// expected method and whose credential is non-empty. Real deployments
/// plug in a validator that checks the credential against an external
/// authority; this default only enforces shape.
pub struct ExpectedMethodValidator {
    expected_method: String,
}

impl ExpectedMethodValidator {
    pub fn new(expected_method: String) -> Self {
        Self { expected_method }
    }
}

#[async_trait]
impl AuthValidator for ExpectedMethodValidator {
    async fn validate(&self, method: &AuthMethod, credential: &[u8]) -> Result<(), String> {
        if method != &self.expected_method {
            return Err(format!("unexpected auth method `{method}`"));
        }
        if credential.is_empty() {
            return Err("empty credential".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_matching_method_with_nonempty_credential() {
        let v = ExpectedMethodValidator::new("bearer".into());
        assert!(v.validate(&"bearer".to_string(), b"token").await.is_ok());
    }

    #[tokio::test]
    async fn rejects_wrong_method() {
        let v = ExpectedMethodValidator::new("bearer".into());
        assert!(v.validate(&"basic".to_string(), b"token").await.is_err());
    }

    #[tokio::test]
    async fn rejects_empty_credential() {
        let v = ExpectedMethodValidator::new("bearer".into());
        assert!(v.validate(&"bearer".to_string(), b"").await.is_err());
    }
}

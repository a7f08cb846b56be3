use tracing::{info, warn};

use crate::registry::{KeyRegistry, Registration};

/// Result of checking one offered public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Known key.
    Accepted,
    /// Unknown key, stored because auto-registration is on.
    Registered,
    /// Unknown key and auto-registration is off. The registry is untouched.
    Rejected,
    /// The registry could not be consulted. The key is neither trusted nor
    /// refused; the session reports this and ends with its own exit code.
    Indeterminate(String),
}

impl AuthOutcome {
    /// Whether the transport should let the connection proceed to a session.
    pub fn admits(&self) -> bool {
        !matches!(self, AuthOutcome::Rejected)
    }
}

#[derive(Clone)]
pub struct Authorizer {
    registry: KeyRegistry,
    auto_register: bool,
}

impl Authorizer {
    pub fn new(registry: KeyRegistry, auto_register: bool) -> Self {
        Self {
            registry,
            auto_register,
        }
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub async fn authorize(&self, fingerprint: &str, public_key: &[u8]) -> AuthOutcome {
        let exists = match self.registry.exists(fingerprint).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!(fingerprint, error = %err, "key lookup failed");
                return AuthOutcome::Indeterminate(err.to_string());
            }
        };

        let outcome = if exists {
            AuthOutcome::Accepted
        } else if !self.auto_register {
            info!(fingerprint, "unknown key rejected");
            return AuthOutcome::Rejected;
        } else {
            match self.registry.register(fingerprint, public_key).await {
                Ok(Registration::Created) => {
                    info!(fingerprint, "auto-registered new key");
                    AuthOutcome::Registered
                }
                // Lost a race with a concurrent first connection.
                Ok(Registration::AlreadyExists) => AuthOutcome::Accepted,
                Err(err) => {
                    warn!(fingerprint, error = %err, "key registration failed");
                    return AuthOutcome::Indeterminate(err.to_string());
                }
            }
        };

        if let Err(err) = self.registry.touch_last_used(fingerprint).await {
            warn!(fingerprint, error = %err, "failed to update key last-used time");
        }
        info!(fingerprint, "authenticated");
        outcome
    }
}

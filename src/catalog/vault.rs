//! Credential decryption boundary.

use thiserror::Error;

/// Errors raised while revealing a sealed credential.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The sealed value could not be opened.
    #[error("Credential could not be decrypted: {0}")]
    Unseal(String),
}

/// Reveals credentials stored encrypted by the CRUD layer.
pub trait CredentialVault: Send + Sync {
    /// Return the plaintext credential.
    fn reveal(&self, sealed: &str) -> Result<String, VaultError>;
}

/// Vault for deployments where the catalog already stores plaintext keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextVault;

impl CredentialVault for PlaintextVault {
    fn reveal(&self, sealed: &str) -> Result<String, VaultError> {
        let trimmed = sealed.trim();
        if trimmed.is_empty() {
            return Err(VaultError::Unseal("credential is empty".into()));
        }
        Ok(trimmed.to_string())
    }
}

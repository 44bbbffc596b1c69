//! Wallet Manager
//!
//! Loads and signs with the operator's Solana keypair. Two sources: a
//! JSON-array keypair file, or a base64 secret from the environment for
//! containerised deployments.

use base64::Engine as _;
use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::Transaction,
};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Failed to load keypair: {0}")]
    LoadError(String),

    #[error("Invalid keypair bytes: {0}")]
    InvalidKeypair(String),

    #[error("Failed to sign transaction: {0}")]
    SigningError(String),

    #[error("Unsafe keypair file permissions: {0:o} (expected 600 or stricter)")]
    UnsafePermissions(u32),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub struct WalletManager {
    keypair: Keypair,
}

impl WalletManager {
    /// Load a keypair from a JSON-array file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let contents = fs::read_to_string(path.as_ref())
            .map_err(|e| WalletError::LoadError(format!("Failed to read file: {}", e)))?;

        let bytes: Vec<u8> = serde_json::from_str(&contents)
            .map_err(|e| WalletError::LoadError(format!("Invalid JSON format: {}", e)))?;

        Self::from_bytes(&bytes)
    }

    /// Load a keypair from a base64-encoded secret
    pub fn from_base64(encoded: &str) -> Result<Self, WalletError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| WalletError::LoadError(format!("Invalid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        let keypair =
            Keypair::try_from(bytes).map_err(|e| WalletError::InvalidKeypair(e.to_string()))?;
        Ok(Self { keypair })
    }

    /// Random keypair for tests and simulation
    pub fn new_random() -> Self {
        Self {
            keypair: Keypair::new(),
        }
    }

    /// Refuse keypair files readable by group or other. Unix only; other
    /// platforms pass.
    pub fn check_file_permissions<P: AsRef<Path>>(path: P) -> Result<(), WalletError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(path.as_ref())?;
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(WalletError::UnsafePermissions(mode & 0o777));
            }
        }
        #[cfg(not(unix))]
        {
            let _ = path;
        }
        Ok(())
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn public_key(&self) -> String {
        self.keypair.pubkey().to_string()
    }

    pub fn sign_transaction(&self, transaction: &mut Transaction) -> Result<(), WalletError> {
        transaction
            .try_sign(&[&self.keypair], transaction.message.recent_blockhash)
            .map_err(|e| WalletError::SigningError(e.to_string()))
    }

    pub fn sign_message(&self, message: &[u8]) -> Signature {
        self.keypair.sign_message(message)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl Clone for WalletManager {
    fn clone(&self) -> Self {
        Self {
            keypair: Keypair::try_from(&self.keypair.to_bytes()[..])
                .expect("keypair bytes roundtrip"),
        }
    }
}

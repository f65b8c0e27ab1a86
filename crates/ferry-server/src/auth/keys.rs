//! SSH host key handling and shared-token checks

use std::path::Path;

use russh_keys::key::KeyPair;

use crate::error::BrokerError;

/// Load the broker's host key, generating one when needed
///
/// With a path, an existing key is loaded and a missing one is generated
/// and written there as PKCS#8 PEM. Without a path the key lives in memory
/// only and changes on every start.
pub async fn load_or_generate_host_key(path: Option<&Path>) -> Result<KeyPair, BrokerError> {
    let Some(path) = path else {
        tracing::warn!("No host key path configured - using an ephemeral host key");
        return generate();
    };

    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        return russh_keys::load_secret_key(path, None)
            .map_err(|e| BrokerError::HostKey(format!("failed to load {:?}: {}", path, e)));
    }

    tracing::info!("Generating new host key at {:?}", path);
    let key = generate()?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem)
        .map_err(|e| BrokerError::HostKey(format!("failed to encode host key: {}", e)))?;
    tokio::fs::write(path, &pem).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(key)
}

fn generate() -> Result<KeyPair, BrokerError> {
    KeyPair::generate_ed25519()
        .ok_or_else(|| BrokerError::HostKey("failed to generate Ed25519 key".to_string()))
}

/// Check a presented password against the configured token
///
/// No configured token accepts everyone.
pub fn check_token(expected: Option<&str>, presented: &str) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    // Compare every byte so timing does not leak the matching prefix
    expected.len() == presented.len()
        && expected
            .bytes()
            .zip(presented.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

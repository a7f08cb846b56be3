use std::path::Path;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tracing::info;

/// Loads the server's private key, generating and persisting an ed25519 key
/// on first start.
pub fn load_or_generate(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load host key {}", path.display()))?;
        info!(path = %path.display(), "loaded host key");
        return Ok(key);
    }

    info!(path = %path.display(), "host key not found; generating ed25519 key");
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create host key directory {}", parent.display()))?;
    }
    let key = KeyPair::generate_ed25519().context("failed to generate ed25519 host key")?;
    let file = create_private(path)?;
    russh_keys::encode_pkcs8_pem(&key, file)
        .with_context(|| format!("failed to write host key {}", path.display()))?;
    Ok(key)
}

#[cfg(unix)]
fn create_private(path: &Path) -> Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create host key {}", path.display()))
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> Result<std::fs::File> {
    std::fs::File::create(path).with_context(|| format!("failed to create host key {}", path.display()))
}

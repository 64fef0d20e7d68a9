//! Beacon Node -- library crate for the proximity mesh node.
//!
//! Re-exports all internal modules so integration tests and main.rs can
//! build meshes over any transport.

pub mod config;
pub mod lookup;
pub mod mesh;
pub mod transport;

use beacon_protocol::{HexId, ID_LEN};
use std::path::{Path, PathBuf};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Resolve this device's hex ID: the configured one, else the one stored at
/// `path`, else a fresh random one written there.
pub fn load_or_create_hex_id(configured: Option<&str>, path: &Path) -> anyhow::Result<HexId> {
    if let Some(raw) = configured {
        return Ok(HexId::parse(raw)?);
    }
    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        return Ok(HexId::parse(raw.trim())?);
    }

    use rand::Rng;
    let raw: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect();
    let id = HexId::parse(&raw)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, id.as_str())?;

    tracing::info!(path = %path.display(), id = %id, "generated hex id");
    Ok(id)
}

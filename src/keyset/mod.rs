//! Keyset decoding: turns a RedRat `KeyManager` XML export into a
//! [`KeysetCatalogue`] of canonical [`IRWaveform`]s.

mod decoder;
mod waveform;

pub use decoder::decode_catalogue;
pub use waveform::{IRWaveform, KeysetCatalogue};

use std::path::Path;

use crate::error::{DispatchError, Result};

/// Load and decode a keyset file from disk.
pub async fn load_catalogue(path: impl AsRef<Path>) -> Result<KeysetCatalogue> {
    let path = path.as_ref();
    let xml = tokio::fs::read_to_string(path).await.map_err(|e| {
        DispatchError::BadKeyset(format!("failed to read keyset {}: {e}", path.display()))
    })?;
    decode_catalogue(&xml)
}

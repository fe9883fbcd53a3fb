use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nostr_sdk::prelude::*;
use serde_json::json;

/// Reads `{ "secret_key": <hex|nsec> }`, creating a fresh identity on first use.
pub fn load_or_create_keys(path: &Path) -> Result<Keys> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read identity {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&raw).context("parse identity json")?;
        let secret = value
            .get("secret_key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("identity file missing secret_key"))?;
        return Keys::parse(secret).context("parse secret key");
    }

    let keys = Keys::generate();
    let body = json!({
        "secret_key": keys.secret_key().to_secret_hex(),
        "public_key": keys.public_key().to_hex(),
    });
    std::fs::write(path, serde_json::to_vec_pretty(&body)?)
        .with_context(|| format!("write identity {}", path.display()))?;
    Ok(keys)
}

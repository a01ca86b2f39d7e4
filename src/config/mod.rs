//! Frozen-at-read engine configuration (spec §3 `Configuration`).

pub mod pool;

pub use pool::{Configuration, ResourceLimits};

/// Load `.env` into the process environment if present, then deserialize
/// `Configuration` from the `ENGINE_CONFIG` environment variable (a JSON
/// blob) or fall back to [`Configuration::default`].
///
/// Mirrors the teacher's `dotenvy::dotenv().ok()` call at the top of its
/// config-loading path: a missing `.env` file is not an error, only a
/// malformed `ENGINE_CONFIG` value is.
pub fn load_from_env() -> crate::core::error::AppResult<Configuration> {
    let _ = dotenvy::dotenv();
    match std::env::var("ENGINE_CONFIG") {
        Ok(raw) => Configuration::from_json_str(&raw).map_err(anyhow::Error::msg),
        Err(std::env::VarError::NotPresent) => Ok(Configuration::default()),
        Err(e) => Err(anyhow::Error::new(e).context("reading ENGINE_CONFIG")),
    }
}

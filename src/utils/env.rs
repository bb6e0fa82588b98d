// src/utils/env.rs

use anyhow::{Context, Result};
use log::{debug, info};
use std::path::Path;

/// Loads `.env` from the working directory or its parents, if there is one.
pub fn load_env() {
    match dotenv::dotenv() {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(_) => debug!("No .env file found, using process environment"),
    }
}

/// Loads an explicitly requested env file. Unlike [`load_env`], a missing
/// file is an error.
pub fn load_env_from(path: &Path) -> Result<()> {
    dotenv::from_path(path)
        .with_context(|| format!("Failed to load env file {}", path.display()))?;
    info!("Loaded environment from {}", path.display());
    Ok(())
}

/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration module
//!
//! Loads the YAML configuration file and validates it before any upstream
//! is built.

use crate::config::types::Config;
use crate::core::error::Result;
use std::fs;
use std::path::Path;

pub mod types;

/// Load and parse configuration from YAML file
///
/// # Errors
/// Returns an error if the file cannot be read, if YAML parsing fails, or if validation fails.
pub fn init(file: &Path) -> Result<Config> {
    let string = fs::read_to_string(file)?;
    parse(&string)
}

/// Parse and validate configuration text
pub fn parse(text: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(text)?;
    config.validate()?;

    eprintln!(
        "Configuration loaded and validated: {} upstream(s), policy {}",
        config.forward.upstreams.len(),
        config.forward.policy
    );
    Ok(config)
}

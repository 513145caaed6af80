//! Policy serialization.
//!
//! Two forms, both lossless:
//! - stable: compact JSON with a fixed field order, for consumers that diff or hash it
//! - pretty: a TOML document, the same shape as a `[[policies]]` entry in a config file
//!
//! Decoding validates; a bundle that parses but breaks a range rule is rejected.

use crate::config::validation::validate_policy;
use crate::config::Policy;
use crate::error::ResilienceError;

pub fn to_json(policy: &Policy) -> Result<String, ResilienceError> {
    serde_json::to_string(policy)
        .map_err(|e| ResilienceError::Configuration(format!("cannot encode policy: {}", e)))
}

pub fn from_json(input: &str) -> Result<Policy, ResilienceError> {
    let policy: Policy = serde_json::from_str(input)
        .map_err(|e| ResilienceError::Configuration(format!("invalid policy JSON: {}", e)))?;
    validate_policy(&policy).map_err(ResilienceError::Validation)?;
    Ok(policy)
}

pub fn to_pretty(policy: &Policy) -> Result<String, ResilienceError> {
    toml::to_string_pretty(policy)
        .map_err(|e| ResilienceError::Configuration(format!("cannot encode policy: {}", e)))
}

pub fn from_pretty(input: &str) -> Result<Policy, ResilienceError> {
    let policy: Policy = toml::from_str(input)
        .map_err(|e| ResilienceError::Configuration(format!("invalid policy TOML: {}", e)))?;
    validate_policy(&policy).map_err(ResilienceError::Validation)?;
    Ok(policy)
}

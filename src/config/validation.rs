use crate::config::types::{
    Config, CrawlerConfig, ProbeConfig, RejectConfig, SeedConfig, StatsConfig, StorageConfig,
};
use crate::node::{parse_address, IpBlocklist};
use crate::ConfigError;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_probe_config(&config.probes)?;
    validate_storage_config(&config.storage)?;
    validate_stats_config(&config.stats)?;
    validate_reject_config(&config.reject)?;
    validate_seeds(&config.seeds)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.threads < 1 || config.threads > 1024 {
        return Err(ConfigError::Validation(format!(
            "threads must be between 1 and 1024, got {}",
            config.threads
        )));
    }

    if config.node_threads < 1 || config.node_threads > 64 {
        return Err(ConfigError::Validation(format!(
            "node_threads must be between 1 and 64, got {}",
            config.node_threads
        )));
    }

    if config.error_limit == Some(0) {
        return Err(ConfigError::Validation(
            "error_limit must be >= 1".to_string(),
        ));
    }

    if config.stagnation_limit < 1 {
        return Err(ConfigError::Validation(
            "stagnation_limit must be >= 1".to_string(),
        ));
    }

    if config.nominal_rtt_ms == 0 {
        return Err(ConfigError::Validation(
            "nominal_rtt_ms must be > 0".to_string(),
        ));
    }

    if config.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "poll_interval_ms must be > 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_probe_config(config: &ProbeConfig) -> Result<(), ConfigError> {
    if config.record_attempts < 1 || config.record_attempts > 10 {
        return Err(ConfigError::Validation(format!(
            "record_attempts must be between 1 and 10, got {}",
            config.record_attempts
        )));
    }
    Ok(())
}

/// Validates storage configuration
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if let Some(epoch) = &config.epoch {
        validate_epoch(epoch)?;
    }

    Ok(())
}

/// Validates an epoch name
///
/// Epochs are embedded in store keys between ':' separators.
pub fn validate_epoch(epoch: &str) -> Result<(), ConfigError> {
    if epoch.is_empty() {
        return Err(ConfigError::Validation("epoch cannot be empty".to_string()));
    }

    if epoch.contains(':') {
        return Err(ConfigError::Validation(format!(
            "epoch must not contain ':', got '{}'",
            epoch
        )));
    }

    Ok(())
}

fn validate_stats_config(config: &StatsConfig) -> Result<(), ConfigError> {
    if config.enabled && config.socket_path.is_empty() {
        return Err(ConfigError::Validation(
            "socket_path cannot be empty when stats are enabled".to_string(),
        ));
    }
    Ok(())
}

fn validate_reject_config(config: &RejectConfig) -> Result<(), ConfigError> {
    IpBlocklist::from_config(config)?;
    Ok(())
}

fn validate_seeds(config: &SeedConfig) -> Result<(), ConfigError> {
    for seed in &config.nodes {
        parse_address(seed)
            .map_err(|e| ConfigError::InvalidAddress(format!("Invalid seed '{}': {}", seed, e)))?;
    }
    Ok(())
}

use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use peer_atlas::config::load_config;
///
/// let config = load_config(Path::new("atlas.toml")).unwrap();
/// println!("Crawl sessions: {}", config.crawler.threads);
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parses and validates configuration text
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Hex-encoded SHA-256 of the configuration text
///
/// Persisted with the epoch to detect a configuration change on resume.
fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    Ok((config, hash_content(&content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let config_content = r#"
[crawler]
threads = 8
node-threads = 4
purge-on-completion = false

[probes]
handshake = false
record-attempts = 2

[storage]
database-path = "./test.db"
epoch = "2021-09-01"

[reject]
blocked-ips = ["10.0.0.1"]
"#;

        let file = create_temp_config(config_content);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.crawler.threads, 8);
        assert_eq!(config.crawler.node_threads, 4);
        assert!(!config.crawler.purge_on_completion);
        assert_eq!(config.crawler.error_limit, None);
        assert!(!config.probes.handshake);
        assert!(config.probes.record);
        assert_eq!(config.probes.record_attempts, 2);
        assert_eq!(config.storage.epoch.as_deref(), Some("2021-09-01"));
        assert_eq!(config.reject.blocked_ips, vec!["10.0.0.1".to_string()]);
        assert_eq!(config.stats.socket_path, "./data/atlas.sock");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.crawler.threads, 30);
        assert_eq!(config.crawler.node_threads, 10);
        assert_eq!(config.crawler.stagnation_limit, 20);
        assert_eq!(config.reject.blocked_ips, vec!["94.79.55.28".to_string()]);
        assert!(config.seeds.nodes.is_empty());
    }

    #[test]
    fn test_load_config_with_invalid_path() {
        let result = load_config(Path::new("/nonexistent/atlas.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_with_invalid_toml() {
        let file = create_temp_config("this is not valid TOML {{{");
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_config_with_validation_error() {
        let file = create_temp_config("[crawler]\nthreads = 0\n");
        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::Validation(_)));
    }

    #[test]
    fn test_config_hash_is_stable() {
        let hash1 = hash_content("test content");
        let hash2 = hash_content("test content");

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
        assert_ne!(hash1, hash_content("test content\n"));
    }

    #[test]
    fn test_load_with_hash_matches_file_hash() {
        let file = create_temp_config("[crawler]\nthreads = 2\n");
        let (config, hash) = load_config_with_hash(file.path()).unwrap();
        assert_eq!(config.crawler.threads, 2);
        assert_eq!(hash, hash_content("[crawler]\nthreads = 2\n"));

        let other = create_temp_config("[crawler]\nthreads = 3\n");
        let (_, other_hash) = load_config_with_hash(other.path()).unwrap();
        assert_ne!(hash, other_hash);
    }

    #[test]
    fn test_explicit_error_limit() {
        let config = parse_config("[crawler]\nerror-limit = 4\nadaptive = false\n").unwrap();
        assert_eq!(config.crawler.error_limit, Some(4));
        assert!(parse_config("[crawler]\nerror-limit = 0\n").is_err());
    }
}

/// Campaign configuration: a single JSON object, validated at startup
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {0}: {1}")]
    Read(String, std::io::Error),
    #[error("cannot write config {0}: {1}")]
    Write(String, std::io::Error),
    #[error("config is not valid json: {0}")]
    Parse(serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccountsConfig {
    /// count of freshly generated EOAs
    pub generate: u32,
    /// pre-defined EOA private keys, hex
    pub keys: Vec<String>,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            generate: 3,
            keys: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReversionReporterConfig {
    pub enabled: bool,
}

impl Default for ReversionReporterConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FuzzingConfig {
    pub workers: usize,
    /// seconds; 0 = unlimited
    pub timeout: u64,
    /// call count; 0 = unlimited
    pub test_limit: u64,
    pub max_tx_sequence_length: usize,
    pub worker_database_entry_limit: usize,
    pub test_prefixes: Vec<String>,
    pub reversion_reporter: ReversionReporterConfig,
    pub corpus_directory: PathBuf,
    /// replay budget of the sequence shrinker
    pub shrink_limit: usize,
    pub fail_fast: bool,
    /// fixed campaign seed for reproducible runs; absent = derived from
    /// entropy
    pub campaign_seed: Option<u64>,
}

impl Default for FuzzingConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout: 0,
            test_limit: 0,
            max_tx_sequence_length: 32,
            worker_database_entry_limit: 250_000,
            test_prefixes: vec!["property_".to_string(), "fuzz_".to_string()],
            reversion_reporter: ReversionReporterConfig::default(),
            corpus_directory: PathBuf::from("corpus"),
            shrink_limit: 4096,
            fail_fast: false,
            campaign_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForkConfig {
    pub enabled: bool,
    pub rpc_url: String,
    pub block_height: u64,
    pub pool_size: usize,
    pub cache_directory: PathBuf,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_url: String::new(),
            block_height: 0,
            pool_size: 1,
            cache_directory: PathBuf::from("cache"),
        }
    }
}

/// Where compiled artifacts come from; each platform carries its own
/// sub-options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "kebab-case")]
pub enum CompilationConfig {
    /// a directory of solc output pairs: Name.abi + Name.bin
    DirectCompiler { artifact_directory: String },
    /// a solc --combined-json artifact produced by the project toolchain
    ProjectToolchain { combined_json: String },
}

impl Default for CompilationConfig {
    fn default() -> Self {
        CompilationConfig::DirectCompiler {
            artifact_directory: "artifacts".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FuzzConfig {
    pub accounts: AccountsConfig,
    pub fuzzing: FuzzingConfig,
    pub fork: ForkConfig,
    pub compilation: CompilationConfig,
}

impl FuzzConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        let config: FuzzConfig = serde_json::from_str(&raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.generate == 0 && self.accounts.keys.is_empty() {
            return Err(ConfigError::Invalid(
                "no sender accounts: set accounts.generate or accounts.keys".into(),
            ));
        }
        if self.fuzzing.workers == 0 {
            return Err(ConfigError::Invalid("fuzzing.workers must be positive".into()));
        }
        if self.fuzzing.max_tx_sequence_length == 0 {
            return Err(ConfigError::Invalid(
                "fuzzing.max_tx_sequence_length must be positive".into(),
            ));
        }
        if self.fuzzing.worker_database_entry_limit == 0 {
            return Err(ConfigError::Invalid(
                "fuzzing.worker_database_entry_limit must be positive".into(),
            ));
        }
        if self.fuzzing.test_prefixes.is_empty() {
            return Err(ConfigError::Invalid(
                "fuzzing.test_prefixes must not be empty".into(),
            ));
        }
        if self.fork.enabled {
            if self.fork.rpc_url.is_empty() {
                return Err(ConfigError::Invalid(
                    "fork.enabled requires fork.rpc_url".into(),
                ));
            }
            if self.fork.pool_size == 0 {
                return Err(ConfigError::Invalid("fork.pool_size must be positive".into()));
            }
        }
        Ok(())
    }

    /// Default configuration for a platform, as written by `init`.
    pub fn default_for(platform: Option<&str>) -> Result<Self, ConfigError> {
        let compilation = match platform {
            None | Some("direct-compiler") => CompilationConfig::default(),
            Some("project-toolchain") => CompilationConfig::ProjectToolchain {
                combined_json: "combined.json".to_string(),
            },
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "unknown compilation platform: {}",
                    other
                )))
            }
        };
        Ok(Self {
            compilation,
            ..Self::default()
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(self).map_err(ConfigError::Parse)?;
        fs::write(path, raw).map_err(|e| ConfigError::Write(path.display().to_string(), e))
    }
}

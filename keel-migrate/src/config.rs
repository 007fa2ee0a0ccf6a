//! Configuration for `keel.toml`.
//!
//! ```toml
//! store_dir = ".keel"
//! created_by = "${USER}"
//! default_environment = "development"
//! lock_timeout_ms = 5000
//!
//! [environments.production]
//! allow_data_loss = false
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};

/// Default config file name.
pub const CONFIG_FILE_NAME: &str = "keel.toml";

/// Default store directory.
pub const DEFAULT_STORE_DIR: &str = ".keel";

/// Migration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    /// Snapshot store root.
    pub store_dir: PathBuf,
    /// Author recorded on new snapshots.
    pub created_by: String,
    /// Environment used when none is given.
    pub default_environment: String,
    /// Whether destructive steps may run.
    pub allow_data_loss: bool,
    /// Render statements without executing them.
    pub dry_run: bool,
    /// Maximum wait for store and environment locks.
    pub lock_timeout_ms: u64,
    /// Re-validate every record against the stored models before deploying.
    pub verify_steps: bool,
    /// Per-environment overrides.
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            created_by: String::new(),
            default_environment: "development".to_string(),
            allow_data_loss: false,
            dry_run: false,
            lock_timeout_ms: 5_000,
            verify_steps: true,
            environments: BTreeMap::new(),
        }
    }
}

/// Overrides for one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Override `allow_data_loss`.
    pub allow_data_loss: Option<bool>,
}

impl MigrationConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    /// Load `keel.toml` from a project directory, or the defaults when the
    /// file is absent. A relative `store_dir` is resolved against `dir`.
    pub fn load(dir: impl AsRef<Path>) -> MigrateResult<Self> {
        let dir = dir.as_ref();
        let path = dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        if config.store_dir.is_relative() {
            config.store_dir = dir.join(&config.store_dir);
        }
        Ok(config)
    }

    /// Parse configuration from TOML, expanding `${VAR}` references first.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> MigrateResult<Self> {
        let expanded = expand_env_vars(content)?;
        toml::from_str(&expanded).map_err(|e| MigrationError::config(e.to_string()))
    }

    /// Set the store directory.
    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    /// Set the snapshot author.
    pub fn created_by(mut self, author: impl Into<String>) -> Self {
        self.created_by = author.into();
        self
    }

    /// Set the default environment.
    pub fn default_environment(mut self, environment: impl Into<String>) -> Self {
        self.default_environment = environment.into();
        self
    }

    /// Allow data loss operations.
    pub fn allow_data_loss(mut self, allow: bool) -> Self {
        self.allow_data_loss = allow;
        self
    }

    /// Enable dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the lock wait in milliseconds.
    pub fn lock_timeout_ms(mut self, timeout: u64) -> Self {
        self.lock_timeout_ms = timeout;
        self
    }

    /// Set whether records are re-validated before deploying.
    pub fn verify_steps(mut self, verify: bool) -> Self {
        self.verify_steps = verify;
        self
    }

    /// Add overrides for an environment.
    pub fn environment(mut self, name: impl Into<String>, config: EnvironmentConfig) -> Self {
        self.environments.insert(name.into(), config);
        self
    }

    /// Lock wait as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// The named environment, or `default_environment` when none is given.
    pub fn environment_or_default<'a>(&'a self, name: Option<&'a str>) -> &'a str {
        name.unwrap_or(&self.default_environment)
    }

    /// Effective `allow_data_loss` for an environment.
    pub fn allow_data_loss_for(&self, environment: &str) -> bool {
        self.environments
            .get(environment)
            .and_then(|env| env.allow_data_loss)
            .unwrap_or(self.allow_data_loss)
    }
}

/// Expand `${VAR_NAME}` references. Unset variables are left as written.
fn expand_env_vars(content: &str) -> MigrateResult<String> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| MigrationError::config(e.to_string()))?;
    let expanded = re.replace_all(content, |caps: &Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });
    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MigrationConfig::default();
        assert_eq!(config.store_dir, PathBuf::from(".keel"));
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert!(!config.allow_data_loss);
        assert!(config.verify_steps);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            store_dir = "db/.keel"
            created_by = "ci"
            lock_timeout_ms = 250

            [environments.development]
            allow_data_loss = true
        "#;

        let config = MigrationConfig::from_str(toml).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("db/.keel"));
        assert_eq!(config.created_by, "ci");
        assert_eq!(config.lock_timeout_ms, 250);
        assert!(config.allow_data_loss_for("development"));
        assert!(!config.allow_data_loss_for("production"));
    }

    #[test]
    fn test_environment_override_can_deny() {
        let config = MigrationConfig::new().allow_data_loss(true).environment(
            "production",
            EnvironmentConfig {
                allow_data_loss: Some(false),
            },
        );
        assert!(config.allow_data_loss_for("staging"));
        assert!(!config.allow_data_loss_for("production"));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = MigrationConfig::from_str("stor_dir = \"x\"").unwrap_err();
        assert!(matches!(err, MigrationError::Config(_)));
    }

    #[test]
    fn test_env_var_expansion() {
        // SAFETY: the variable name is unique to this test
        unsafe {
            std::env::set_var("KEEL_TEST_CREATED_BY", "release-bot");
        }
        let config = MigrationConfig::from_str(
            "created_by = \"${KEEL_TEST_CREATED_BY}\"\nstore_dir = \"${KEEL_TEST_UNSET_DIR}\"",
        )
        .unwrap();
        assert_eq!(config.created_by, "release-bot");
        assert_eq!(config.store_dir, PathBuf::from("${KEEL_TEST_UNSET_DIR}"));
        unsafe {
            std::env::remove_var("KEEL_TEST_CREATED_BY");
        }
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "dry_run = true\n").unwrap();

        let config = MigrationConfig::from_file(&path).unwrap();
        assert!(config.dry_run);

        let missing = MigrationConfig::from_file(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, MigrationError::Config(_)));
    }

    #[test]
    fn test_load_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = MigrationConfig::load(dir.path()).unwrap();
        assert_eq!(defaults.store_dir, dir.path().join(DEFAULT_STORE_DIR));
        assert_eq!(defaults.environment_or_default(None), "development");

        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "store_dir = \"db/.keel\"\ndefault_environment = \"staging\"\n",
        )
        .unwrap();
        let config = MigrationConfig::load(dir.path()).unwrap();
        assert_eq!(config.store_dir, dir.path().join("db/.keel"));
        assert_eq!(config.environment_or_default(None), "staging");
        assert_eq!(config.environment_or_default(Some("prod")), "prod");
    }
}

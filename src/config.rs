//! Configuration for gauntlet.
//!
//! Settings are layered, later layers winning:
//! 1. `.gauntlet/gauntlet.toml`
//! 2. Environment (`GAUNTLET_MAX_RETRIES`, `GAUNTLET_ADVISORY_CMD`,
//!    `GAUNTLET_ADVISORY_URL`, `GAUNTLET_INVARIANT_DIR`)
//! 3. CLI flags
//!
//! Example `gauntlet.toml`:
//!
//! ```toml
//! [defaults]
//! max_retries = 3
//!
//! [promotion]
//! promote_threshold = 0.8
//! accept_threshold = 0.5
//!
//! [advisory]
//! backend = "command"
//! command = "assess-spec"
//! args = ["--json"]
//! timeout_secs = 120
//!
//! [artifact]
//! git_commit = true
//!
//! [[gates]]
//! id = "structure"
//! name = "Structure"
//! order = 1
//! checks = [{ kind = "require_section", heading = "Overview" }]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::advisory::{AdvisoryClient, CommandAdvisor, HttpAdvisor, StubAdvisor};
use crate::artifact::FileArtifactStore;
use crate::errors::ConfigError;
use crate::gates::{DEFAULT_MAX_RETRIES, GateDef, GateTable};
use crate::learning::PromotionPolicy;
use crate::store::FileStateStore;

pub const GAUNTLET_DIR: &str = ".gauntlet";
pub const CONFIG_FILE: &str = "gauntlet.toml";

pub const ENV_MAX_RETRIES: &str = "GAUNTLET_MAX_RETRIES";
pub const ENV_ADVISORY_CMD: &str = "GAUNTLET_ADVISORY_CMD";
pub const ENV_ADVISORY_URL: &str = "GAUNTLET_ADVISORY_URL";
pub const ENV_INVARIANT_DIR: &str = "GAUNTLET_INVARIANT_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    /// Assessment attempts per gate unless the gate sets its own.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisoryBackend {
    #[default]
    Stub,
    Command,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorySection {
    #[serde(default)]
    pub backend: AdvisoryBackend,
    /// Program for the `command` backend.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Endpoint for the `http` backend.
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding a bearer token for the `http` backend.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Confidence the `stub` backend reports.
    #[serde(default = "default_stub_confidence")]
    pub stub_confidence: f64,
}

fn default_token_env() -> String {
    "GAUNTLET_ADVISORY_TOKEN".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_stub_confidence() -> f64 {
    1.0
}

impl Default for AdvisorySection {
    fn default() -> Self {
        Self {
            backend: AdvisoryBackend::default(),
            command: None,
            args: Vec::new(),
            url: None,
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
            stub_confidence: default_stub_confidence(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactSection {
    /// Where committed versions are archived. Defaults to `.gauntlet/archive`.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    /// Record every committed fix as a git commit.
    #[serde(default)]
    pub git_commit: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    /// Run state. Defaults to `.gauntlet/state`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Invariant registry, shareable between projects. Defaults to
    /// `<state_dir>/invariants`. A leading `~/` means the home directory.
    #[serde(default)]
    pub invariant_dir: Option<PathBuf>,
}

/// The complete gauntlet.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GauntletToml {
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub promotion: PromotionPolicy,
    #[serde(default)]
    pub advisory: AdvisorySection,
    #[serde(default)]
    pub artifact: ArtifactSection,
    #[serde(default)]
    pub store: StoreSection,
    /// Replaces the built-in gate table when non-empty.
    #[serde(default)]
    pub gates: Vec<GateDef>,
}

impl GauntletToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gauntlet.toml")
    }

    /// Load `<gauntlet_dir>/gauntlet.toml`, or defaults if there is none.
    pub fn load_or_default(gauntlet_dir: &Path) -> Result<Self> {
        let path = gauntlet_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_MAX_RETRIES) {
            self.defaults.max_retries = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer, got '{}'", ENV_MAX_RETRIES, value))?;
        }
        if let Some(value) = lookup(ENV_ADVISORY_CMD).filter(|v| !v.trim().is_empty()) {
            let mut parts = value.split_whitespace().map(str::to_string);
            self.advisory.backend = AdvisoryBackend::Command;
            self.advisory.command = parts.next();
            self.advisory.args = parts.collect();
        }
        if let Some(value) = lookup(ENV_ADVISORY_URL).filter(|v| !v.trim().is_empty()) {
            self.advisory.backend = AdvisoryBackend::Http;
            self.advisory.url = Some(value);
        }
        if let Some(value) = lookup(ENV_INVARIANT_DIR).filter(|v| !v.trim().is_empty()) {
            self.store.invariant_dir = Some(PathBuf::from(value));
        }
        Ok(())
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct GauntletConfig {
    pub project_dir: PathBuf,
    pub gauntlet_dir: PathBuf,
    pub toml: GauntletToml,
    /// CLI override for `[defaults] max_retries`.
    pub cli_max_retries: Option<u32>,
}

impl GauntletConfig {
    /// Load from the file and the process environment.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::load_with(project_dir, |key| std::env::var(key).ok())
    }

    pub fn load_with(project_dir: PathBuf, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let gauntlet_dir = project_dir.join(GAUNTLET_DIR);
        let mut toml = GauntletToml::load_or_default(&gauntlet_dir)?;
        toml.apply_env(lookup)?;
        Ok(Self {
            project_dir,
            gauntlet_dir,
            toml,
            cli_max_retries: None,
        })
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.cli_max_retries = max_retries;
        self
    }

    /// CLI → env/file → default.
    pub fn max_retries(&self) -> u32 {
        self.cli_max_retries.unwrap_or(self.toml.defaults.max_retries)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(self.toml.store.state_dir.as_deref())
            .unwrap_or_else(|| self.gauntlet_dir.join("state"))
    }

    pub fn invariant_dir(&self) -> PathBuf {
        self.resolve(self.toml.store.invariant_dir.as_deref())
            .unwrap_or_else(|| self.state_dir().join("invariants"))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.resolve(self.toml.artifact.archive_dir.as_deref())
            .unwrap_or_else(|| self.gauntlet_dir.join("archive"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.gauntlet_dir.join("logs")
    }

    fn resolve(&self, path: Option<&Path>) -> Option<PathBuf> {
        let path = path?;
        if let Ok(rest) = path.strip_prefix("~")
            && let Some(home) = dirs::home_dir()
        {
            return Some(home.join(rest));
        }
        Some(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        })
    }

    /// The configured gate table, or the built-in one.
    pub fn gate_table(&self) -> Result<GateTable, ConfigError> {
        if self.toml.gates.is_empty() {
            GateTable::default_table(self.max_retries())
        } else {
            GateTable::new(&self.toml.gates, self.max_retries())
        }
    }

    pub fn promotion_policy(&self) -> Result<PromotionPolicy, ConfigError> {
        self.toml.promotion.validate()?;
        Ok(self.toml.promotion.clone())
    }

    pub fn advisory_client(&self) -> Result<Arc<dyn AdvisoryClient>> {
        let section = &self.toml.advisory;
        let timeout = Duration::from_secs(section.timeout_secs);
        let client: Arc<dyn AdvisoryClient> = match section.backend {
            AdvisoryBackend::Stub => Arc::new(StubAdvisor::new(section.stub_confidence)),
            AdvisoryBackend::Command => {
                let Some(program) = section.command.clone() else {
                    bail!("advisory backend 'command' needs [advisory] command or {}", ENV_ADVISORY_CMD);
                };
                Arc::new(CommandAdvisor::new(program, section.args.clone(), timeout))
            }
            AdvisoryBackend::Http => {
                let Some(url) = section.url.clone() else {
                    bail!("advisory backend 'http' needs [advisory] url or {}", ENV_ADVISORY_URL);
                };
                let token = std::env::var(&section.token_env).ok();
                Arc::new(
                    HttpAdvisor::new(url, timeout)
                        .context("Failed to build advisory HTTP client")?
                        .with_token(token),
                )
            }
        };
        Ok(client)
    }

    pub fn artifact_store(&self) -> FileArtifactStore {
        FileArtifactStore::new(self.project_dir.clone(), self.archive_dir())
            .with_git_commit(self.toml.artifact.git_commit)
    }

    pub fn state_store(&self) -> FileStateStore {
        FileStateStore::new(self.state_dir()).with_invariant_root(self.invariant_dir())
    }

    /// Non-fatal problems worth showing the operator.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let advisory = &self.toml.advisory;
        if advisory.backend != AdvisoryBackend::Command && advisory.command.is_some() {
            warnings.push(format!(
                "[advisory] command is set but backend is '{:?}'; it will be ignored",
                advisory.backend
            ));
        }
        if advisory.backend != AdvisoryBackend::Http && advisory.url.is_some() {
            warnings.push(format!(
                "[advisory] url is set but backend is '{:?}'; it will be ignored",
                advisory.backend
            ));
        }
        if advisory.timeout_secs == 0 {
            warnings.push("[advisory] timeout_secs is 0; every advisory call will time out".into());
        }
        let uses_advisory = match self.gate_table() {
            Ok(table) => table.gates().iter().any(|g| g.pass_condition.advisory.is_some()),
            Err(_) => false,
        };
        if uses_advisory && advisory.backend == AdvisoryBackend::Stub {
            warnings.push(format!(
                "gates require advisory review but the advisory backend is the stub; \
                 every review reports confidence {}",
                advisory.stub_confidence
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_config(dir: &Path, content: &str) {
        let gauntlet = dir.join(GAUNTLET_DIR);
        std::fs::create_dir_all(&gauntlet).unwrap();
        std::fs::write(gauntlet.join(CONFIG_FILE), content).unwrap();
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = tempdir().unwrap();
        let config = GauntletConfig::load_with(dir.path().to_path_buf(), env(&[])).unwrap();
        assert_eq!(config.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(config.toml.advisory.backend, AdvisoryBackend::Stub);
        assert_eq!(config.gate_table().unwrap().len(), 5);
        assert!(config.state_dir().ends_with(".gauntlet/state"));
        assert!(config.invariant_dir().ends_with("state/invariants"));
    }

    #[test]
    fn test_parse_full_file() {
        let toml = GauntletToml::parse(
            r#"
            [defaults]
            max_retries = 2

            [promotion]
            promote_threshold = 0.9

            [advisory]
            backend = "command"
            command = "assess"
            args = ["--json"]

            [[gates]]
            id = "structure"
            name = "Structure"
            order = 1
            checks = [{ kind = "require_section", heading = "Overview" }]

            [[gates]]
            id = "review"
            name = "Review"
            order = 2
            depends_on = ["structure"]
            max_retries = 4
            advisory = { min_confidence = 0.7 }
            "#,
        )
        .unwrap();
        assert_eq!(toml.defaults.max_retries, 2);
        assert_eq!(toml.promotion.promote_threshold, 0.9);
        assert_eq!(toml.promotion.accept_threshold, 0.5);
        assert_eq!(toml.advisory.backend, AdvisoryBackend::Command);
        assert_eq!(toml.gates.len(), 2);
        assert_eq!(toml.gates[1].max_retries, Some(4));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "[defaults]\nmax_retries = 2\n");
        let config = GauntletConfig::load_with(
            dir.path().to_path_buf(),
            env(&[
                (ENV_MAX_RETRIES, "7"),
                (ENV_ADVISORY_CMD, "assess --fast"),
                (ENV_INVARIANT_DIR, "/tmp/shared-invariants"),
            ]),
        )
        .unwrap();
        assert_eq!(config.max_retries(), 7);
        assert_eq!(config.toml.advisory.backend, AdvisoryBackend::Command);
        assert_eq!(config.toml.advisory.command.as_deref(), Some("assess"));
        assert_eq!(config.toml.advisory.args, vec!["--fast"]);
        assert_eq!(config.invariant_dir(), PathBuf::from("/tmp/shared-invariants"));
    }

    #[test]
    fn test_cli_overrides_env() {
        let dir = tempdir().unwrap();
        let config = GauntletConfig::load_with(dir.path().to_path_buf(), env(&[(ENV_MAX_RETRIES, "7")]))
            .unwrap()
            .with_max_retries(Some(1));
        assert_eq!(config.max_retries(), 1);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let dir = tempdir().unwrap();
        let err = GauntletConfig::load_with(dir.path().to_path_buf(), env(&[(ENV_MAX_RETRIES, "many")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_RETRIES));
    }

    #[test]
    fn test_zero_retries_rejected_by_gate_table() {
        let dir = tempdir().unwrap();
        let config = GauntletConfig::load_with(dir.path().to_path_buf(), env(&[]))
            .unwrap()
            .with_max_retries(Some(0));
        assert!(matches!(config.gate_table(), Err(ConfigError::ZeroRetries(_))));
    }

    #[test]
    fn test_cyclic_gates_rejected() {
        let dir = tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
            [[gates]]
            id = "a"
            name = "A"
            order = 1
            depends_on = ["b"]
            checks = [{ kind = "min_length", chars = 1 }]

            [[gates]]
            id = "b"
            name = "B"
            order = 2
            depends_on = ["a"]
            checks = [{ kind = "min_length", chars = 1 }]
            "#,
        );
        let config = GauntletConfig::load_with(dir.path().to_path_buf(), env(&[])).unwrap();
        assert!(matches!(config.gate_table(), Err(ConfigError::Cycle { .. })));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "[promotion]\naccept_threshold = 0.95\n");
        let config = GauntletConfig::load_with(dir.path().to_path_buf(), env(&[])).unwrap();
        assert!(config.promotion_policy().is_err());
    }

    #[test]
    fn test_command_backend_requires_program() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "[advisory]\nbackend = \"command\"\n");
        let config = GauntletConfig::load_with(dir.path().to_path_buf(), env(&[])).unwrap();
        assert!(config.advisory_client().is_err());
    }

    #[test]
    fn test_relative_dirs_resolve_against_project() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "[store]\nstate_dir = \"var/state\"\n");
        let config = GauntletConfig::load_with(dir.path().to_path_buf(), env(&[])).unwrap();
        assert_eq!(config.state_dir(), config.project_dir.join("var/state"));
    }

    #[test]
    fn test_validate_warns_about_stub_with_advisory_gates() {
        let dir = tempdir().unwrap();
        let config = GauntletConfig::load_with(dir.path().to_path_buf(), env(&[])).unwrap();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("stub")));
    }
}

//! Harness configuration loaded from YAML.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::candidate::{
    CandidateCapabilities, CandidateHandle, CandidateInfo, CandidateRegistry, CommandSpec,
    ProtocolCandidate,
};
use crate::error::{ConfigError, OrchestratorError, RegistryError};
use crate::payload::materializer::absolutize;
use crate::payload::{Materializer, MaterializerConfig, PayloadSuite, TempLedger};
use crate::report::ReportFormat;
use crate::sandbox::{IsolationMode, SandboxExecutor, SandboxLimits};
use crate::scheduler::{Orchestrator, OrchestratorConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

pub const MAX_PARALLEL_TESTS: usize = 32;
pub const MAX_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub results_dir: PathBuf,
    pub format: ReportFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            format: ReportFormat::Json,
        }
    }
}

/// Run settings. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub parallel_tests: usize,
    pub timeout: u64,
    pub max_rss_mb: u64,
    pub max_cpu_time: u64,
    /// Also cap the address space at four times `max_rss_mb`.
    pub limit_address_space: bool,
    pub cleanup_temp: bool,
    pub isolation: IsolationMode,
    pub dual_version: bool,
    pub git_timeout: u64,
    pub extract_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallel_tests: 4,
            timeout: 30,
            max_rss_mb: 500,
            max_cpu_time: 60,
            limit_address_space: false,
            cleanup_temp: true,
            isolation: IsolationMode::Subprocess,
            dual_version: false,
            git_timeout: 10,
            extract_timeout: 60,
        }
    }
}

impl Settings {
    pub fn with_parallel_tests(mut self, n: usize) -> Self {
        self.parallel_tests = n;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn with_isolation(mut self, mode: IsolationMode) -> Self {
        self.isolation = mode;
        self
    }

    pub fn with_dual_version(mut self, dual: bool) -> Self {
        self.dual_version = dual;
        self
    }

    pub fn with_cleanup_temp(mut self, cleanup: bool) -> Self {
        self.cleanup_temp = cleanup;
        self
    }

    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits::default()
            .with_timeout(Duration::from_secs(self.timeout))
            .with_memory_mb(self.max_rss_mb)
            .with_cpu_secs(self.max_cpu_time)
            .with_address_space_limit(self.limit_address_space)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::new()
            .with_parallel_tests(self.parallel_tests)
            .with_dual_version(self.dual_version)
            .with_limits(self.limits())
    }

    pub fn materializer_config(&self, base_dir: &Path) -> MaterializerConfig {
        MaterializerConfig::new(base_dir)
            .with_git_timeout(Duration::from_secs(self.git_timeout))
            .with_extract_timeout(Duration::from_secs(self.extract_timeout))
    }
}

/// An external candidate declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateConfig {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: CandidateCapabilities,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_version() -> String {
    "unknown".to_string()
}

impl CandidateConfig {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            version: default_version(),
            language: String::new(),
            description: String::new(),
            capabilities: CandidateCapabilities::default(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CandidateCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Builds the protocol adapter, resolving relative paths against
    /// `base_dir`.
    ///
    /// A relative program containing a separator is resolved, and so is any
    /// argument naming an existing file under `base_dir`. Candidates run in a
    /// private working directory, so relative paths would not resolve there.
    pub fn to_candidate(&self, base_dir: &Path, limits: &SandboxLimits) -> Option<ProtocolCandidate> {
        let mut command = CommandSpec::from_argv(&self.command)?;
        if command.program.is_relative() && command.program.components().count() > 1 {
            command.program = base_dir.join(&command.program);
        }
        command.args = command
            .args
            .into_iter()
            .map(|arg| {
                let candidate = base_dir.join(&arg);
                if Path::new(&arg).is_relative() && candidate.exists() {
                    candidate.to_string_lossy().into_owned()
                } else {
                    arg
                }
            })
            .collect();
        for (key, value) in &self.env {
            command = command.with_env(key.clone(), value.clone());
        }

        let info = CandidateInfo::new(&self.name)
            .with_version(&self.version)
            .with_language(&self.language)
            .with_description(&self.description);
        Some(
            ProtocolCandidate::new(info, command)
                .with_capabilities(self.capabilities.clone())
                .with_limits(limits.clone()),
        )
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub candidates: Vec<CandidateConfig>,
    #[serde(default)]
    pub payloads: PayloadSuite,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl HarnessConfig {
    /// Loads and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        debug!("Loading configuration from {}", path.display());
        Self::from_yaml_str(&content, base_dir)
    }

    pub fn from_yaml_str(yaml: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut config: HarnessConfig = serde_yaml::from_str(yaml)?;
        config.base_dir = absolutize(base_dir.into());
        config.payloads.assign_categories();
        config.validate()?;
        Ok(config)
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.payloads.is_empty() {
            return invalid("no payloads configured".to_string());
        }
        if !(1..=MAX_PARALLEL_TESTS).contains(&self.settings.parallel_tests) {
            return invalid(format!(
                "parallel_tests must be between 1 and {}, got {}",
                MAX_PARALLEL_TESTS, self.settings.parallel_tests
            ));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.settings.timeout) {
            return invalid(format!(
                "timeout must be between 1 and {} seconds, got {}",
                MAX_TIMEOUT_SECS, self.settings.timeout
            ));
        }

        for (category, payloads) in self.payloads.categories() {
            let mut seen = BTreeSet::new();
            for payload in payloads {
                if payload.name.trim().is_empty() {
                    return invalid(format!("payload in '{}' has an empty name", category));
                }
                if payload.path.as_os_str().is_empty() {
                    return invalid(format!("payload '{}' has an empty path", payload.name));
                }
                if !seen.insert(payload.name.as_str()) {
                    return invalid(format!(
                        "duplicate payload '{}' in category '{}'",
                        payload.name, category
                    ));
                }
                for expected in [&payload.expected_swhid, &payload.expected_swhid_sha256]
                    .into_iter()
                    .flatten()
                {
                    if !expected.starts_with("swh:") {
                        return invalid(format!(
                            "payload '{}' expects '{}', which is not an identifier",
                            payload.name, expected
                        ));
                    }
                }
            }
        }

        let mut names = BTreeSet::new();
        for candidate in &self.candidates {
            if candidate.name.trim().is_empty() {
                return invalid("candidate with an empty name".to_string());
            }
            if !names.insert(candidate.name.as_str()) {
                return invalid(format!("duplicate candidate '{}'", candidate.name));
            }
            if candidate.command.is_empty() {
                return invalid(format!("candidate '{}' has an empty command", candidate.name));
            }
        }
        Ok(())
    }

    /// Built-in candidates plus one protocol candidate per configured entry.
    pub fn build_registry(&self) -> Result<CandidateRegistry, RegistryError> {
        let mut registry = CandidateRegistry::with_builtins();
        let limits = self.settings.limits();
        for entry in &self.candidates {
            if let Some(candidate) = entry.to_candidate(&self.base_dir, &limits) {
                let handle: Arc<dyn CandidateHandle> = Arc::new(candidate);
                registry.register(handle)?;
            }
        }
        Ok(registry)
    }

    /// Wires registry, sandbox, materializer and scheduler together.
    pub fn build_orchestrator(&self) -> Result<Orchestrator, OrchestratorError> {
        let registry = self.build_registry()?;

        let mut executor = SandboxExecutor::new(self.settings.isolation);
        if self.settings.isolation == IsolationMode::Subprocess {
            executor = executor.with_current_exe_host()?;
        }

        let ledger = if self.settings.cleanup_temp {
            TempLedger::new()
        } else {
            TempLedger::keeping()
        };
        let materializer = Materializer::new(
            self.settings.materializer_config(&self.base_dir),
            Arc::new(ledger),
        );

        Ok(Orchestrator::new(
            registry,
            executor,
            materializer,
            self.settings.orchestrator_config(),
        ))
    }
}

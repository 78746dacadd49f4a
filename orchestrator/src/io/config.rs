//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::core::feedback::MAX_ITERATIONS;

/// Hand-edited TOML; every field is optional and falls back to `Default`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Bound on Phase 1 attempts per task (feedback retries included).
    pub max_iterations: u32,

    /// Skip the approval gate for the whole session.
    pub approve_all: bool,

    /// Forward agent reasoning to the console.
    pub verbose: bool,

    /// Ask the operator one question per ambiguity reported by intent analysis.
    pub ask_clarifications: bool,

    /// Rendered prompts larger than this drop low-priority context sections.
    pub prompt_budget_bytes: usize,

    /// Bound on captured stderr/stdout from child processes.
    pub output_limit_bytes: usize,

    pub agent: AgentConfig,
    pub verify: VerifyConfig,
    pub collaborators: CollaboratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub binary: String,
    /// Arguments placed before the mode flags.
    pub extra_args: Vec<String>,
    pub model: Option<String>,
    /// Independent limit for each of Phase 1 and Phase 2.
    pub phase_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Build/test command run after files were modified (e.g. `["cargo","test"]`).
    /// Empty disables verification.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

/// External commands backing the context collaborators. Empty means "not available".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub search: Vec<String>,
    pub graph: Vec<String>,
    pub intent: Vec<String>,
    pub decompose: Vec<String>,
    pub timeout_secs: u64,
    /// Treat collaborator failures as hard failures instead of empty context.
    pub required: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: Vec::new(),
            model: None,
            phase_timeout_secs: 5 * 60,
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 10 * 60,
        }
    }
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            search: Vec::new(),
            graph: Vec::new(),
            intent: Vec::new(),
            decompose: Vec::new(),
            timeout_secs: 60,
            required: false,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: MAX_ITERATIONS,
            approve_all: false,
            verbose: false,
            ask_clarifications: true,
            prompt_budget_bytes: 60_000,
            output_limit_bytes: 100_000,
            agent: AgentConfig::default(),
            verify: VerifyConfig::default(),
            collaborators: CollaboratorConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_iterations", u64::from(self.max_iterations)),
            ("prompt_budget_bytes", self.prompt_budget_bytes as u64),
            ("output_limit_bytes", self.output_limit_bytes as u64),
            ("agent.phase_timeout_secs", self.agent.phase_timeout_secs),
            ("verify.timeout_secs", self.verify.timeout_secs),
            ("collaborators.timeout_secs", self.collaborators.timeout_secs),
        ] {
            ensure!(value > 0, "{name} must be > 0");
        }
        ensure!(
            !self.agent.binary.trim().is_empty(),
            "agent.binary must not be empty"
        );
        for (name, argv) in [
            ("verify.command", &self.verify.command),
            ("collaborators.search", &self.collaborators.search),
            ("collaborators.graph", &self.collaborators.graph),
            ("collaborators.intent", &self.collaborators.intent),
            ("collaborators.decompose", &self.collaborators.decompose),
        ] {
            if let Some(program) = argv.first() {
                ensure!(!program.trim().is_empty(), "{name} must start with a program");
            }
        }
        Ok(())
    }
}

/// Load `.orchestrator/config.toml`; a missing file means all defaults.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let cfg = match fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<OrchestratorConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => OrchestratorConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Write `cfg` through a sibling temp file so readers never see half a file.
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let body = toml::to_string_pretty(cfg).context("serialize config")? + "\n";
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let staged = path.with_extension("toml.tmp");
    fs::write(&staged, body).with_context(|| format!("write {}", staged.display()))?;
    fs::rename(&staged, path).with_context(|| format!("replace {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
        assert_eq!(cfg.max_iterations, 10);
        assert_eq!(cfg.agent.phase_timeout_secs, 300);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = OrchestratorConfig::default();
        cfg.agent.model = Some("sonnet".to_string());
        cfg.verify.command = vec!["cargo".to_string(), "test".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "verbose = true\n\n[agent]\nbinary = \"my-agent\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert!(cfg.verbose);
        assert_eq!(cfg.agent.binary, "my-agent");
        assert_eq!(cfg.agent.phase_timeout_secs, 300);
        assert!(cfg.ask_clarifications);
    }

    #[test]
    fn rejects_zero_limits() {
        let cfg = OrchestratorConfig {
            max_iterations: 0,
            ..OrchestratorConfig::default()
        };
        assert!(cfg.validate().is_err());

        let mut cfg = OrchestratorConfig::default();
        cfg.agent.phase_timeout_secs = 0;
        let err = cfg.validate().expect_err("zero timeout");
        assert!(err.to_string().contains("phase_timeout_secs"));

        let mut cfg = OrchestratorConfig::default();
        cfg.collaborators.graph = vec![" ".to_string()];
        let err = cfg.validate().expect_err("blank program");
        assert!(err.to_string().contains("collaborators.graph"));
    }
}

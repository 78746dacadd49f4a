//! Initialization helpers for `.orchestrator/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{OrchestratorConfig, write_config};
use crate::io::plan_store::PLAN_SCHEMA;

/// Canonical paths within `.orchestrator/` for a project root.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub runs_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub plan_schema_path: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dir = root.join(".orchestrator");
        Self {
            root: root.clone(),
            config_path: dir.join("config.toml"),
            runs_dir: dir.join("runs"),
            gitignore_path: dir.join(".gitignore"),
            plan_schema_path: dir.join("plan.schema.json"),
            dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing orchestrator-owned files.
    pub force: bool,
}

/// Create `.orchestrator/` with a default config in `root`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_orchestrator(root: &Path, options: &InitOptions) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(root);
    if paths.dir.exists() && !paths.dir.is_dir() {
        return Err(anyhow!(
            "orchestrator init: .orchestrator exists but is not a directory"
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "orchestrator init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    fs::create_dir_all(&paths.runs_dir)
        .with_context(|| format!("create directory {}", paths.runs_dir.display()))?;
    write_config(&paths.config_path, &OrchestratorConfig::default())?;
    write_file(&paths.gitignore_path, GITIGNORE)?;
    write_file(&paths.plan_schema_path, PLAN_SCHEMA)?;
    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const GITIGNORE: &str = "runs/\n";

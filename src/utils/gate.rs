//! Idempotent-resume gate: decides from the filesystem whether a stage still
//! has to run, and checks afterwards that it left its outputs behind.
//!
//! Only presence and size are checked. A truncated but non-empty file from an
//! interrupted run is accepted on resume.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::config::defs::{GatePolicy, PipelineError};


/// Output a stage declares.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    File(PathBuf),
    /// Every member must be present.
    AllOf(Vec<PathBuf>),
    /// At least one member must be present.
    AnyOf(Vec<PathBuf>),
}

impl Artifact {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Artifact::File(p) => vec![p.as_path()],
            Artifact::AllOf(ps) | Artifact::AnyOf(ps) => ps.iter().map(|p| p.as_path()).collect(),
        }
    }

    pub fn is_produced(&self) -> bool {
        match self {
            Artifact::File(p) => file_non_empty(p),
            Artifact::AllOf(ps) => !ps.is_empty() && ps.iter().all(|p| file_non_empty(p)),
            Artifact::AnyOf(ps) => ps.iter().any(|p| file_non_empty(p)),
        }
    }

    fn missing(&self) -> Vec<String> {
        match self {
            Artifact::AnyOf(ps) => vec![ps
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" | ")],
            _ => self
                .paths()
                .into_iter()
                .filter(|p| !file_non_empty(p))
                .map(|p| p.display().to_string())
                .collect(),
        }
    }
}

fn file_non_empty(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}


#[derive(Debug, Clone, Copy)]
pub struct StepGate {
    policy: GatePolicy,
}

impl StepGate {
    pub fn new(policy: GatePolicy) -> Self {
        StepGate { policy }
    }

    /// Whether the stage owning `artifact` has to run.
    ///
    /// # Arguments
    ///
    /// * `artifact` - The stage's declared output.
    /// * `shared` - True for artifacts shared across samples (the reference
    ///   index), which are reused under every policy.
    ///
    /// # Returns
    /// Ok(true) to run, Ok(false) to skip. Under `Strict`, an existing
    /// per-sample artifact is a Path error.
    pub fn should_run(&self, artifact: &Artifact, shared: bool) -> Result<bool, PipelineError> {
        let produced = artifact.is_produced();
        debug!("Gate {:?}: {:?} produced={}", self.policy, artifact.paths(), produced);
        if shared {
            return Ok(!produced);
        }
        match self.policy {
            GatePolicy::Force => Ok(true),
            GatePolicy::Resume => Ok(!produced),
            GatePolicy::Strict if produced => Err(PipelineError::Path(format!(
                "Output from an earlier run already exists: {}",
                artifact
                    .paths()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
            GatePolicy::Strict => Ok(true),
        }
    }

    /// Fails the stage when its artifact is absent or empty after running.
    pub fn verify(&self, stage: &str, tool: &str, artifact: &Artifact) -> Result<(), PipelineError> {
        if artifact.is_produced() {
            return Ok(());
        }
        Err(PipelineError::StageFailure {
            stage: stage.to_string(),
            tool: tool.to_string(),
            error: format!("expected output missing or empty: {}", artifact.missing().join(", ")),
        })
    }
}

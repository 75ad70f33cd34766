//! The opaque compute step.
//!
//! The algorithm itself lives outside this crate; [`ProcessTransform`] runs
//! it as an external command over files in a per-job scratch directory.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use tracing::debug;

use castline_core::JobId;

use super::executor::ExecutorError;

/// Inputs of one recast transformation.
#[derive(Debug, Clone)]
pub struct RecastInputs {
    pub source: Arc<Vec<u8>>,
    pub template: Arc<Vec<u8>>,
    /// Lowercased, without the dot.
    pub extension: String,
}

/// Blocking compute function. Only ever called with the exclusive resource held.
pub trait Transform: Send + Sync + 'static {
    fn run(&self, job_id: JobId, inputs: &RecastInputs) -> Result<Vec<u8>, ExecutorError>;
}

/// Runs `<program> [args..] <source> <template> <output>` and reads `<output>` back.
#[derive(Debug, Clone)]
pub struct ProcessTransform {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
}

impl ProcessTransform {
    pub fn new(program: impl Into<String>, args: Vec<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Split a whitespace-separated command line into program and arguments.
    pub fn from_command_line(line: &str, scratch_dir: impl Into<PathBuf>) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), scratch_dir))
    }
}

impl Transform for ProcessTransform {
    fn run(&self, job_id: JobId, inputs: &RecastInputs) -> Result<Vec<u8>, ExecutorError> {
        let dir = self.scratch_dir.join(job_id.to_string());
        std::fs::create_dir_all(&dir)?;

        let source = dir.join(format!("source.{}", inputs.extension));
        let template = dir.join(format!("template.{}", inputs.extension));
        let output = dir.join(format!("output.{}", inputs.extension));
        std::fs::write(&source, inputs.source.as_slice())?;
        std::fs::write(&template, inputs.template.as_slice())?;

        let result = Command::new(&self.program)
            .args(&self.args)
            .arg(&source)
            .arg(&template)
            .arg(&output)
            .output();

        let produced = match result {
            Ok(out) if out.status.success() => std::fs::read(&output).map_err(ExecutorError::from),
            Ok(out) => Err(ExecutorError::Transform(format!(
                "{} exited with {}: {}",
                self.program,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
            Err(e) => Err(ExecutorError::Transform(format!("{}: {e}", self.program))),
        };

        if let Err(e) = std::fs::remove_dir_all(&dir) {
            debug!(dir = %dir.display(), error = %e, "scratch cleanup failed");
        }
        produced
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn inputs() -> RecastInputs {
        RecastInputs {
            source: Arc::new(b"source".to_vec()),
            template: Arc::new(b"template".to_vec()),
            extension: "png".to_string(),
        }
    }

    #[test]
    fn copies_output_of_external_command() {
        let scratch = tempfile::tempdir().unwrap();
        let transform = ProcessTransform::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"cat "$1" "$2" > "$3""#.to_string(),
                "transform".to_string(),
            ],
            scratch.path().join("jobs"),
        );
        let job = JobId::new();
        let out = transform.run(job, &inputs()).unwrap();

        assert_eq!(out, b"sourcetemplate");
        assert!(!scratch.path().join("jobs").join(job.to_string()).exists());
    }

    #[test]
    fn failing_command_is_a_transform_error() {
        let scratch = tempfile::tempdir().unwrap();
        let transform = ProcessTransform::from_command_line("false", scratch.path()).unwrap();
        let err = transform.run(JobId::new(), &inputs()).unwrap_err();
        assert!(matches!(err, ExecutorError::Transform(_)));
    }

    #[test]
    fn missing_command_is_a_transform_error() {
        let scratch = tempfile::tempdir().unwrap();
        let transform = ProcessTransform::new("/definitely/not/here", vec![], scratch.path());
        assert!(matches!(
            transform.run(JobId::new(), &inputs()),
            Err(ExecutorError::Transform(_))
        ));
    }
}

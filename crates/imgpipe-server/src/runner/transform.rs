//! The per-stage transform seam
//!
//! A transform reads staged inputs from local disk and writes its outputs
//! into the lease's output directory. It never touches the object store or
//! the manifest store; the runner does that around it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Exit code a command transform uses to ask for a retry (EX_TEMPFAIL)
pub const RETRYABLE_EXIT_CODE: i32 = 75;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Transform failed (retryable): {0}")]
    Retryable(String),

    #[error("Transform failed: {0}")]
    Fatal(String),
}

impl TransformError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Everything a transform gets to see
#[derive(Debug, Clone)]
pub struct TransformInput {
    pub dataset_id: Uuid,
    pub stage: i32,
    pub key: String,
    /// Remote URIs the staged files came from, parallel to `input_paths`
    pub input_uris: Vec<String>,
    pub input_paths: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub stage_config: serde_json::Value,
}

/// One output file plus the metadata that goes into its manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputArtifact {
    /// Absolute, or relative to the output directory
    pub path: PathBuf,
    /// Object name under the stage's output prefix; must be deterministic
    /// for a given key so a retried attempt overwrites, never duplicates
    pub object_name: String,
    /// Index into `input_uris` of the input this output derives from
    #[serde(default)]
    pub source_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converter_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization_policy_hash: Option<String>,
}

impl OutputArtifact {
    pub fn new(path: impl Into<PathBuf>, object_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            object_name: object_name.into(),
            source_index: 0,
            variant_name: None,
            width: None,
            height: None,
            annotation_format: None,
            converter_version: None,
            normalization_policy_hash: None,
        }
    }

    /// Absolute path of the artifact given the output directory
    pub fn resolve(&self, output_dir: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            output_dir.join(&self.path)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOutput {
    pub outputs: Vec<OutputArtifact>,
}

#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, input: TransformInput) -> Result<TransformOutput, TransformError>;
}

/// Copies every input to the output directory unchanged
///
/// A single input keeps the key as its object name; several inputs are
/// grouped under `<key>/`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTransform;

#[async_trait]
impl Transform for PassthroughTransform {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn run(&self, input: TransformInput) -> Result<TransformOutput, TransformError> {
        let single = input.input_paths.len() == 1;
        let mut outputs = Vec::with_capacity(input.input_paths.len());

        for (index, source) in input.input_paths.iter().enumerate() {
            let file_name = source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| TransformError::Fatal(format!("bad input path {}", source.display())))?;

            let target = input.output_dir.join(format!("{index}-{file_name}"));
            tokio::fs::copy(source, &target)
                .await
                .map_err(|e| TransformError::Retryable(format!("copy {}: {e}", source.display())))?;

            let object_name = if single {
                input.key.clone()
            } else {
                format!("{}/{}", input.key, file_name)
            };
            let mut artifact = OutputArtifact::new(target, object_name);
            artifact.source_index = index;
            outputs.push(artifact);
        }

        Ok(TransformOutput { outputs })
    }
}

/// Runs an external program per key
///
/// The program receives `IMGPIPE_INPUTS` (newline-separated local paths),
/// `IMGPIPE_OUTPUT_DIR`, `IMGPIPE_STAGE`, `IMGPIPE_KEY` and
/// `IMGPIPE_STAGE_CONFIG` (JSON) and prints a [`TransformOutput`] as JSON on
/// stdout. Exit code 75 asks for a retry; any other failure is final.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
}

impl CommandTransform {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl Transform for CommandTransform {
    fn name(&self) -> &str {
        &self.program
    }

    async fn run(&self, input: TransformInput) -> Result<TransformOutput, TransformError> {
        let inputs = input
            .input_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");

        debug!(program = %self.program, key = %input.key, "Spawning transform");

        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("IMGPIPE_INPUTS", inputs)
            .env("IMGPIPE_OUTPUT_DIR", &input.output_dir)
            .env("IMGPIPE_STAGE", input.stage.to_string())
            .env("IMGPIPE_KEY", &input.key)
            .env("IMGPIPE_STAGE_CONFIG", input.stage_config.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out key drops this future; the child must not outlive it
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    TransformError::Fatal(format!("cannot run {}: {e}", self.program))
                }
                _ => TransformError::Retryable(format!("spawning {}: {e}", self.program)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.lines().rev().take(5).collect::<Vec<_>>();
            let message = format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            );
            warn!(key = %input.key, %message, "Transform failed");
            return Err(match output.status.code() {
                Some(RETRYABLE_EXIT_CODE) => TransformError::Retryable(message),
                _ => TransformError::Fatal(message),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            TransformError::Fatal(format!("{} printed invalid output JSON: {e}", self.program))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn input(dir: &Path, paths: Vec<PathBuf>) -> TransformInput {
        let output_dir = dir.join("output");
        std::fs::create_dir_all(&output_dir).unwrap();
        TransformInput {
            dataset_id: Uuid::new_v4(),
            stage: 1,
            key: "drone/a.jpg".to_string(),
            input_uris: paths.iter().map(|p| format!("s3://raw/{}", p.display())).collect(),
            input_paths: paths,
            output_dir,
            stage_config: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_passthrough_single_input_keeps_key() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.jpg");
        std::fs::write(&source, b"pixels").unwrap();

        let out = PassthroughTransform
            .run(input(dir.path(), vec![source]))
            .await
            .unwrap();
        assert_eq!(out.outputs.len(), 1);
        assert_eq!(out.outputs[0].object_name, "drone/a.jpg");
        assert_eq!(std::fs::read(&out.outputs[0].path).unwrap(), b"pixels");
    }

    #[test]
    fn test_parse_command_line() {
        let t = CommandTransform::parse("python3 -m augment --fast").unwrap();
        assert_eq!(t.name(), "python3");
        assert_eq!(t.args, vec!["-m", "augment", "--fast"]);
        assert!(CommandTransform::parse("   ").is_none());
    }

    #[test]
    fn test_output_json_defaults() {
        let out: TransformOutput = serde_json::from_str(
            r#"{"outputs":[{"path":"a_0.jpg","object_name":"a_0.jpg","variant_name":"flip","width":640}]}"#,
        )
        .unwrap();
        assert_eq!(out.outputs[0].source_index, 0);
        assert_eq!(out.outputs[0].width, Some(640));
        assert_eq!(
            out.outputs[0].resolve(Path::new("/lease/output")),
            PathBuf::from("/lease/output/a_0.jpg")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_exit_codes() {
        let dir = tempfile::tempdir().unwrap();

        let retry = CommandTransform::new("sh", vec!["-c".into(), "exit 75".into()]);
        let err = retry.run(input(dir.path(), vec![])).await.unwrap_err();
        assert!(err.is_retryable());

        let fatal = CommandTransform::new("sh", vec!["-c".into(), "echo boom >&2; exit 2".into()]);
        let err = fatal.run(input(dir.path(), vec![])).await.unwrap_err();
        assert!(matches!(err, TransformError::Fatal(ref m) if m.contains("boom")));

        let ok = CommandTransform::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo '{"outputs":[{"path":"x.jpg","object_name":"x.jpg"}]}'"#.into(),
            ],
        );
        let out = ok.run(input(dir.path(), vec![])).await.unwrap();
        assert_eq!(out.outputs[0].object_name, "x.jpg");
    }
}

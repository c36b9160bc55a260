//! Seam to the external config generator
//!
//! The generator turns the variables snapshot into proxy config files. It is
//! an external program; the control plane only runs it and checks its exit.

use crate::error::RenderError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `variables` into `output`
    async fn render(&self, variables: &Path, output: &Path) -> Result<(), RenderError>;
}

/// Runs the generator as a subprocess:
/// `<command...> --variables <path> --output <dir>`
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    command: String,
    timeout: Duration,
}

impl CommandRenderer {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, variables: &Path, output: &Path) -> Result<(), RenderError> {
        let argv = shell_words::split(&self.command).map_err(|e| RenderError::InvalidCommand(e.to_string()))?;
        let (program, args) = argv.split_first().ok_or(RenderError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--variables")
            .arg(variables)
            .arg("--output")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running: {:?}", cmd);
        let started = std::time::Instant::now();
        let child = cmd.spawn().map_err(RenderError::Spawn)?;

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(RenderError::Spawn)?,
            Err(_) => return Err(RenderError::Timeout(self.timeout.as_secs())),
        };

        if !result.status.success() {
            return Err(RenderError::Failed {
                code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        info!(
            output = %output.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Configuration rendered"
        );
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn script(dir: &Path, body: &str) -> String {
        let path = dir.join("gen.sh");
        std::fs::write(&path, format!("{body}\n")).unwrap();
        format!("sh {}", path.display())
    }

    #[tokio::test]
    async fn test_renderer_receives_paths() {
        let tmp = TempDir::new().unwrap();
        // Copies the variables file into the output dir
        let cmd = script(tmp.path(), r#"mkdir -p "$4" && cp "$2" "$4/vars.copy""#);
        let vars = tmp.path().join("vars.env");
        std::fs::write(&vars, "A=1\n").unwrap();
        let out = tmp.path().join("out");

        CommandRenderer::new(cmd, Duration::from_secs(5))
            .render(&vars, &out)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(out.join("vars.copy")).unwrap(), "A=1\n");
    }

    #[tokio::test]
    async fn test_renderer_failure_captures_stderr() {
        let tmp = TempDir::new().unwrap();
        let cmd = script(tmp.path(), "echo 'bad template' >&2; exit 3");

        let err = CommandRenderer::new(cmd, Duration::from_secs(5))
            .render(Path::new("/nonexistent"), tmp.path())
            .await
            .unwrap_err();

        match err {
            RenderError::Failed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "bad template");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_renderer_timeout() {
        let tmp = TempDir::new().unwrap();
        let cmd = script(tmp.path(), "sleep 5");

        let err = CommandRenderer::new(cmd, Duration::from_millis(100))
            .render(tmp.path(), tmp.path())
            .await
            .unwrap_err();

        assert!(matches!(err, RenderError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let err = CommandRenderer::new("  ", Duration::from_secs(1))
            .render(Path::new("a"), Path::new("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::EmptyCommand));
    }
}

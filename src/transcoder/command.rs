//! One external tool invocation.
//!
//! The tool runs with null stdio (and no console window on Windows); failures
//! surface only through the exit status. The wait is bounded by a timeout and
//! aborted by cancellation, and in both cases the child is killed.

use crate::cancel::CancelToken;
use crate::error::{OptimizeError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Converts string-like items into owned arguments.
pub fn to_string_vec<T, I>(items: I) -> Vec<String>
where
    T: ToString,
    I: IntoIterator<Item = T>,
{
    items.into_iter().map(|item| item.to_string()).collect()
}

/// Build a `Vec<String>` argument list from mixed string-like values.
///
/// ```ignore
/// let args = args!["-q", quality, input.display(), "-o", output.display()];
/// ```
#[macro_export]
macro_rules! args {
    [$($item:expr),* $(,)?] => {
        $crate::transcoder::command::to_string_vec([$($item.to_string()),*])
    };
}

/// A fully-built command line for one tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Tool name reported in errors
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File that must exist and be non-empty after a successful run
    pub output: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(tool: &str, program: PathBuf, args: Vec<String>) -> Self {
        Self {
            tool: tool.to_string(),
            program,
            args,
            output: None,
        }
    }

    pub fn expecting(mut self, output: &Path) -> Self {
        self.output = Some(output.to_path_buf());
        self
    }

    /// Run to completion, or fail with the tool name, arguments and status.
    pub async fn run(&self, timeout: Duration, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(OptimizeError::Cancelled);
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let start_time = Instant::now();
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OptimizeError::ToolMissing(self.tool.clone()),
            _ => OptimizeError::Io(e),
        })?;

        let status = tokio::select! {
            waited = tokio::time::timeout(timeout, child.wait()) => match waited {
                Ok(status) => status?,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(OptimizeError::ToolTimeout {
                        tool: self.tool.clone(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
            },
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                debug!("{} killed on cancellation", self.tool);
                return Err(OptimizeError::Cancelled);
            }
        };

        debug!(
            "{} {:?} finished with {:?} in {:?}",
            self.tool,
            self.args,
            status.code(),
            start_time.elapsed()
        );

        if !status.success() {
            return Err(OptimizeError::ToolFailed {
                tool: self.tool.clone(),
                args: self.args.clone(),
                status: status.code(),
            });
        }

        if let Some(output) = &self.output {
            ensure_non_empty(output).await?;
        }
        Ok(())
    }
}

/// An artifact counts as produced only if it exists with content
pub async fn ensure_non_empty(path: &Path) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(OptimizeError::EmptyOutput(path.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_args_macro_mixes_types() {
        let quality = 85;
        let result = args!["-q", quality, "--speed", 2];
        assert_eq!(result, vec!["-q", "85", "--speed", "2"]);
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_missing() {
        let inv = ToolInvocation::new(
            "no-such-tool",
            PathBuf::from("definitely-not-installed-tool-xyz"),
            vec![],
        );
        let err = inv
            .run(Duration::from_secs(5), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizeError::ToolMissing(ref t) if t == "no-such-tool"));
    }

    #[tokio::test]
    async fn test_cancelled_before_spawn() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let inv = ToolInvocation::new("x", PathBuf::from("x"), vec![]);
        let err = inv.run(Duration::from_secs(5), &cancel).await.unwrap_err();
        assert!(matches!(err, OptimizeError::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_output_rejected() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.png");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            ensure_non_empty(&empty).await,
            Err(OptimizeError::EmptyOutput(_))
        ));
        assert!(ensure_non_empty(&dir.path().join("missing.png")).await.is_err());

        std::fs::write(&empty, b"data").unwrap();
        tokio_test::assert_ok!(ensure_non_empty(&empty).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failure() {
        let inv = ToolInvocation::new("false", PathBuf::from("false"), args!["--ignored"]);
        let err = inv
            .run(Duration::from_secs(5), &CancelToken::new())
            .await
            .unwrap_err();
        match err {
            OptimizeError::ToolFailed { tool, args, status } => {
                assert_eq!(tool, "false");
                assert_eq!(args, vec!["--ignored"]);
                assert_eq!(status, Some(1));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_child() {
        let inv = ToolInvocation::new("sleep", PathBuf::from("sleep"), args!["5"]);
        let started = Instant::now();
        let err = inv
            .run(Duration::from_millis(100), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizeError::ToolTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}

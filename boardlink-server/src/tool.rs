//! External programs that do the actual programming.
//!
//! The server never speaks a programmer protocol itself. It hands a file
//! and a port to a command-line tool and interprets the exit status.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::tracing::prelude::*;

/// What a finished tool run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

#[async_trait]
pub trait ExternalTool: Send + Sync {
    /// Run to completion. Each stdout line is also sent to `lines` as it
    /// arrives.
    async fn run(
        &self,
        args: &[String],
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> io::Result<ToolOutput>;
}

/// An executable on disk.
pub struct ProcessTool {
    program: PathBuf,
}

impl ProcessTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ExternalTool for ProcessTool {
    async fn run(
        &self,
        args: &[String],
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> io::Result<ToolOutput> {
        debug!(program = %self.program.display(), args = ?args, "Running external tool");

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr not captured"))?;

        // Output may carry raw bytes from the target; decoded lossily.
        let read_stdout = async {
            let mut collected = String::new();
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            while reader.read_until(b'\n', &mut buf).await? > 0 {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if let Some(tx) = &lines {
                    let _ = tx.send(line.to_string());
                }
                collected.push_str(line);
                collected.push('\n');
                buf.clear();
            }
            Ok::<_, io::Error>(collected)
        };
        let read_stderr = async {
            let mut collected = Vec::new();
            stderr.read_to_end(&mut collected).await?;
            Ok::<_, io::Error>(String::from_utf8_lossy(&collected).into_owned())
        };

        // Always reap the child, even when reading its output failed.
        let (read, status) = tokio::join!(
            async { tokio::try_join!(read_stdout, read_stderr) },
            child.wait()
        );
        let status = status?;
        let (stdout, stderr) = read?;

        trace!(program = %self.program.display(), status = %status, "External tool finished");

        Ok(ToolOutput {
            success: status.success(),
            stdout,
            stderr,
        })
    }
}

/// The tools boards use, with their shared settings.
#[derive(Clone)]
pub struct Toolchain {
    /// Serial programmer for Arduino-style boards.
    pub avrdude: Arc<dyn ExternalTool>,
    pub avrdude_config: Option<PathBuf>,
    /// Helper for multi-port boards.
    pub ms1: Arc<dyn ExternalTool>,
}

impl Toolchain {
    pub fn from_config(config: &Config) -> Self {
        Self {
            avrdude: Arc::new(ProcessTool::new(&config.avrdude_path)),
            avrdude_config: config.avrdude_config.clone(),
            ms1: Arc::new(ProcessTool::new(&config.ms1_helper)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted tool for tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned outputs and records the arguments of every call.
    #[derive(Default)]
    pub struct ScriptedTool {
        pub calls: Mutex<Vec<Vec<String>>>,
        outputs: Mutex<VecDeque<ToolOutput>>,
        stdout_lines: Vec<String>,
    }

    impl ScriptedTool {
        pub fn succeeding() -> Self {
            Self::default()
        }

        pub fn with_outputs(outputs: Vec<ToolOutput>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into()),
                ..Default::default()
            }
        }

        pub fn with_lines(lines: &[&str]) -> Self {
            Self {
                stdout_lines: lines.iter().map(|l| l.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExternalTool for ScriptedTool {
        async fn run(
            &self,
            args: &[String],
            lines: Option<mpsc::UnboundedSender<String>>,
        ) -> io::Result<ToolOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            if let Some(tx) = lines {
                for line in &self.stdout_lines {
                    let _ = tx.send(line.clone());
                }
            }
            let output = self.outputs.lock().unwrap().pop_front();
            Ok(output.unwrap_or(ToolOutput {
                success: true,
                stdout: self.stdout_lines.join("\n"),
                stderr: String::new(),
            }))
        }
    }

    pub fn toolchain(avrdude: Arc<ScriptedTool>, ms1: Arc<ScriptedTool>) -> Toolchain {
        Toolchain {
            avrdude,
            avrdude_config: None,
            ms1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let output = ToolOutput {
            success: false,
            stdout: "a\n".into(),
            stderr: "b\n".into(),
        };
        assert_eq!(output.combined(), "a\nb");

        let output = ToolOutput {
            success: true,
            stdout: String::new(),
            stderr: "only err".into(),
        };
        assert_eq!(output.combined(), "only err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_tool_streams_lines() {
        let tool = ProcessTool::new("sh");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let args = vec!["-c".to_string(), "echo one; echo two; echo oops >&2".to_string()];

        let output = tool.run(&args, Some(tx)).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "one\ntwo\n");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_tool_reports_failure() {
        let tool = ProcessTool::new("sh");
        let output = tool
            .run(&["-c".to_string(), "exit 3".to_string()], None)
            .await
            .unwrap();
        assert!(!output.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_tool_keeps_non_utf8_output() {
        let tool = ProcessTool::new("sh");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let args = vec![
            "-c".to_string(),
            "printf 'Writing \\377\\n'; printf '\\376\\n' >&2; echo done".to_string(),
        ];

        let output = tool.run(&args, Some(tx)).await.unwrap();

        assert!(output.success);
        assert_eq!(output.stdout, "Writing \u{fffd}\ndone\n");
        assert_eq!(output.stderr, "\u{fffd}\n");
        assert_eq!(rx.recv().await.as_deref(), Some("Writing \u{fffd}"));
        assert_eq!(rx.recv().await.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let tool = ProcessTool::new("/nonexistent/boardlink-tool");
        assert!(tool.run(&[], None).await.is_err());
    }
}

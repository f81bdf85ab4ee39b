use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub max_runtime_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_runtime_secs: 30,
            max_output_bytes: 8 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    /// Full shell command line, e.g. `python -m py_compile src/x.py`.
    pub command: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub limits: SandboxLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecution {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: i32,
    /// Combined stdout + stderr, truncated to the output limit.
    pub output: String,
    pub timed_out: bool,
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxExecution>;
}

/// Runs whitelisted shell commands in the caller-supplied working
/// directory. The whitelist matches on the first token of the command
/// line; an empty whitelist allows everything (test configuration).
#[derive(Debug, Clone)]
pub struct LocalShellRunner {
    pub allowed_prefixes: Vec<String>,
}

impl LocalShellRunner {
    pub fn new(allowed_prefixes: Vec<String>) -> Self {
        Self { allowed_prefixes }
    }

    /// The build/test commands permitted by default.
    pub fn with_default_whitelist() -> Self {
        Self::new(
            [
                "mvn", "javac", "java", "gradle", "python", "python3", "pip", "cargo", "ls",
                "dir",
            ]
            .iter()
            .map(|c| (*c).to_owned())
            .collect(),
        )
    }

    fn command_allowed(&self, command: &str) -> bool {
        if self.allowed_prefixes.is_empty() {
            return true;
        }
        let first = command
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase();
        self.allowed_prefixes.iter().any(|prefix| first == *prefix)
    }
}

fn truncate_output(mut bytes: Vec<u8>, limit: usize) -> (String, bool) {
    let truncated = bytes.len() > limit;
    if truncated {
        bytes.truncate(limit);
    }
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        text.push_str("\n... [Output Truncated]");
    }
    (text, truncated)
}

/// Spawn, wait with a deadline, kill on overrun, and collect combined
/// output. Shared by both runners so no child outlives its budget.
async fn run_with_deadline(
    mut command: Command,
    limits: &SandboxLimits,
) -> Result<SandboxExecution> {
    let started_at = Utc::now();

    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.stdin(Stdio::null());

    let mut child = command.spawn().context("failed spawning sandbox child")?;
    let mut stdout = child.stdout.take().context("child stdout missing")?;
    let mut stderr = child.stderr.take().context("child stderr missing")?;

    let reader = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let _ = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
        out.extend_from_slice(&err);
        out
    };

    let deadline = Duration::from_secs(limits.max_runtime_secs.max(1));
    // Bind before matching so the joined future (and its borrow of the
    // child) is dropped before the timeout arm kills the process.
    let waited = timeout(deadline, async { tokio::join!(child.wait(), reader) }).await;
    match waited {
        Ok((status, combined)) => {
            let status = status.context("failed waiting for sandbox child")?;
            let ended_at = Utc::now();
            let (output, _) = truncate_output(combined, limits.max_output_bytes);
            let execution = SandboxExecution {
                started_at,
                ended_at,
                duration_ms: (ended_at - started_at).num_milliseconds(),
                exit_code: status.code().unwrap_or(-1),
                output,
                timed_out: false,
            };
            debug!(
                exit_code = execution.exit_code,
                duration_ms = execution.duration_ms,
                "sandbox command finished"
            );
            Ok(execution)
        }
        Err(_) => {
            warn!(
                max_runtime_secs = limits.max_runtime_secs,
                "sandbox command timed out, killing child"
            );
            let _ = child.start_kill();
            let _ = child.wait().await;
            let ended_at = Utc::now();
            Ok(SandboxExecution {
                started_at,
                ended_at,
                duration_ms: (ended_at - started_at).num_milliseconds(),
                exit_code: -1,
                output: format!(
                    "sandbox timeout after {} seconds",
                    limits.max_runtime_secs
                ),
                timed_out: true,
            })
        }
    }
}

#[async_trait]
impl SandboxRunner for LocalShellRunner {
    #[instrument(skip(self, request), fields(cwd = %request.cwd.display()))]
    async fn run(&self, request: SandboxRequest) -> Result<SandboxExecution> {
        if !self.command_allowed(&request.command) {
            bail!("command not allowed in sandbox: {}", request.command);
        }

        let mut command = Command::new("sh");
        command.arg("-c");
        command.arg(&request.command);
        command.current_dir(&request.cwd);
        command.envs(&request.env);
        command.kill_on_drop(true);

        run_with_deadline(command, &request.limits).await
    }
}

/// Language accepted by the isolated code runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecLanguage {
    Python,
    Js,
}

impl ExecLanguage {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "python" | "py" => Some(Self::Python),
            "js" | "javascript" | "node" => Some(Self::Js),
            _ => None,
        }
    }

    fn image(self) -> &'static str {
        match self {
            Self::Python => "python:3.11-slim",
            Self::Js => "node:18-alpine",
        }
    }

    fn interpreter(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Js => "node",
        }
    }
}

/// Executes model-written snippets inside a disposable container with no
/// network, a memory cap and a cpu cap. The snippet travels via a
/// temp-file mount rather than argv, which has length limits.
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    engine: String,
}

impl Default for ContainerRunner {
    fn default() -> Self {
        Self {
            engine: "docker".to_owned(),
        }
    }
}

impl ContainerRunner {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }

    #[instrument(skip(self, code), fields(lang = ?lang, code_len = code.len()))]
    pub async fn execute(
        &self,
        lang: ExecLanguage,
        code: &str,
        limits: SandboxLimits,
    ) -> Result<SandboxExecution> {
        let script = std::env::temp_dir().join(format!(
            "synapse_exec_{}_{}.tmp",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        tokio::fs::write(&script, code)
            .await
            .with_context(|| format!("failed staging exec script {script:?}"))?;

        info!(image = lang.image(), "executing snippet in container");

        let mut command = Command::new(&self.engine);
        command.args([
            "run",
            "--rm",
            "--network",
            "none",
            "--memory",
            "128m",
            "--cpus",
            "0.5",
            "-v",
        ]);
        command.arg(format!("{}:/code.script:ro", script.display()));
        command.arg(lang.image());
        command.arg(lang.interpreter());
        command.arg("/code.script");
        command.kill_on_drop(true);

        let execution = run_with_deadline(command, &limits).await;
        let _ = tokio::fs::remove_file(&script).await;
        execution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, secs: u64) -> SandboxRequest {
        SandboxRequest {
            command: command.to_owned(),
            cwd: std::env::temp_dir(),
            env: BTreeMap::new(),
            limits: SandboxLimits {
                max_runtime_secs: secs,
                max_output_bytes: 256,
            },
        }
    }

    #[tokio::test]
    async fn whitelisted_command_runs_and_reports_exit_code() {
        let runner = LocalShellRunner::new(vec!["ls".into()]);
        let execution = runner.run(request("ls", 5)).await.unwrap();
        assert_eq!(execution.exit_code, 0);
        assert!(!execution.timed_out);
    }

    #[tokio::test]
    async fn non_whitelisted_command_is_rejected() {
        let runner = LocalShellRunner::with_default_whitelist();
        let error = runner.run(request("rm -rf /", 5)).await.unwrap_err();
        assert!(error.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn whitelist_matches_first_token_only() {
        let runner = LocalShellRunner::with_default_whitelist();
        // `ls` allowed even with arguments; `else-ls` is not `ls`.
        assert!(runner.command_allowed("ls -la src"));
        assert!(!runner.command_allowed("else-ls"));
        assert!(runner.command_allowed("Python --version"));
    }

    #[tokio::test]
    async fn output_is_truncated_at_the_cap() {
        let runner = LocalShellRunner::new(vec![]);
        let execution = runner
            .run(request("yes x | head -c 4096", 5))
            .await
            .unwrap();
        assert!(execution.output.contains("[Output Truncated]"));
        assert!(execution.output.len() < 4096);
    }

    #[tokio::test]
    async fn overlong_child_is_killed() {
        let runner = LocalShellRunner::new(vec![]);
        let execution = runner.run(request("sleep 30", 1)).await.unwrap();
        assert!(execution.timed_out);
        assert_eq!(execution.exit_code, -1);
        assert!(execution.duration_ms < 10_000);
    }

    #[test]
    fn exec_language_aliases() {
        assert_eq!(ExecLanguage::parse("python"), Some(ExecLanguage::Python));
        assert_eq!(ExecLanguage::parse("py"), Some(ExecLanguage::Python));
        assert_eq!(ExecLanguage::parse("node"), Some(ExecLanguage::Js));
        assert_eq!(ExecLanguage::parse("ruby"), None);
    }
}

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::error::{FirewallError, Result};

/// Default bound for external tool invocations. The firewall tools normally
/// answer in well under a second; anything past this means the tool hung.
pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;

/// Characters that must never reach a shell from caller-controlled fields.
const ILLEGAL_CHARS: &[char] = &[
    '&', '|', ';', '$', '%', '@', '!', '`', '(', ')', '\'', '"', '<', '>', '\n', '\r', '\\',
];

/// Captured result of one subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Combined output the way the tools mix diagnostics across both streams.
    pub fn combined(&self) -> String {
        let mut s = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !s.is_empty() && !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&self.stderr);
        }
        s
    }
}

/// Rejects caller-influenced tokens that contain shell metacharacters.
/// Must run before any subprocess is spawned.
pub fn check_illegal(tokens: &[&str]) -> Result<()> {
    for token in tokens {
        if token.contains("$(") || token.contains("..") {
            return Err(FirewallError::IllegalToken {
                token: (*token).to_string(),
            });
        }
        if token.chars().any(|c| ILLEGAL_CHARS.contains(&c)) {
            return Err(FirewallError::IllegalToken {
                token: (*token).to_string(),
            });
        }
    }
    Ok(())
}

/// Runs a templated shell command line with a timeout.
///
/// The child is spawned through `sh -c` because the firewall tools are driven
/// with quoted compound arguments (rich rules). On timeout the child is
/// killed and a distinct timeout error returned; this is the only
/// cancellation mechanism for in-flight work.
pub async fn run_with_timeout(operation: &str, command: &str, timeout_ms: u64) -> Result<CommandOutput> {
    debug!(operation, command, "exec");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FirewallError::Internal(format!("failed to spawn `{command}`: {e}")))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let waited = timeout(Duration::from_millis(timeout_ms), async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stdout).await;
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stderr).await;
        }
        let status = child.wait().await;
        (status, stdout, stderr)
    })
    .await;

    match waited {
        Ok((status, stdout, stderr)) => {
            let status = status
                .map_err(|e| FirewallError::Internal(format!("failed waiting on `{command}`: {e}")))?;
            Ok(CommandOutput {
                code: status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
            })
        }
        // Child is killed via kill_on_drop when the future is discarded.
        Err(_) => Err(FirewallError::CommandTimeout {
            operation: operation.to_string(),
            command: command.to_string(),
            timeout_ms,
        }),
    }
}

/// Runs a command and maps a non-zero exit into `CommandFailed`.
pub async fn run_checked(operation: &str, command: &str, timeout_ms: u64) -> Result<CommandOutput> {
    let out = run_with_timeout(operation, command, timeout_ms).await?;
    if !out.success() {
        return Err(FirewallError::CommandFailed {
            operation: operation.to_string(),
            command: command.to_string(),
            code: out.code,
            stdout: out.stdout,
            stderr: out.stderr,
        });
    }
    Ok(out)
}

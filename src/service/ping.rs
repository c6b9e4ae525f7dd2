use std::fs;
use std::path::Path;

use crate::core::command::{run_with_timeout, DEFAULT_TIMEOUT_MS};
use crate::core::error::{FirewallError, Result};

/// The kernel key backing the ping toggle.
pub const PING_KEY: &str = "net.ipv4.icmp_echo_ignore_all";

/// Default location of the sysctl configuration.
pub const SYSCTL_CONF: &str = "/etc/sysctl.conf";

/// Reads whether ICMP echo is currently ignored, from the config file (the
/// file is the source of truth for the toggle, staged or loaded). A missing
/// file or key means ping is answered.
pub fn read_ping_blocked(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(false);
    }
    let content = fs::read_to_string(path)
        .map_err(|e| FirewallError::SysConfig(format!("read {}: {e}", path.display())))?;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == PING_KEY {
                return Ok(value.trim() == "1");
            }
        }
    }
    Ok(false)
}

/// Rewrites the config line-by-line, replacing the ping key in place or
/// appending it once, then asks the kernel to reload the settings.
///
/// The whole file is read and rewritten; a concurrent external edit during
/// the window is not detected.
pub async fn write_ping_blocked(path: impl AsRef<Path>, blocked: bool) -> Result<()> {
    let path = path.as_ref();
    let content = if path.exists() {
        fs::read_to_string(path)
            .map_err(|e| FirewallError::SysConfig(format!("read {}: {e}", path.display())))?
    } else {
        String::new()
    };

    let wanted = format!("{}={}", PING_KEY, i32::from(blocked));
    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    for line in content.lines() {
        let trimmed = line.trim();
        let is_key = !trimmed.starts_with('#')
            && trimmed
                .split_once('=')
                .is_some_and(|(k, _)| k.trim() == PING_KEY);
        if is_key {
            if !replaced {
                lines.push(wanted.clone());
                replaced = true;
            }
            // Duplicate key lines are collapsed into the one we wrote.
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(wanted);
    }

    let mut output = lines.join("\n");
    output.push('\n');
    fs::write(path, output)
        .map_err(|e| FirewallError::SysConfig(format!("write {}: {e}", path.display())))?;

    reload_sysctl().await
}

async fn reload_sysctl() -> Result<()> {
    let out = run_with_timeout("ping_toggle", "sysctl -p", DEFAULT_TIMEOUT_MS).await?;
    if out.success() {
        return Ok(());
    }
    // Diagnosis needs the command's own output; sysctl reports the failing
    // line on stdout.
    Err(FirewallError::SysConfig(format!(
        "sysctl -p failed (code {}): {}",
        out.code,
        out.combined()
    )))
}

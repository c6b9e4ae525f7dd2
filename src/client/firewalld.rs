use async_trait::async_trait;
use tracing::debug;

use crate::core::command::{check_illegal, run_checked, run_with_timeout, DEFAULT_TIMEOUT_MS};
use crate::core::error::{FirewallError, Result};

use super::{family_of, FireForward, FireInfo, FirewallClient, Operation};

/// Adapter for the daemon-style backend (firewalld / firewall-cmd).
///
/// All mutations go through `--permanent` and take effect on `reload`.
pub struct Firewalld {
    zone: String,
    timeout_ms: u64,
}

impl Firewalld {
    pub fn new() -> Self {
        Self {
            zone: "public".to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    async fn exec(&self, operation: &str, command: &str) -> Result<String> {
        let out = run_checked(operation, command, self.timeout_ms).await?;
        Ok(out.stdout)
    }

    /// A mutation that tolerates firewalld's "nothing to do" diagnostics so
    /// re-adding or re-removing a rule stays a no-op.
    async fn exec_tolerant(&self, operation: &str, command: &str) -> Result<()> {
        let out = run_with_timeout(operation, command, self.timeout_ms).await?;
        if out.success() {
            return Ok(());
        }
        let combined = out.combined();
        if combined.contains("NOT_ENABLED") || combined.contains("ALREADY_ENABLED") {
            debug!(operation, command, "firewalld reported no-op");
            return Ok(());
        }
        Err(FirewallError::CommandFailed {
            operation: operation.to_string(),
            command: command.to_string(),
            code: out.code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    fn build_rich_rule(info: &FireInfo, family: &str) -> String {
        let mut rule = format!("rule family=\"{family}\"");
        if !info.address.is_empty() {
            rule.push_str(&format!(" source address=\"{}\"", info.address));
        }
        if !info.port.is_empty() {
            rule.push_str(&format!(
                " port port=\"{}\" protocol=\"{}\"",
                info.port, info.protocol
            ));
        }
        rule.push(' ');
        rule.push_str(&info.strategy);
        rule
    }
}

impl Default for Firewalld {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Rich-Rule Grammar
// ===========================================================================

/// Token-prefix grammar for the rich-rule listing: which `key=` prefixes fill
/// which `FireInfo` field, kept as data so edge cases are testable in one
/// place.
const RICH_TOKEN_TABLE: &[(&str, RichField)] = &[
    ("family=", RichField::Family),
    ("address=", RichField::Address),
    ("ipset=", RichField::Address),
    ("port=", RichField::Port),
    ("protocol=", RichField::Protocol),
];

const STRATEGY_TOKENS: &[&str] = &["accept", "drop", "reject"];

#[derive(Clone, Copy)]
enum RichField {
    Family,
    Address,
    Port,
    Protocol,
}

/// Parses one rich-rule line of space-separated `key="value"` tokens plus a
/// bare trailing strategy token. Missing keys leave the field empty.
fn parse_rich_rule(line: &str) -> FireInfo {
    let mut info = FireInfo::default();
    for token in line.split_whitespace() {
        if STRATEGY_TOKENS.contains(&token) {
            info.strategy = token.to_string();
            continue;
        }
        for (prefix, field) in RICH_TOKEN_TABLE {
            if let Some(raw) = token.strip_prefix(prefix) {
                let value = raw.trim_matches(|c| c == '"' || c == '\'').to_string();
                match field {
                    RichField::Family => info.family = value,
                    RichField::Address => info.address = value,
                    RichField::Port => info.port = value,
                    RichField::Protocol => info.protocol = value,
                }
                break;
            }
        }
    }
    info
}

/// A rich rule counts as a port rule when it carries a port and is either
/// plain ipv4 or ipv6 with an explicit source; the bare ipv6 form is the
/// dual-stack duplicate of an ipv4 rule and is skipped.
fn is_port_rule(info: &FireInfo) -> bool {
    !info.port.is_empty() && (info.family == "ipv4" || !info.address.is_empty())
}

fn is_address_rule(info: &FireInfo) -> bool {
    info.port.is_empty() && !info.address.is_empty()
}

// ===========================================================================
// Capability Implementation
// ===========================================================================

#[async_trait]
impl FirewallClient for Firewalld {
    fn name(&self) -> &'static str {
        "firewalld"
    }

    async fn start(&self) -> Result<()> {
        self.exec("start", "systemctl start firewalld").await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.exec("stop", "systemctl stop firewalld").await?;
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.exec("restart", "systemctl restart firewalld").await?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.exec("reload", "firewall-cmd --reload").await?;
        Ok(())
    }

    async fn status(&self) -> Result<bool> {
        let out = run_with_timeout("status", "firewall-cmd --state", self.timeout_ms).await?;
        Ok(out.success() && out.stdout.trim() == "running")
    }

    async fn version(&self) -> Result<String> {
        let stdout = self.exec("version", "firewall-cmd --version").await?;
        Ok(stdout.trim().to_string())
    }

    async fn list_port(&self) -> Result<Vec<FireInfo>> {
        let mut rules = Vec::new();

        // Plain ports: whitespace-separated `port/protocol` pairs.
        let cmd = format!("firewall-cmd --zone={} --list-ports", self.zone);
        let stdout = self.exec("list_port", &cmd).await?;
        for pair in stdout.split_whitespace() {
            let Some((port, protocol)) = pair.split_once('/') else {
                continue;
            };
            rules.push(FireInfo {
                family: "ipv4".to_string(),
                port: port.to_string(),
                protocol: protocol.to_string(),
                strategy: "accept".to_string(),
                ..Default::default()
            });
        }

        // Rich rules that target a port.
        let cmd = format!("firewall-cmd --zone={} --list-rich-rules", self.zone);
        let stdout = self.exec("list_port", &cmd).await?;
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let info = parse_rich_rule(line);
            if is_port_rule(&info) {
                rules.push(info);
            }
        }

        Ok(rules)
    }

    async fn list_address(&self) -> Result<Vec<FireInfo>> {
        let cmd = format!("firewall-cmd --zone={} --list-rich-rules", self.zone);
        let stdout = self.exec("list_address", &cmd).await?;
        let mut rules = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let info = parse_rich_rule(line);
            if is_address_rule(&info) {
                rules.push(info);
            }
        }
        Ok(rules)
    }

    async fn list_forward(&self) -> Result<Vec<FireForward>> {
        let cmd = format!("firewall-cmd --zone={} --list-forward-ports", self.zone);
        let stdout = self.exec("list_forward", &cmd).await?;
        let mut forwards = Vec::new();
        for (idx, line) in stdout.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_forward_line(line) {
                Some(mut fwd) => {
                    fwd.num = (idx + 1) as u32;
                    forwards.push(fwd);
                }
                None => {
                    return Err(FirewallError::UnexpectedOutput {
                        command: cmd.clone(),
                        detail: format!("unrecognized forward entry: {line}"),
                    })
                }
            }
        }
        Ok(forwards)
    }

    async fn port(&self, info: &FireInfo, op: Operation) -> Result<()> {
        check_illegal(&[&info.port, &info.protocol])?;
        let verb = match op {
            Operation::Add => "add",
            Operation::Remove => "remove",
        };
        let cmd = format!(
            "firewall-cmd --zone={} --permanent --{verb}-port={}/{}",
            self.zone, info.port, info.protocol
        );
        self.exec_tolerant("port", &cmd).await
    }

    async fn rich_rules(&self, info: &FireInfo, op: Operation) -> Result<()> {
        check_illegal(&[&info.port, &info.protocol, &info.address, &info.strategy])?;
        let verb = match op {
            Operation::Add => "add",
            Operation::Remove => "remove",
        };

        let family = if info.family.is_empty() {
            family_of(&info.address).to_string()
        } else {
            info.family.clone()
        };
        let rule = Self::build_rich_rule(info, &family);
        let cmd = format!("firewall-cmd --permanent --{verb}-rich-rule='{rule}'");
        self.exec_tolerant("rich_rules", &cmd).await?;

        // The bare form defaults to ipv4 only; cover the other stack when no
        // explicit address pins the family.
        if info.address.is_empty() && family == "ipv4" {
            let rule = Self::build_rich_rule(info, "ipv6");
            let cmd = format!("firewall-cmd --permanent --{verb}-rich-rule='{rule}'");
            self.exec_tolerant("rich_rules", &cmd).await?;
        }
        Ok(())
    }

    async fn port_forward(&self, forward: &FireForward, op: Operation) -> Result<()> {
        check_illegal(&[
            &forward.port,
            &forward.protocol,
            &forward.target_ip,
            &forward.target_port,
        ])?;
        let verb = match op {
            Operation::Add => "add",
            Operation::Remove => "remove",
        };
        let mut spec = format!(
            "port={}:proto={}:toport={}",
            forward.port, forward.protocol, forward.target_port
        );
        // Absent toaddr means "this host"; only name an explicit remote.
        if !forward.target_ip.is_empty() && forward.target_ip != super::LOOPBACK {
            spec.push_str(&format!(":toaddr={}", forward.target_ip));
        }
        let cmd = format!(
            "firewall-cmd --zone={} --permanent --{verb}-forward-port={spec}",
            self.zone
        );
        self.exec_tolerant("port_forward", &cmd).await?;
        self.reload().await
    }

    async fn enable_forward(&self) -> Result<()> {
        let cmd = format!("firewall-cmd --zone={} --query-masquerade", self.zone);
        // Query answers "no" with a non-zero exit when masquerade is off.
        let out = run_with_timeout("enable_forward", &cmd, self.timeout_ms).await?;
        if out.success() && out.stdout.trim() == "yes" {
            return Ok(());
        }
        let cmd = format!("firewall-cmd --zone={} --permanent --add-masquerade", self.zone);
        self.exec("enable_forward", &cmd).await?;
        self.reload().await
    }
}

/// Parses one `port=<p>:proto=<proto>:toport=<p2>:toaddr=<addr>` entry.
fn parse_forward_line(line: &str) -> Option<FireForward> {
    let mut fwd = FireForward::default();
    for part in line.split(':') {
        let (key, value) = part.split_once('=')?;
        match key {
            "port" => fwd.port = value.to_string(),
            "proto" => fwd.protocol = value.to_string(),
            "toport" => fwd.target_port = value.to_string(),
            "toaddr" => fwd.target_ip = value.to_string(),
            _ => return None,
        }
    }
    if fwd.port.is_empty() || fwd.protocol.is_empty() || fwd.target_port.is_empty() {
        return None;
    }
    fwd.target_ip = super::forward_target_or_loopback(&fwd.target_ip);
    Some(fwd)
}

use async_trait::async_trait;
use tracing::debug;

use crate::core::command::{check_illegal, run_checked, run_with_timeout, DEFAULT_TIMEOUT_MS};
use crate::core::error::{FirewallError, Result};

use super::{family_of, FireForward, FireInfo, FirewallClient, NatHelper, Operation};

/// Adapter for the simplified line-oriented backend (ufw).
///
/// The tool has no rich-rule families and no forwarding primitive; structured
/// rules are synthesized textually and forwarding is delegated to the NAT
/// helper. Mutations take effect immediately, so `reload` is a no-op.
pub struct Ufw {
    nat: NatHelper,
    timeout_ms: u64,
}

/// The tool's "any source" sentinel in `status verbose` output.
const ANYWHERE: &str = "Anywhere";

/// Known phrasings of the position-invalid error; locale-variant, so several
/// spellings are matched before falling back to an unpositioned insert.
const POSITION_ERRORS: &[&str] = &[
    "invalid position",
    "position is invalid",
    "invalid insert position",
];

impl Ufw {
    pub fn new() -> Self {
        Self {
            nat: NatHelper::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    async fn exec(&self, operation: &str, command: &str) -> Result<String> {
        let out = run_checked(operation, command, self.timeout_ms).await?;
        Ok(out.stdout)
    }

    /// Runs a mutation, tolerating the tool's "nothing changed" diagnostics.
    async fn exec_tolerant(&self, operation: &str, command: &str) -> Result<()> {
        let out = run_with_timeout(operation, command, self.timeout_ms).await?;
        let combined = out.combined();
        if out.success()
            || combined.contains("Skipping")
            || combined.contains("Could not delete non-existent rule")
        {
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

    async fn status_table(&self, operation: &str) -> Result<String> {
        self.exec(operation, "ufw status verbose").await
    }
}

impl Default for Ufw {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Strategy Translation
// ===========================================================================

/// accept/drop on the unified side, allow/deny on the tool side. The mapping
/// is bijective so a rule applied as accept lists back as accept.
fn strategy_to_tool(strategy: &str) -> Result<&'static str> {
    match strategy {
        "accept" => Ok("allow"),
        "drop" => Ok("deny"),
        other => Err(FirewallError::InvalidStrategy {
            strategy: other.to_string(),
        }),
    }
}

fn strategy_from_tool(action: &str) -> Option<&'static str> {
    match action {
        "ALLOW" => Some("accept"),
        "DENY" => Some("drop"),
        // reject/limit lines fall outside the unified model.
        _ => None,
    }
}

// ===========================================================================
// Status-Table Grammar
// ===========================================================================

#[derive(Debug, PartialEq)]
enum ParsedLine {
    Port(FireInfo),
    Address(FireInfo),
}

/// Classifies one `status verbose` rule line.
///
/// A line with a numeric port (optionally `port/protocol`) is a port rule; a
/// line naming a specific source and lacking a port is an address rule. IPv6
/// duplicate lines (`(v6)`) and reject/limit lines are dropped.
fn parse_status_line(line: &str) -> Option<ParsedLine> {
    if line.contains("(v6)") {
        return None;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }

    let action_idx = parts
        .iter()
        .position(|p| matches!(*p, "ALLOW" | "DENY" | "REJECT" | "LIMIT"))?;
    let strategy = strategy_from_tool(parts[action_idx])?;

    // Only inbound rules correspond to the unified model.
    if parts.get(action_idx + 1) == Some(&"OUT") {
        return None;
    }

    let to_spec = parts[..action_idx].join(" ");
    let from_idx = if parts.get(action_idx + 1) == Some(&"IN") {
        action_idx + 2
    } else {
        action_idx + 1
    };
    let from_spec = parts.get(from_idx).copied().unwrap_or(ANYWHERE);

    let address = if from_spec == ANYWHERE {
        String::new()
    } else {
        from_spec.to_string()
    };

    if let Some((port, protocol)) = split_port_spec(&to_spec) {
        return Some(ParsedLine::Port(FireInfo {
            family: family_of(&address).to_string(),
            address,
            port,
            protocol,
            strategy: strategy.to_string(),
            ..Default::default()
        }));
    }

    if !address.is_empty() {
        return Some(ParsedLine::Address(FireInfo {
            family: family_of(&address).to_string(),
            address,
            strategy: strategy.to_string(),
            ..Default::default()
        }));
    }

    None
}

/// Splits a To column like `8080/tcp`, `53`, or `8080:8082/udp` into
/// `(port, protocol)`; a missing protocol means the rule covers both.
fn split_port_spec(spec: &str) -> Option<(String, String)> {
    let (port_part, proto) = match spec.split_once('/') {
        Some((p, proto)) => (p, proto.to_string()),
        None => (spec, "tcp/udp".to_string()),
    };
    let port = port_part.trim();
    if !port.chars().any(|c| c.is_ascii_digit())
        || !port.chars().all(|c| c.is_ascii_digit() || c == ',' || c == ':' || c == '-')
    {
        return None;
    }
    Some((port.replace(':', "-"), proto))
}

/// Builds the synthesized structured-rule command body shared by insert and
/// delete: `<allow|deny> [proto p] from <addr> to any [port <port>]`.
fn build_rule_body(info: &FireInfo, tool_strategy: &str) -> String {
    let mut body = tool_strategy.to_string();
    if !info.protocol.is_empty() && info.protocol != "tcp/udp" {
        body.push_str(&format!(" proto {}", info.protocol));
    }
    if info.address.is_empty() {
        body.push_str(" from any");
    } else if let Some((start, end)) = info.address.split_once('-') {
        // The tool has no source-range syntax; ranges are expressed across
        // the from/to slots.
        body.push_str(&format!(" from {start} to {end}"));
    } else {
        body.push_str(&format!(" from {}", info.address));
    }
    if !info.address.contains('-') {
        body.push_str(" to any");
    }
    if !info.port.is_empty() {
        body.push_str(&format!(" port {}", info.port.replace('-', ":")));
    }
    body
}

fn is_position_error(output: &str) -> bool {
    let lower = output.to_lowercase();
    POSITION_ERRORS.iter().any(|p| lower.contains(p))
}

// ===========================================================================
// Capability Implementation
// ===========================================================================

#[async_trait]
impl FirewallClient for Ufw {
    fn name(&self) -> &'static str {
        "ufw"
    }

    async fn start(&self) -> Result<()> {
        self.exec("start", "ufw --force enable").await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.exec("stop", "ufw disable").await?;
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    async fn reload(&self) -> Result<()> {
        // Mutations take effect immediately.
        Ok(())
    }

    async fn status(&self) -> Result<bool> {
        let out = run_with_timeout("status", "ufw status", self.timeout_ms).await?;
        for line in out.stdout.lines() {
            if let Some(value) = line.strip_prefix("Status:") {
                return Ok(value.trim() == "active");
            }
        }
        Ok(false)
    }

    async fn version(&self) -> Result<String> {
        let stdout = self.exec("version", "ufw version").await?;
        Ok(stdout.lines().next().unwrap_or("").trim().to_string())
    }

    async fn list_port(&self) -> Result<Vec<FireInfo>> {
        let stdout = self.status_table("list_port").await?;
        Ok(stdout
            .lines()
            .filter_map(parse_status_line)
            .filter_map(|parsed| match parsed {
                ParsedLine::Port(info) => Some(info),
                ParsedLine::Address(_) => None,
            })
            .collect())
    }

    async fn list_address(&self) -> Result<Vec<FireInfo>> {
        let stdout = self.status_table("list_address").await?;
        Ok(stdout
            .lines()
            .filter_map(parse_status_line)
            .filter_map(|parsed| match parsed {
                ParsedLine::Address(info) => Some(info),
                ParsedLine::Port(_) => None,
            })
            .collect())
    }

    async fn list_forward(&self) -> Result<Vec<FireForward>> {
        self.nat.list().await
    }

    async fn port(&self, info: &FireInfo, op: Operation) -> Result<()> {
        check_illegal(&[&info.port, &info.protocol, &info.strategy])?;
        if !info.address.is_empty() {
            // Direct port commands cannot carry a source.
            return self.rich_rules(info, op).await;
        }
        let strategy = strategy_to_tool(&info.strategy)?;
        let spec = if info.protocol.is_empty() || info.protocol == "tcp/udp" {
            info.port.replace('-', ":")
        } else {
            format!("{}/{}", info.port.replace('-', ":"), info.protocol)
        };
        let cmd = match op {
            Operation::Add => format!("ufw {strategy} {spec}"),
            Operation::Remove => format!("ufw delete {strategy} {spec}"),
        };
        self.exec_tolerant("port", &cmd).await
    }

    async fn rich_rules(&self, info: &FireInfo, op: Operation) -> Result<()> {
        check_illegal(&[&info.port, &info.protocol, &info.address, &info.strategy])?;
        let strategy = strategy_to_tool(&info.strategy)?;
        let body = build_rule_body(info, strategy);

        match op {
            Operation::Add => {
                // New rules go to the head so specific allows/denies beat the
                // tool's catch-all defaults.
                let cmd = format!("ufw insert 1 {body}");
                let out = run_with_timeout("rich_rules", &cmd, self.timeout_ms).await?;
                if out.success() || out.combined().contains("Skipping") {
                    return Ok(());
                }
                if is_position_error(&out.combined()) {
                    // An empty ruleset rejects explicit positions.
                    debug!(command = %cmd, "insert position rejected, retrying unpositioned");
                    return self.exec_tolerant("rich_rules", &format!("ufw {body}")).await;
                }
                Err(FirewallError::CommandFailed {
                    operation: "rich_rules".to_string(),
                    command: cmd,
                    code: out.code,
                    stdout: out.stdout,
                    stderr: out.stderr,
                })
            }
            Operation::Remove => self.exec_tolerant("rich_rules", &format!("ufw delete {body}")).await,
        }
    }

    async fn port_forward(&self, forward: &FireForward, op: Operation) -> Result<()> {
        match op {
            Operation::Add => self.nat.add(forward).await,
            Operation::Remove => {
                let num = if forward.num > 0 {
                    Some(forward.num)
                } else {
                    // Caller gave the target shape only; resolve the ordinal.
                    self.nat.list().await?.iter().find_map(|f| {
                        (f.port == forward.port
                            && f.target_port == forward.target_port
                            && f.target_ip == super::forward_target_or_loopback(&forward.target_ip))
                        .then_some(f.num)
                    })
                };
                match num {
                    Some(num) => self.nat.remove(num).await,
                    // Removing a rule that is already gone is a no-op.
                    None => Ok(()),
                }
            }
        }
    }

    async fn enable_forward(&self) -> Result<()> {
        self.nat.ensure_chain().await?;
        if !self.nat.chain_linked().await? {
            self.nat.link_chain().await?;
        }
        self.exec("enable_forward", "ufw reload").await?;
        Ok(())
    }
}

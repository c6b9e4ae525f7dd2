use regex::Regex;
use tracing::debug;

use crate::core::command::{check_illegal, run_checked, run_with_timeout, DEFAULT_TIMEOUT_MS};
use crate::core::error::{FirewallError, Result};

use super::{forward_target_or_loopback, FireForward, LOOPBACK};

/// Dedicated nat-table chain holding every forwarding entry this engine owns.
pub const NAT_CHAIN: &str = "HOSTFW-FORWARD";

/// Wraps the low-level packet-forwarding table for the backend that has no
/// native port-forwarding. Entries live in one dedicated chain linked from
/// PREROUTING, addressed by their line number.
pub struct NatHelper {
    chain: String,
    timeout_ms: u64,
}

impl NatHelper {
    pub fn new() -> Self {
        Self {
            chain: NAT_CHAIN.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Creates the chain if missing; an existing chain is not an error.
    pub async fn ensure_chain(&self) -> Result<()> {
        let cmd = format!("iptables -t nat -N {}", self.chain);
        let out = run_with_timeout("ensure_chain", &cmd, self.timeout_ms).await?;
        if out.success() || out.combined().contains("Chain already exists") {
            return Ok(());
        }
        Err(FirewallError::CommandFailed {
            operation: "ensure_chain".to_string(),
            command: cmd,
            code: out.code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    /// Whether PREROUTING already jumps into our chain, keyed by target name
    /// so repeated setup never appends a second jump.
    pub async fn chain_linked(&self) -> Result<bool> {
        let cmd = "iptables -t nat -L PREROUTING -n".to_string();
        let out = run_checked("chain_linked", &cmd, self.timeout_ms).await?;
        Ok(is_chain_linked(&out.stdout, &self.chain))
    }

    pub async fn link_chain(&self) -> Result<()> {
        let cmd = format!("iptables -t nat -A PREROUTING -j {}", self.chain);
        run_checked("link_chain", &cmd, self.timeout_ms).await?;
        Ok(())
    }

    /// Lists forwarding entries with their line numbers.
    pub async fn list(&self) -> Result<Vec<FireForward>> {
        let cmd = format!("iptables -t nat -nL {} --line-numbers", self.chain);
        let out = run_with_timeout("nat_list", &cmd, self.timeout_ms).await?;
        if !out.success() {
            // A missing chain simply means nothing is forwarded yet.
            if out.combined().contains("No chain") {
                return Ok(Vec::new());
            }
            return Err(FirewallError::CommandFailed {
                operation: "nat_list".to_string(),
                command: cmd,
                code: out.code,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        Ok(parse_nat_listing(&out.stdout))
    }

    pub async fn add(&self, forward: &FireForward) -> Result<()> {
        check_illegal(&[
            &forward.port,
            &forward.protocol,
            &forward.target_ip,
            &forward.target_port,
        ])?;
        let dport = forward.port.replace('-', ":");
        let cmd = if forward.target_ip.is_empty() || forward.target_ip == LOOPBACK {
            format!(
                "iptables -t nat -A {} -p {} --dport {} -j REDIRECT --to-ports {}",
                self.chain, forward.protocol, dport, forward.target_port
            )
        } else {
            format!(
                "iptables -t nat -A {} -p {} --dport {} -j DNAT --to-destination {}:{}",
                self.chain, forward.protocol, dport, forward.target_ip, forward.target_port
            )
        };
        run_checked("nat_add", &cmd, self.timeout_ms).await?;
        Ok(())
    }

    /// Deletes one entry by line number. A vanished entry is tolerated so
    /// repeated removals stay no-ops.
    pub async fn remove(&self, num: u32) -> Result<()> {
        let cmd = format!("iptables -t nat -D {} {}", self.chain, num);
        let out = run_with_timeout("nat_remove", &cmd, self.timeout_ms).await?;
        if out.success() || out.combined().contains("does a matching rule exist") {
            return Ok(());
        }
        let combined = out.combined();
        if combined.contains("Index of deletion too big") || combined.contains("No chain") {
            debug!(num, "nat entry already gone");
            return Ok(());
        }
        Err(FirewallError::CommandFailed {
            operation: "nat_remove".to_string(),
            command: cmd,
            code: out.code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}

impl Default for NatHelper {
    fn default() -> Self {
        Self::new()
    }
}

fn is_chain_linked(listing: &str, chain: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().next() == Some(chain))
}

/// Parses `iptables -t nat -nL <chain> --line-numbers` output, e.g.
///
/// ```text
/// Chain HOSTFW-FORWARD (1 references)
/// num  target     prot opt source       destination
/// 1    REDIRECT   tcp  --  0.0.0.0/0    0.0.0.0/0   tcp dpt:8080 redir ports 8081
/// 2    DNAT       udp  --  0.0.0.0/0    0.0.0.0/0   udp dpt:53 to:10.0.0.2:5353
/// ```
fn parse_nat_listing(stdout: &str) -> Vec<FireForward> {
    // Inline compiles; listing sizes are tiny.
    let head = Regex::new(r"^\s*(\d+)\s+(REDIRECT|DNAT)\s+(\S+)").unwrap();
    let dport = Regex::new(r"dpts?:(\S+)").unwrap();
    let redirect = Regex::new(r"redir ports (\S+)").unwrap();
    let dnat = Regex::new(r"to:(\S+):(\S+)$").unwrap();

    let mut forwards = Vec::new();
    for line in stdout.lines() {
        let Some(caps) = head.captures(line) else {
            continue;
        };
        let num: u32 = caps[1].parse().unwrap_or(0);
        let target = &caps[2];
        let protocol = normalize_proto(&caps[3]);

        let Some(port) = dport.captures(line).map(|c| c[1].replace(':', "-")) else {
            continue;
        };

        let (target_ip, target_port) = if target == "REDIRECT" {
            match redirect.captures(line) {
                Some(c) => (String::new(), c[1].to_string()),
                None => continue,
            }
        } else {
            match dnat.captures(line) {
                Some(c) => (c[1].to_string(), c[2].to_string()),
                None => continue,
            }
        };

        forwards.push(FireForward {
            num,
            protocol,
            port,
            target_ip: forward_target_or_loopback(&target_ip),
            target_port,
        });
    }
    forwards
}

// Older iptables prints protocol numbers in the prot column.
fn normalize_proto(prot: &str) -> String {
    match prot {
        "6" => "tcp".to_string(),
        "17" => "udp".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Chain HOSTFW-FORWARD (1 references)
num  target     prot opt source               destination
1    REDIRECT   tcp  --  0.0.0.0/0            0.0.0.0/0            tcp dpt:8080 redir ports 8081
2    DNAT       udp  --  0.0.0.0/0            0.0.0.0/0            udp dpt:53 to:10.0.0.2:5353
3    DNAT       tcp  --  0.0.0.0/0            0.0.0.0/0            tcp dpts:9000:9010 to:192.168.1.4:9000
";

    #[test]
    fn test_parse_nat_listing_redirect_and_dnat() {
        let forwards = parse_nat_listing(LISTING);
        assert_eq!(forwards.len(), 3);

        assert_eq!(forwards[0].num, 1);
        assert_eq!(forwards[0].protocol, "tcp");
        assert_eq!(forwards[0].port, "8080");
        assert_eq!(forwards[0].target_ip, "127.0.0.1");
        assert_eq!(forwards[0].target_port, "8081");

        assert_eq!(forwards[1].target_ip, "10.0.0.2");
        assert_eq!(forwards[1].target_port, "5353");

        // Port ranges come back in dash form.
        assert_eq!(forwards[2].port, "9000-9010");
        assert_eq!(forwards[2].target_ip, "192.168.1.4");
    }

    #[test]
    fn test_parse_nat_listing_skips_headers_and_foreign_targets() {
        let listing = "\
Chain HOSTFW-FORWARD (1 references)
num  target     prot opt source               destination
1    MASQUERADE all  --  0.0.0.0/0            0.0.0.0/0
";
        assert!(parse_nat_listing(listing).is_empty());
    }

    #[test]
    fn test_is_chain_linked_matches_target_column_only() {
        let listing = "\
Chain PREROUTING (policy ACCEPT)
target     prot opt source               destination
DOCKER     all  --  0.0.0.0/0            0.0.0.0/0
HOSTFW-FORWARD  all  --  0.0.0.0/0       0.0.0.0/0
";
        assert!(is_chain_linked(listing, "HOSTFW-FORWARD"));
        assert!(!is_chain_linked(listing, "UFW-NAT"));
        // The word appearing elsewhere in a line must not count.
        let noisy = "target\nDOCKER all -- 0.0.0.0/0 HOSTFW-FORWARD\n";
        assert!(!is_chain_linked(noisy, "HOSTFW-FORWARD"));
    }
}

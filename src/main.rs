use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hostfw::service::{
    ping, AddressRule, FileStore, FirewallService, ForwardRule, PortRule, SearchFilters,
    SearchReq, UpdateDescription,
};
use hostfw::{pick_client, Operation, RuleKind};

/// Host firewall management over firewalld or ufw.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Where rule descriptions are persisted
    #[arg(long, default_value = "/var/lib/hostfw/descriptions.json")]
    store: PathBuf,

    /// Pretty-print JSON outputs
    #[arg(long)]
    json_pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show backend name, state, version, and the ping toggle
    BaseInfo,

    /// start | stop | restart | enable-ping | disable-ping
    Operate {
        operation: String,
        /// Management port kept open on start alongside 22/80/443
        #[arg(long, default_value_t = 8888)]
        panel_port: u16,
    },

    /// List live rules of one kind with their descriptions
    Search {
        /// port | address | forward
        kind: String,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        target_port: Option<String>,
        #[arg(long)]
        target_ip: Option<String>,
        /// true = only described rules, false = only undescribed
        #[arg(long)]
        used: Option<bool>,
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        /// 0 returns everything
        #[arg(long, default_value_t = 0)]
        page_size: usize,
    },

    /// Add or remove a port rule (lists, ranges, and tcp/udp expand)
    PortRule {
        /// add | remove
        operation: String,
        port: String,
        #[arg(default_value = "tcp")]
        protocol: String,
        #[arg(long, default_value = "")]
        address: String,
        #[arg(long, default_value = "accept")]
        strategy: String,
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Add or remove a source-address rule
    AddressRule {
        /// add | remove
        operation: String,
        address: String,
        #[arg(long, default_value = "drop")]
        strategy: String,
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Add or remove a port forward
    ForwardRule {
        /// add | remove
        operation: String,
        port: String,
        target_port: String,
        #[arg(long, default_value = "tcp")]
        protocol: String,
        /// Defaults to the loopback redirect
        #[arg(long, default_value = "")]
        target_ip: String,
        /// Line ordinal, used when removing
        #[arg(long, default_value_t = 0)]
        num: u32,
    },

    /// Replace an existing port rule with a new one
    UpdatePortRule {
        /// JSON object for the rule being replaced
        old: String,
        /// JSON object for the replacement
        new: String,
    },

    /// Replace an existing address rule with a new one
    UpdateAddressRule {
        old: String,
        new: String,
    },

    /// Apply a JSON array of port rules from a file or stdin
    Batch {
        /// Path to a JSON array of rules; stdin when omitted
        file: Option<PathBuf>,
    },

    /// Edit the description of an existing rule without touching it
    UpdateDescription {
        /// port | address
        kind: String,
        port: String,
        protocol: String,
        strategy: String,
        description: String,
        #[arg(long, default_value = "")]
        address: String,
    },

    /// Show or set whether ICMP echo is ignored
    Ping {
        /// Omit to print the current state
        #[arg(long)]
        blocked: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(fw) = e.downcast_ref::<hostfw::FirewallError>() {
                eprintln!(
                    "{}",
                    serde_json::json!({ "code": fw.to_error_code(), "message": fw.to_string() })
                );
                std::process::exit(1);
            }
            Err(e)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = pick_client()?;
    let store = Arc::new(FileStore::open(&cli.store)?);
    let service = FirewallService::new(client, store);

    match cli.command {
        Command::BaseInfo => {
            print_json(&service.load_base_info().await, cli.json_pretty)?;
        }
        Command::Operate {
            operation,
            panel_port,
        } => {
            service.operate(&operation, panel_port).await?;
        }
        Command::Search {
            kind,
            address,
            port,
            target_port,
            target_ip,
            used,
            strategy,
            page,
            page_size,
        } => {
            let req = SearchReq {
                kind: RuleKind::from_str(&kind)?,
                filters: SearchFilters {
                    address,
                    port,
                    target_port,
                    target_ip,
                    used,
                    strategy,
                },
                page,
                page_size,
            };
            print_json(&service.search_rules(&req).await?, cli.json_pretty)?;
        }
        Command::PortRule {
            operation,
            port,
            protocol,
            address,
            strategy,
            description,
        } => {
            let req = PortRule {
                port,
                protocol,
                address,
                strategy,
                description,
                operation: Operation::from_str(&operation)?,
            };
            print_json(&service.operate_port_rule(&req).await?, cli.json_pretty)?;
        }
        Command::AddressRule {
            operation,
            address,
            strategy,
            description,
        } => {
            let req = AddressRule {
                address,
                strategy,
                description,
                operation: Operation::from_str(&operation)?,
            };
            print_json(&service.operate_address_rule(&req).await?, cli.json_pretty)?;
        }
        Command::ForwardRule {
            operation,
            port,
            target_port,
            protocol,
            target_ip,
            num,
        } => {
            let rule = ForwardRule {
                num,
                protocol,
                port,
                target_ip,
                target_port,
                operation: Operation::from_str(&operation)?,
            };
            print_json(&service.operate_forward_rule(&[rule]).await?, cli.json_pretty)?;
        }
        Command::UpdatePortRule { old, new } => {
            let old: PortRule = serde_json::from_str(&old).context("parsing old rule")?;
            let new: PortRule = serde_json::from_str(&new).context("parsing new rule")?;
            print_json(&service.update_port_rule(&old, &new).await?, cli.json_pretty)?;
        }
        Command::UpdateAddressRule { old, new } => {
            let old: AddressRule = serde_json::from_str(&old).context("parsing old rule")?;
            let new: AddressRule = serde_json::from_str(&new).context("parsing new rule")?;
            print_json(
                &service.update_address_rule(&old, &new).await?,
                cli.json_pretty,
            )?;
        }
        Command::Batch { file } => {
            let payload = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("reading rules from stdin")?;
                    buf
                }
            };
            let rules: Vec<PortRule> =
                serde_json::from_str(&payload).context("parsing rule list")?;
            print_json(&service.batch_operate_rule(&rules).await?, cli.json_pretty)?;
        }
        Command::UpdateDescription {
            kind,
            port,
            protocol,
            strategy,
            description,
            address,
        } => {
            let req = UpdateDescription {
                kind: RuleKind::from_str(&kind)?,
                port,
                protocol,
                address,
                strategy,
                description,
            };
            service.update_description(&req)?;
        }
        Command::Ping { blocked } => match blocked {
            Some(true) => service.operate("disable-ping", 0).await?,
            Some(false) => service.operate("enable-ping", 0).await?,
            None => {
                let blocked = ping::read_ping_blocked(ping::SYSCTL_CONF)?;
                print_json(&serde_json::json!({ "ping_blocked": blocked }), cli.json_pretty)?;
            }
        },
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}

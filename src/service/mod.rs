pub mod ping;
pub mod repo;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::{
    forward_target_or_loopback, FireForward, FireInfo, FirewallClient, Operation, RuleKind,
    Strategy,
};
use crate::core::command::{check_illegal, run_with_timeout, DEFAULT_TIMEOUT_MS};
use crate::core::error::{FirewallError, Result};

pub use repo::{DescriptionRecord, DescriptionStore, FileStore, MemoryStore, NaturalKey};

// ===========================================================================
// Request / Response Types
// ===========================================================================

/// Merged backend summary; individual probe failures degrade their field to
/// a sentinel instead of failing the whole call.
#[derive(Debug, Clone, Serialize)]
pub struct BaseInfo {
    pub name: String,
    /// "running", "not running", or "unknown" when the probe failed.
    pub status: String,
    /// "-" when the probe failed.
    pub version: String,
    pub ping_blocked: bool,
}

/// A logical port request before expansion. `port` may be a single port, a
/// comma list, or a dash range; `protocol` may be the dual form `tcp/udp`;
/// `address` may be a comma list of sources (empty = any).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRule {
    pub port: String,
    pub protocol: String,
    #[serde(default)]
    pub address: String,
    pub strategy: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub operation: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRule {
    pub address: String,
    pub strategy: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub operation: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRule {
    #[serde(default)]
    pub num: u32,
    pub protocol: String,
    pub port: String,
    #[serde(default)]
    pub target_ip: String,
    pub target_port: String,
    pub operation: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDescription {
    pub kind: RuleKind,
    pub port: String,
    pub protocol: String,
    pub address: String,
    pub strategy: String,
    pub description: String,
}

/// How much of an expanded batch went through. `Ok` means all of it; a
/// failure partway through surfaces as `FirewallError::PartialBatch` carrying
/// the same counts, so callers can retry the remainder instead of assuming
/// all-or-nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub applied: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub target_port: Option<String>,
    #[serde(default)]
    pub target_ip: Option<String>,
    /// Some(true) = only rules with a description record.
    #[serde(default)]
    pub used: Option<bool>,
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchReq {
    pub kind: RuleKind,
    #[serde(default)]
    pub filters: SearchFilters,
    /// 1-based.
    pub page: usize,
    /// 0 = everything.
    pub page_size: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub total: usize,
    pub items: SearchItems,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SearchItems {
    Rules(Vec<FireInfo>),
    Forwards(Vec<FireForward>),
}

// ===========================================================================
// Service
// ===========================================================================

/// The orchestration layer: expands logical requests into atomic backend
/// calls, keeps the description side-table in step with live rule state, and
/// lazily garbage-collects orphaned metadata.
pub struct FirewallService {
    client: Arc<dyn FirewallClient>,
    store: Arc<dyn DescriptionStore>,
    sysconf_path: PathBuf,
    engine_restart_cmd: String,
}

impl FirewallService {
    pub fn new(client: Arc<dyn FirewallClient>, store: Arc<dyn DescriptionStore>) -> Self {
        Self {
            client,
            store,
            sysconf_path: PathBuf::from(ping::SYSCTL_CONF),
            engine_restart_cmd: "systemctl restart docker".to_string(),
        }
    }

    pub fn with_sysconf_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sysconf_path = path.into();
        self
    }

    pub fn with_engine_restart_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.engine_restart_cmd = cmd.into();
        self
    }

    // =======================================================================
    // Base Info
    // =======================================================================

    /// Gathers name, running state, version, and the ping toggle with
    /// independent concurrent probes; the caller blocks until all complete.
    pub async fn load_base_info(&self) -> BaseInfo {
        let status_client = Arc::clone(&self.client);
        let status_task = tokio::spawn(async move { status_client.status().await });
        let version_client = Arc::clone(&self.client);
        let version_task = tokio::spawn(async move { version_client.version().await });
        let conf = self.sysconf_path.clone();
        let ping_task = tokio::spawn(async move { ping::read_ping_blocked(&conf) });

        let status = match status_task.await {
            Ok(Ok(true)) => "running".to_string(),
            Ok(Ok(false)) => "not running".to_string(),
            other => {
                warn!(?other, "status probe degraded");
                "unknown".to_string()
            }
        };
        let version = match version_task.await {
            Ok(Ok(v)) => v,
            other => {
                warn!(?other, "version probe degraded");
                "-".to_string()
            }
        };
        let ping_blocked = matches!(ping_task.await, Ok(Ok(true)));

        BaseInfo {
            name: self.client.name().to_string(),
            status,
            version,
            ping_blocked,
        }
    }

    // =======================================================================
    // Lifecycle Operations
    // =======================================================================

    pub async fn operate(&self, operation: &str, panel_port: u16) -> Result<()> {
        match operation {
            "start" => self.start(panel_port).await,
            "stop" => {
                self.client.stop().await?;
                self.restart_container_engine().await;
                Ok(())
            }
            "restart" => {
                self.client.restart().await?;
                self.restart_container_engine().await;
                Ok(())
            }
            "enable-ping" => ping::write_ping_blocked(&self.sysconf_path, false).await,
            "disable-ping" => ping::write_ping_blocked(&self.sysconf_path, true).await,
            other => Err(FirewallError::Internal(format!(
                "unsupported firewall operation: {other}"
            ))),
        }
    }

    /// Starts the backend and re-opens the baseline ports before reloading.
    /// A baseline failure stops the backend again so a box is never left
    /// reachable only through a half-opened firewall.
    async fn start(&self, panel_port: u16) -> Result<()> {
        self.client.start().await?;
        for port in baseline_ports(panel_port) {
            let info = FireInfo {
                port: port.to_string(),
                protocol: "tcp".to_string(),
                strategy: "accept".to_string(),
                ..Default::default()
            };
            if let Err(e) = self.client.port(&info, Operation::Add).await {
                if let Err(stop_err) = self.client.stop().await {
                    warn!(error = %stop_err, "rollback stop failed");
                }
                return Err(e);
            }
        }
        self.client.reload().await?;
        self.restart_container_engine().await;
        Ok(())
    }

    /// The backend's own restart can reset chains the container engine
    /// depends on; bouncing it is best-effort and its failure is ignored.
    async fn restart_container_engine(&self) {
        match run_with_timeout("container_engine", &self.engine_restart_cmd, DEFAULT_TIMEOUT_MS)
            .await
        {
            Ok(out) if !out.success() => {
                warn!(code = out.code, "container engine restart failed")
            }
            Err(e) => warn!(error = %e, "container engine restart failed"),
            _ => {}
        }
    }

    // =======================================================================
    // Search & Reconciliation
    // =======================================================================

    pub async fn search_rules(&self, req: &SearchReq) -> Result<SearchResult> {
        let result = match req.kind {
            RuleKind::Port | RuleKind::Address => self.search_infos(req).await?,
            RuleKind::Forward => self.search_forwards(req).await?,
        };
        self.spawn_reconcile();
        Ok(result)
    }

    async fn search_infos(&self, req: &SearchReq) -> Result<SearchResult> {
        let live = match req.kind {
            RuleKind::Port => self.client.list_port().await?,
            RuleKind::Address => self.client.list_address().await?,
            RuleKind::Forward => unreachable!(),
        };
        let filters = &req.filters;

        let mut filtered: Vec<FireInfo> = live
            .into_iter()
            .filter(|info| {
                filters
                    .address
                    .as_deref()
                    .map_or(true, |needle| info.address.contains(needle))
                    && filters
                        .port
                        .as_deref()
                        .map_or(true, |needle| info.port.contains(needle))
            })
            .collect();

        for info in &mut filtered {
            let key = NaturalKey::of_info(req.kind, info);
            info.used_status = self.store.find(&key)?.is_some();
        }
        if let Some(used) = filters.used {
            filtered.retain(|info| info.used_status == used);
        }
        if let Some(strategy) = &filters.strategy {
            filtered.retain(|info| &info.strategy == strategy);
        }

        let total = filtered.len();
        let mut page = paginate(filtered, req.page, req.page_size);
        for info in &mut page {
            if info.used_status {
                let key = NaturalKey::of_info(req.kind, info);
                if let Some(record) = self.store.find(&key)? {
                    info.description = record.description;
                }
            }
        }

        Ok(SearchResult {
            total,
            items: SearchItems::Rules(page),
        })
    }

    async fn search_forwards(&self, req: &SearchReq) -> Result<SearchResult> {
        let filters = &req.filters;
        let filtered: Vec<FireForward> = self
            .client
            .list_forward()
            .await?
            .into_iter()
            .filter(|fwd| {
                filters
                    .port
                    .as_deref()
                    .map_or(true, |needle| fwd.port.contains(needle))
                    && filters
                        .target_port
                        .as_deref()
                        .map_or(true, |needle| fwd.target_port.contains(needle))
                    && filters
                        .target_ip
                        .as_deref()
                        .map_or(true, |needle| fwd.target_ip.contains(needle))
            })
            .collect();
        let total = filtered.len();
        Ok(SearchResult {
            total,
            items: SearchItems::Forwards(paginate(filtered, req.page, req.page_size)),
        })
    }

    /// Lazy garbage collection of orphaned metadata, dispatched after every
    /// search. Shares no locks with the foreground path and may race with a
    /// concurrent mutation; its effects are only eventually consistent.
    fn spawn_reconcile(&self) {
        let client = Arc::clone(&self.client);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = reconcile_orphans(client, store).await {
                warn!(error = %e, "description reconciliation failed");
            }
        });
    }

    // =======================================================================
    // Rule Operations
    // =======================================================================

    /// Expands one logical port request into atomic backend calls: protocol
    /// split on `/`, address split on `,`, port lists split per entry. Dash
    /// ranges pass through untouched except when a source address is present
    /// on the simplified backend, which cannot combine address and range in
    /// one rule and gets one call per port instead.
    pub async fn operate_port_rule(&self, req: &PortRule) -> Result<BatchOutcome> {
        check_illegal(&[&req.port, &req.protocol, &req.address, &req.strategy])?;
        validate_port_spec(&req.port)?;
        Strategy::from_str(&req.strategy)?;
        let protocols = split_protocols(&req.protocol)?;
        let addresses = split_addresses(&req.address);

        let split_ranges_with_address = self.client.name() == "ufw";
        let mut calls = Vec::new();
        for protocol in &protocols {
            for address in &addresses {
                let ports =
                    expand_ports(&req.port, !address.is_empty() && split_ranges_with_address)?;
                for port in ports {
                    calls.push(FireInfo {
                        port,
                        protocol: protocol.clone(),
                        address: address.clone(),
                        strategy: req.strategy.clone(),
                        ..Default::default()
                    });
                }
            }
        }

        let total = calls.len();
        let mut applied = 0;
        for info in &calls {
            let result = if info.address.is_empty() && info.strategy == "accept" {
                self.client.port(info, req.operation).await
            } else {
                self.client.rich_rules(info, req.operation).await
            };
            if let Err(e) = result {
                // Rules before the failing step stay applied and recorded;
                // there is no compensating transaction.
                return Err(partial(applied, total, e));
            }
            self.sync_description(RuleKind::Port, info, req.operation, &req.description)?;
            applied += 1;
        }
        self.client.reload().await?;
        Ok(BatchOutcome { applied, total })
    }

    pub async fn operate_address_rule(&self, req: &AddressRule) -> Result<BatchOutcome> {
        check_illegal(&[&req.address, &req.strategy])?;
        Strategy::from_str(&req.strategy)?;
        let addresses: Vec<String> = req
            .address
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();
        if addresses.is_empty() {
            return Err(FirewallError::Internal("address is required".into()));
        }

        let total = addresses.len();
        let mut applied = 0;
        for address in &addresses {
            let info = FireInfo {
                address: address.clone(),
                strategy: req.strategy.clone(),
                ..Default::default()
            };
            if let Err(e) = self.client.rich_rules(&info, req.operation).await {
                return Err(partial(applied, total, e));
            }
            self.sync_description(RuleKind::Address, &info, req.operation, &req.description)?;
            applied += 1;
        }
        self.client.reload().await?;
        Ok(BatchOutcome { applied, total })
    }

    pub async fn operate_forward_rule(&self, rules: &[ForwardRule]) -> Result<BatchOutcome> {
        for rule in rules {
            check_illegal(&[&rule.port, &rule.protocol, &rule.target_ip, &rule.target_port])?;
            validate_port_spec(&rule.port)?;
            validate_port_spec(&rule.target_port)?;
        }
        // Reject accidental duplicate targets inside this request before
        // touching the live table.
        for (i, a) in rules.iter().enumerate() {
            if a.operation != Operation::Add {
                continue;
            }
            for b in &rules[i + 1..] {
                if b.operation == Operation::Add
                    && a.port == b.port
                    && a.target_port == b.target_port
                    && forward_target_or_loopback(&a.target_ip)
                        == forward_target_or_loopback(&b.target_ip)
                {
                    return Err(FirewallError::DuplicateForward {
                        port: a.port.clone(),
                        target_ip: forward_target_or_loopback(&a.target_ip),
                        target_port: a.target_port.clone(),
                    });
                }
            }
        }
        if rules.is_empty() {
            return Ok(BatchOutcome { applied: 0, total: 0 });
        }

        self.client.enable_forward().await?;

        // Insertion-order policy for line-numbered NAT chains: apply
        // higher-numbered rules first so low ordinals stay stable at the
        // head across repeated insertions. Backend-specific, not a universal
        // invariant.
        let mut sorted: Vec<ForwardRule> = rules.to_vec();
        sorted.sort_by(|a, b| b.num.cmp(&a.num));

        let total = sorted.len();
        let mut applied = 0;
        for rule in &sorted {
            let forward = FireForward {
                num: rule.num,
                protocol: rule.protocol.clone(),
                port: rule.port.clone(),
                target_ip: rule.target_ip.clone(),
                target_port: rule.target_port.clone(),
            };
            if let Err(e) = self.client.port_forward(&forward, rule.operation).await {
                return Err(partial(applied, total, e));
            }
            applied += 1;
        }
        Ok(BatchOutcome { applied, total })
    }

    /// Edits the annotation only; the live rule is untouched.
    pub fn update_description(&self, req: &UpdateDescription) -> Result<()> {
        let key = NaturalKey {
            kind: req.kind,
            port: req.port.clone(),
            protocol: req.protocol.clone(),
            address: req.address.clone(),
            strategy: req.strategy.clone(),
        };
        if req.description.is_empty() {
            self.store.delete(&key)
        } else {
            self.store.upsert(DescriptionRecord::new(key, req.description.clone()))
        }
    }

    pub async fn update_port_rule(&self, old: &PortRule, new: &PortRule) -> Result<BatchOutcome> {
        let mut remove = old.clone();
        remove.operation = Operation::Remove;
        self.operate_port_rule(&remove).await?;
        let mut add = new.clone();
        add.operation = Operation::Add;
        self.operate_port_rule(&add).await
    }

    pub async fn update_address_rule(
        &self,
        old: &AddressRule,
        new: &AddressRule,
    ) -> Result<BatchOutcome> {
        let mut remove = old.clone();
        remove.operation = Operation::Remove;
        self.operate_address_rule(&remove).await?;
        let mut add = new.clone();
        add.operation = Operation::Add;
        self.operate_address_rule(&add).await
    }

    /// Applies a list of logical port requests sequentially, stopping at the
    /// first failure.
    pub async fn batch_operate_rule(&self, rules: &[PortRule]) -> Result<BatchOutcome> {
        let total = rules.len();
        for (applied, rule) in rules.iter().enumerate() {
            if let Err(e) = self.operate_port_rule(rule).await {
                return Err(FirewallError::PartialBatch {
                    applied,
                    total,
                    source: Box::new(e),
                });
            }
        }
        Ok(BatchOutcome {
            applied: total,
            total,
        })
    }

    fn sync_description(
        &self,
        kind: RuleKind,
        info: &FireInfo,
        op: Operation,
        description: &str,
    ) -> Result<()> {
        let key = NaturalKey::of_info(kind, info);
        match op {
            Operation::Add => self
                .store
                .upsert(DescriptionRecord::new(key, description)),
            // Deletion is attempted regardless of whether the live rule
            // existed.
            Operation::Remove => self.store.delete(&key),
        }
    }
}

/// Deletes description records whose natural key matches no live rule across
/// both port and address kinds.
pub async fn reconcile_orphans(
    client: Arc<dyn FirewallClient>,
    store: Arc<dyn DescriptionStore>,
) -> Result<()> {
    let records = store.list_all()?;
    if records.is_empty() {
        return Ok(());
    }
    let mut live = HashSet::new();
    for info in client.list_port().await? {
        live.insert(NaturalKey::of_info(RuleKind::Port, &info));
    }
    for info in client.list_address().await? {
        live.insert(NaturalKey::of_info(RuleKind::Address, &info));
    }
    for record in records {
        let collectable = matches!(record.key.kind, RuleKind::Port | RuleKind::Address);
        if collectable && !live.contains(&record.key) {
            store.delete(&record.key)?;
        }
    }
    Ok(())
}

// ===========================================================================
// Expansion Helpers
// ===========================================================================

fn baseline_ports(panel_port: u16) -> Vec<u16> {
    let mut ports = vec![panel_port, 22, 80, 443];
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn partial(applied: usize, total: usize, source: FirewallError) -> FirewallError {
    FirewallError::PartialBatch {
        applied,
        total,
        source: Box::new(source),
    }
}

fn split_protocols(protocol: &str) -> Result<Vec<String>> {
    let protocols: Vec<String> = protocol
        .split('/')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if protocols.is_empty() || protocols.iter().any(|p| p != "tcp" && p != "udp") {
        return Err(FirewallError::InvalidProtocol {
            protocol: protocol.to_string(),
        });
    }
    Ok(protocols)
}

fn split_addresses(address: &str) -> Vec<String> {
    if address.is_empty() {
        return vec![String::new()];
    }
    address
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect()
}

fn expand_ports(port: &str, split_range: bool) -> Result<Vec<String>> {
    if port.contains(',') {
        return Ok(port
            .split(',')
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect());
    }
    if let Some((start, end)) = port.split_once('-') {
        if split_range {
            let start: u16 = start
                .parse()
                .map_err(|_| FirewallError::InvalidPort { port: port.into() })?;
            let end: u16 = end
                .parse()
                .map_err(|_| FirewallError::InvalidPort { port: port.into() })?;
            if start == 0 || end < start {
                return Err(FirewallError::InvalidPort { port: port.into() });
            }
            return Ok((start..=end).map(|p| p.to_string()).collect());
        }
        return Ok(vec![port.to_string()]);
    }
    Ok(vec![port.to_string()])
}

/// Validates a single port, a dash range, or a comma list of either.
fn validate_port_spec(port: &str) -> Result<()> {
    if port.is_empty() {
        return Err(FirewallError::InvalidPort { port: port.into() });
    }
    for piece in port.split(',') {
        let bounds: Vec<&str> = piece.split('-').collect();
        if bounds.is_empty() || bounds.len() > 2 {
            return Err(FirewallError::InvalidPort { port: port.into() });
        }
        for bound in bounds {
            let value: u16 = bound
                .parse()
                .map_err(|_| FirewallError::InvalidPort { port: port.into() })?;
            if value == 0 {
                return Err(FirewallError::InvalidPort { port: port.into() });
            }
        }
    }
    Ok(())
}

fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> Vec<T> {
    if page_size == 0 {
        return items;
    }
    let start = page.saturating_sub(1) * page_size;
    items.into_iter().skip(start).take(page_size).collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted backend recording every call; mutation number `fail_at`
    /// (1-based) fails when set.
    struct MockClient {
        name: &'static str,
        calls: Mutex<Vec<String>>,
        mutations: AtomicUsize,
        fail_at: Option<usize>,
        probe_errors: bool,
        live_ports: Mutex<Vec<FireInfo>>,
        live_addresses: Mutex<Vec<FireInfo>>,
        live_forwards: Mutex<Vec<FireForward>>,
    }

    impl MockClient {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                calls: Mutex::new(Vec::new()),
                mutations: AtomicUsize::new(0),
                fail_at: None,
                probe_errors: false,
                live_ports: Mutex::new(Vec::new()),
                live_addresses: Mutex::new(Vec::new()),
                live_forwards: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn mutate(&self, call: String) -> Result<()> {
            self.record(call);
            let n = self.mutations.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_at == Some(n) {
                return Err(FirewallError::CommandFailed {
                    operation: "mock".into(),
                    command: "mock".into(),
                    code: 1,
                    stdout: String::new(),
                    stderr: "injected failure".into(),
                });
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn mutation_count(&self) -> usize {
            self.mutations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FirewallClient for MockClient {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&self) -> Result<()> {
            self.mutate("start".into())
        }

        async fn stop(&self) -> Result<()> {
            self.record("stop".into());
            Ok(())
        }

        async fn restart(&self) -> Result<()> {
            self.mutate("restart".into())
        }

        async fn reload(&self) -> Result<()> {
            self.record("reload".into());
            Ok(())
        }

        async fn status(&self) -> Result<bool> {
            if self.probe_errors {
                return Err(FirewallError::Internal("probe down".into()));
            }
            Ok(true)
        }

        async fn version(&self) -> Result<String> {
            if self.probe_errors {
                return Err(FirewallError::Internal("probe down".into()));
            }
            Ok("9.9".into())
        }

        async fn list_port(&self) -> Result<Vec<FireInfo>> {
            Ok(self.live_ports.lock().unwrap().clone())
        }

        async fn list_address(&self) -> Result<Vec<FireInfo>> {
            Ok(self.live_addresses.lock().unwrap().clone())
        }

        async fn list_forward(&self) -> Result<Vec<FireForward>> {
            Ok(self.live_forwards.lock().unwrap().clone())
        }

        async fn port(&self, info: &FireInfo, op: Operation) -> Result<()> {
            self.mutate(format!(
                "port {} {}/{} {}",
                op.as_str(),
                info.port,
                info.protocol,
                info.strategy
            ))
        }

        async fn rich_rules(&self, info: &FireInfo, op: Operation) -> Result<()> {
            self.mutate(format!(
                "rich {} {}/{} from={} {}",
                op.as_str(),
                info.port,
                info.protocol,
                info.address,
                info.strategy
            ))
        }

        async fn port_forward(&self, forward: &FireForward, op: Operation) -> Result<()> {
            self.mutate(format!(
                "forward {} num={} {}->{}:{}",
                op.as_str(),
                forward.num,
                forward.port,
                forward.target_ip,
                forward.target_port
            ))
        }

        async fn enable_forward(&self) -> Result<()> {
            self.record("enable_forward".into());
            Ok(())
        }
    }

    fn service(mock: MockClient) -> (FirewallService, Arc<MockClient>, Arc<MemoryStore>) {
        let mock = Arc::new(mock);
        let store = Arc::new(MemoryStore::new());
        let svc = FirewallService::new(mock.clone(), store.clone())
            .with_engine_restart_cmd("true");
        (svc, mock, store)
    }

    fn port_req(port: &str, protocol: &str, address: &str, op: Operation) -> PortRule {
        PortRule {
            port: port.into(),
            protocol: protocol.into(),
            address: address.into(),
            strategy: "accept".into(),
            description: "test rule".into(),
            operation: op,
        }
    }

    #[tokio::test]
    async fn test_expansion_daemon_backend_passes_range_through() {
        let (svc, mock, store) = service(MockClient::new("firewalld"));
        let req = port_req("8080-8082", "tcp/udp", "10.0.0.1,10.0.0.2", Operation::Add);

        let outcome = svc.operate_port_rule(&req).await.unwrap();
        // 2 protocols x 2 addresses, the range stays atomic.
        assert_eq!(outcome, BatchOutcome { applied: 4, total: 4 });
        assert_eq!(mock.mutation_count(), 4);
        assert_eq!(store.list_all().unwrap().len(), 4);
        for record in store.list_all().unwrap() {
            assert_eq!(record.key.port, "8080-8082");
            assert_eq!(record.description, "test rule");
        }
    }

    #[tokio::test]
    async fn test_expansion_simplified_backend_splits_range_per_port() {
        let (svc, mock, _store) = service(MockClient::new("ufw"));
        let req = port_req("8080-8082", "tcp/udp", "10.0.0.1,10.0.0.2", Operation::Add);

        let outcome = svc.operate_port_rule(&req).await.unwrap();
        // 2 protocols x 2 addresses x 3 ports.
        assert_eq!(outcome, BatchOutcome { applied: 12, total: 12 });
        assert_eq!(mock.mutation_count(), 12);
        // With an address present every call goes down the structured path.
        assert_eq!(
            mock.calls().iter().filter(|c| c.starts_with("rich")).count(),
            12
        );
    }

    #[tokio::test]
    async fn test_range_without_address_stays_atomic_on_simplified_backend() {
        let (svc, mock, _store) = service(MockClient::new("ufw"));
        let req = port_req("8080-8082", "tcp", "", Operation::Add);
        let outcome = svc.operate_port_rule(&req).await.unwrap();
        assert_eq!(outcome.total, 1);
        assert_eq!(mock.mutation_count(), 1);
        assert!(mock.calls()[0].starts_with("port add 8080-8082"));
    }

    #[tokio::test]
    async fn test_port_list_splits_per_entry() {
        let (svc, mock, _store) = service(MockClient::new("firewalld"));
        let req = port_req("80,443", "tcp", "", Operation::Add);
        let outcome = svc.operate_port_rule(&req).await.unwrap();
        assert_eq!(outcome.total, 2);
        assert_eq!(
            mock.calls()
                .iter()
                .filter(|c| c.starts_with("port add"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_drop_strategy_routes_through_rich_rules() {
        let (svc, mock, _store) = service(MockClient::new("firewalld"));
        let mut req = port_req("8080", "tcp", "", Operation::Add);
        req.strategy = "drop".into();
        svc.operate_port_rule(&req).await.unwrap();
        assert!(mock.calls()[0].starts_with("rich add"));
    }

    #[tokio::test]
    async fn test_partial_batch_reports_applied_count_and_keeps_metadata() {
        let mut mock = MockClient::new("firewalld");
        mock.fail_at = Some(3);
        let (svc, mock, store) = service(mock);
        let req = port_req("8080-8082", "tcp/udp", "10.0.0.1,10.0.0.2", Operation::Add);

        let err = svc.operate_port_rule(&req).await.unwrap_err();
        match err {
            FirewallError::PartialBatch { applied, total, .. } => {
                assert_eq!(applied, 2);
                assert_eq!(total, 4);
            }
            other => panic!("expected partial batch, got {other:?}"),
        }
        // Metadata for the applied prefix stays; nothing for the rest.
        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_deletes_metadata_unconditionally() {
        let (svc, _mock, store) = service(MockClient::new("firewalld"));
        let add = port_req("8080", "tcp", "", Operation::Add);
        svc.operate_port_rule(&add).await.unwrap();
        assert_eq!(store.list_all().unwrap().len(), 1);

        let remove = port_req("8080", "tcp", "", Operation::Remove);
        svc.operate_port_rule(&remove).await.unwrap();
        assert!(store.list_all().unwrap().is_empty());

        // Removing again is a no-op, not an error.
        svc.operate_port_rule(&remove).await.unwrap();
    }

    #[tokio::test]
    async fn test_injection_guard_rejects_before_any_backend_call() {
        let (svc, mock, _store) = service(MockClient::new("firewalld"));
        let req = port_req("8080;reboot", "tcp", "", Operation::Add);
        let err = svc.operate_port_rule(&req).await.unwrap_err();
        assert_eq!(err.to_error_code(), "firewall.illegal_token");
        assert!(mock.calls().is_empty());

        let req = port_req("8080", "tcp", "$(curl evil)", Operation::Add);
        assert!(svc.operate_port_rule(&req).await.is_err());
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_address_rule_splits_comma_list() {
        let (svc, mock, store) = service(MockClient::new("firewalld"));
        let req = AddressRule {
            address: "10.0.0.1,172.16.0.0/16".into(),
            strategy: "drop".into(),
            description: "blocked".into(),
            operation: Operation::Add,
        };
        let outcome = svc.operate_address_rule(&req).await.unwrap();
        assert_eq!(outcome.total, 2);
        assert_eq!(mock.calls().iter().filter(|c| c.starts_with("rich")).count(), 2);
        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_forward_duplicate_target_rejected_client_side() {
        let (svc, mock, _store) = service(MockClient::new("ufw"));
        let rule = ForwardRule {
            num: 0,
            protocol: "tcp".into(),
            port: "8080".into(),
            target_ip: String::new(),
            target_port: "8081".into(),
            operation: Operation::Add,
        };
        let mut twin = rule.clone();
        twin.target_ip = "127.0.0.1".into();
        let err = svc.operate_forward_rule(&[rule, twin]).await.unwrap_err();
        assert_eq!(err.to_error_code(), "firewall.duplicate_forward");
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_forward_rules_applied_in_descending_ordinal_order() {
        let (svc, mock, _store) = service(MockClient::new("ufw"));
        let make = |num: u32, port: &str| ForwardRule {
            num,
            protocol: "tcp".into(),
            port: port.into(),
            target_ip: String::new(),
            target_port: format!("1{port}"),
            operation: Operation::Remove,
        };
        svc.operate_forward_rule(&[make(1, "81"), make(3, "83"), make(2, "82")])
            .await
            .unwrap();
        let calls = mock.calls();
        let forwards: Vec<&String> =
            calls.iter().filter(|c| c.starts_with("forward")).collect();
        assert!(forwards[0].contains("num=3"));
        assert!(forwards[1].contains("num=2"));
        assert!(forwards[2].contains("num=1"));
        assert_eq!(calls[0], "enable_forward");
    }

    #[tokio::test]
    async fn test_reconcile_deletes_orphans_and_keeps_live_matches() {
        let mock = MockClient::new("firewalld");
        let live = FireInfo {
            port: "8080".into(),
            protocol: "tcp".into(),
            strategy: "accept".into(),
            ..Default::default()
        };
        mock.live_ports.lock().unwrap().push(live.clone());
        let (svc, mock, store) = service(mock);
        let _ = svc;

        store
            .upsert(DescriptionRecord::new(
                NaturalKey::of_info(RuleKind::Port, &live),
                "kept",
            ))
            .unwrap();
        let orphan = FireInfo {
            port: "9999".into(),
            protocol: "udp".into(),
            strategy: "accept".into(),
            ..Default::default()
        };
        store
            .upsert(DescriptionRecord::new(
                NaturalKey::of_info(RuleKind::Port, &orphan),
                "orphan",
            ))
            .unwrap();

        reconcile_orphans(mock.clone() as Arc<dyn FirewallClient>, store.clone())
            .await
            .unwrap();
        let remaining = store.list_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].description, "kept");
    }

    #[tokio::test]
    async fn test_search_filters_joins_and_paginates() {
        let mock = MockClient::new("firewalld");
        for (port, strategy) in [("8080", "accept"), ("8081", "accept"), ("9090", "drop")] {
            mock.live_ports.lock().unwrap().push(FireInfo {
                port: port.into(),
                protocol: "tcp".into(),
                strategy: strategy.into(),
                ..Default::default()
            });
        }
        let (svc, _mock, store) = service(mock);
        store
            .upsert(DescriptionRecord::new(
                NaturalKey {
                    kind: RuleKind::Port,
                    port: "8080".into(),
                    protocol: "tcp".into(),
                    address: String::new(),
                    strategy: "accept".into(),
                },
                "web",
            ))
            .unwrap();

        // Substring filter + join.
        let req = SearchReq {
            kind: RuleKind::Port,
            filters: SearchFilters {
                port: Some("808".into()),
                ..Default::default()
            },
            page: 1,
            page_size: 10,
        };
        let result = svc.search_rules(&req).await.unwrap();
        assert_eq!(result.total, 2);
        match result.items {
            SearchItems::Rules(rules) => {
                let described: Vec<_> =
                    rules.iter().filter(|r| r.description == "web").collect();
                assert_eq!(described.len(), 1);
                assert!(described[0].used_status);
            }
            SearchItems::Forwards(_) => panic!("expected rules"),
        }

        // Used filter.
        let req = SearchReq {
            kind: RuleKind::Port,
            filters: SearchFilters {
                used: Some(true),
                ..Default::default()
            },
            page: 1,
            page_size: 10,
        };
        assert_eq!(svc.search_rules(&req).await.unwrap().total, 1);

        // Strategy filter + pagination.
        let req = SearchReq {
            kind: RuleKind::Port,
            filters: SearchFilters {
                strategy: Some("accept".into()),
                ..Default::default()
            },
            page: 2,
            page_size: 1,
        };
        let result = svc.search_rules(&req).await.unwrap();
        assert_eq!(result.total, 2);
        match result.items {
            SearchItems::Rules(rules) => assert_eq!(rules.len(), 1),
            SearchItems::Forwards(_) => panic!("expected rules"),
        }
    }

    #[tokio::test]
    async fn test_search_forwards_filters_target_fields() {
        let mock = MockClient::new("ufw");
        mock.live_forwards.lock().unwrap().extend([
            FireForward {
                num: 1,
                protocol: "tcp".into(),
                port: "8080".into(),
                target_ip: "127.0.0.1".into(),
                target_port: "8081".into(),
            },
            FireForward {
                num: 2,
                protocol: "tcp".into(),
                port: "9090".into(),
                target_ip: "10.0.0.2".into(),
                target_port: "9091".into(),
            },
        ]);
        let (svc, _mock, _store) = service(mock);
        let req = SearchReq {
            kind: RuleKind::Forward,
            filters: SearchFilters {
                target_ip: Some("10.0".into()),
                ..Default::default()
            },
            page: 1,
            page_size: 10,
        };
        let result = svc.search_rules(&req).await.unwrap();
        assert_eq!(result.total, 1);
        match result.items {
            SearchItems::Forwards(forwards) => assert_eq!(forwards[0].port, "9090"),
            SearchItems::Rules(_) => panic!("expected forwards"),
        }
    }

    #[tokio::test]
    async fn test_start_opens_baseline_ports_and_rolls_back_on_failure() {
        let (svc, mock, _store) = service(MockClient::new("firewalld"));
        svc.operate("start", 8888).await.unwrap();
        let calls = mock.calls();
        assert_eq!(calls[0], "start");
        let baseline: Vec<&String> =
            calls.iter().filter(|c| c.starts_with("port add")).collect();
        assert_eq!(baseline.len(), 4);
        assert!(calls.contains(&"reload".to_string()));

        // Baseline failure stops the backend again.
        let mut failing = MockClient::new("firewalld");
        failing.fail_at = Some(3); // start + first baseline port succeed
        let (svc, mock, _store) = service(failing);
        assert!(svc.operate("start", 8888).await.is_err());
        assert!(mock.calls().contains(&"stop".to_string()));
    }

    #[tokio::test]
    async fn test_base_info_degrades_failed_probes_to_sentinels() {
        let (svc, _mock, _store) = service(MockClient::new("firewalld"));
        let info = svc.load_base_info().await;
        assert_eq!(info.name, "firewalld");
        assert_eq!(info.status, "running");
        assert_eq!(info.version, "9.9");

        let mut mock = MockClient::new("firewalld");
        mock.probe_errors = true;
        let (svc, _mock, _store) = service(mock);
        let info = svc.load_base_info().await;
        assert_eq!(info.status, "unknown");
        assert_eq!(info.version, "-");
        assert!(!info.ping_blocked);
    }

    #[tokio::test]
    async fn test_update_port_rule_removes_old_then_adds_new() {
        let (svc, mock, store) = service(MockClient::new("firewalld"));
        let old = port_req("8080", "tcp", "", Operation::Add);
        svc.operate_port_rule(&old).await.unwrap();

        let new = port_req("8081", "tcp", "", Operation::Add);
        svc.update_port_rule(&old, &new).await.unwrap();

        let calls = mock.calls();
        let remove_idx = calls.iter().position(|c| c.starts_with("port remove 8080")).unwrap();
        let add_idx = calls.iter().position(|c| c.starts_with("port add 8081")).unwrap();
        assert!(remove_idx < add_idx);

        let keys: Vec<String> = store
            .list_all()
            .unwrap()
            .iter()
            .map(|r| r.key.port.clone())
            .collect();
        assert_eq!(keys, vec!["8081".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_operate_stops_at_first_failing_rule() {
        let mut mock = MockClient::new("firewalld");
        mock.fail_at = Some(2);
        let (svc, _mock, _store) = service(mock);
        let rules = vec![
            port_req("80", "tcp", "", Operation::Add),
            port_req("443", "tcp", "", Operation::Add),
            port_req("8443", "tcp", "", Operation::Add),
        ];
        let err = svc.batch_operate_rule(&rules).await.unwrap_err();
        match err {
            FirewallError::PartialBatch { applied, total, .. } => {
                assert_eq!(applied, 1);
                assert_eq!(total, 3);
            }
            other => panic!("expected partial batch, got {other:?}"),
        }
    }

    #[test]
    fn test_expand_ports_and_validation() {
        assert_eq!(expand_ports("8080", false).unwrap(), vec!["8080"]);
        assert_eq!(expand_ports("80,443", false).unwrap(), vec!["80", "443"]);
        assert_eq!(expand_ports("8080-8082", false).unwrap(), vec!["8080-8082"]);
        assert_eq!(
            expand_ports("8080-8082", true).unwrap(),
            vec!["8080", "8081", "8082"]
        );
        assert!(expand_ports("9000-8000", true).is_err());

        assert!(validate_port_spec("8080").is_ok());
        assert!(validate_port_spec("80,443").is_ok());
        assert!(validate_port_spec("8080-8082").is_ok());
        assert!(validate_port_spec("0").is_err());
        assert!(validate_port_spec("http").is_err());
        assert!(validate_port_spec("1-2-3").is_err());
        assert!(validate_port_spec("70000").is_err());
    }

    #[test]
    fn test_split_protocols() {
        assert_eq!(split_protocols("tcp").unwrap(), vec!["tcp"]);
        assert_eq!(split_protocols("tcp/udp").unwrap(), vec!["tcp", "udp"]);
        assert!(split_protocols("icmp").is_err());
        assert!(split_protocols("").is_err());
    }

    #[test]
    fn test_baseline_ports_dedupes_panel_port() {
        assert_eq!(baseline_ports(443), vec![22, 80, 443]);
        assert_eq!(baseline_ports(8888), vec![22, 80, 443, 8888]);
    }

    #[test]
    fn test_paginate() {
        let items: Vec<u32> = (1..=5).collect();
        assert_eq!(paginate(items.clone(), 1, 2), vec![1, 2]);
        assert_eq!(paginate(items.clone(), 3, 2), vec![5]);
        assert_eq!(paginate(items.clone(), 4, 2), Vec::<u32>::new());
        assert_eq!(paginate(items, 1, 0).len(), 5);
    }
}

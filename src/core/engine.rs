//! Enforcement engine: applies directives to nft/tc and tracks what is live
//!
//! Two modes:
//!
//! - **Rebuild** flushes the managed namespace (the nft table, or a device's
//!   root qdisc) and applies the full compiled list in order. Repeating a
//!   rebuild yields the same live state.
//! - **Incremental** removes and re-applies only the directives of one entity
//!   (plus the entities whose directives depend on it), leaving everything
//!   else untouched. New nft rules are inserted before the next live rule of
//!   the same chain in compiled order, using the handles recorded when each
//!   rule was added.
//!
//! Failures are best-effort: a failed directive is logged and its owner marked
//! degraded, and the remaining directives are still applied. Timeouts count as
//! failures and are never retried inline.
//!
//! Locking: rebuilds of the packet filter take the namespace lock exclusively;
//! incremental applies share it and serialize per [`Scope`] (zone, port
//! forwards, sets, shaped device).

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::config::EngineConfig;
use crate::core::compiler::{self, Compilation, PriorityOrder};
use crate::core::directive::{self, Directive, DirectiveKind, Invocation, Program, Scope};
use crate::core::error::{Error, Result};
use crate::core::lifecycle::{EntityStatus, LifecycleState, Transition};
use crate::core::model::{EntityId, EntityRef, PolicySnapshot, PolicySource};
use crate::core::qos;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

/// Captured output of a successful invocation
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes one argument-vector invocation with a deadline.
///
/// Implementations must map a non-zero exit to [`Error::Command`] and an
/// expired deadline to [`Error::Timeout`].
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Runs nft and tc as child processes, elevating when needed
#[derive(Debug, Clone)]
pub struct SystemRunner {
    nft_command: String,
    tc_command: String,
}

impl SystemRunner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            nft_command: config.nft_command.clone(),
            tc_command: config.tc_command.clone(),
        }
    }

    fn binary(&self, program: Program) -> &str {
        match program {
            Program::Nft => &self.nft_command,
            Program::Tc => &self.tc_command,
        }
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput> {
        let program = invocation.program.to_string();
        let binary = self.binary(invocation.program);
        let mut cmd =
            crate::elevation::create_elevated_command(invocation.program, binary, &invocation.args)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| Error::Command {
            program: program.clone(),
            message: format!("failed to spawn {binary}: {e}"),
            stderr: None,
            exit_code: None,
        })?;

        // dropping the wait future on timeout kills the child
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::Timeout {
                    program,
                    after_ms: timeout.as_millis() as u64,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            let message = stderr
                .lines()
                .find(|l| !l.trim().is_empty())
                .map_or_else(|| format!("exited with {}", output.status), str::to_string);
            Err(Error::Command {
                program,
                message,
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

/// Extracts the rule handle nft prints with `--echo --handle`
pub fn parse_handle(stdout: &str) -> Option<u64> {
    stdout.lines().rev().find_map(|line| {
        line.rsplit_once("# handle ")
            .and_then(|(_, handle)| handle.trim().parse().ok())
    })
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ApplyMode {
    Rebuild,
    Incremental,
}

/// What a rebuild covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildTarget {
    /// Packet filter and every shaper tree
    All,
    /// Packet filter only
    Firewall,
    /// The trees of one QoS configuration
    Shaper(EntityId),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ApplyStatus {
    Applied,
    Failed,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Apply,
    Remove,
}

/// Outcome of one directive
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub operation: Operation,
    pub status: ApplyStatus,
    pub directive: Directive,
    pub error: Option<String>,
}

/// Outcome of one apply call
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub mode: ApplyMode,
    pub results: Vec<ApplyResult>,
    /// Compile errors and namespace failures, one line each
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Counts exposed through the status query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl ApplyReport {
    fn new(mode: ApplyMode) -> Self {
        Self {
            mode,
            results: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == ApplyStatus::Applied)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == ApplyStatus::Failed)
            .count()
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0 && self.errors.is_empty()
    }

    pub fn summary(&self) -> ApplySummary {
        let mut errors = self.errors.clone();
        errors.extend(self.results.iter().filter_map(|r| {
            r.error
                .as_ref()
                .map(|e| format!("{} {}: {e}", r.operation, r.directive))
        }));
        ApplySummary {
            succeeded: self.succeeded(),
            failed: self.failed(),
            errors,
        }
    }

    fn absorb_compile(&mut self, compilation: &Compilation, members: &BTreeSet<EntityRef>) {
        for err in compilation.errors.iter().filter(|e| members.contains(&e.entity)) {
            self.errors.push(err.error.to_string());
        }
        self.warnings.extend(compilation.warnings.iter().cloned());
    }
}

/// A directive that is live, with the nft handle assigned to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDirective {
    pub directive: Directive,
    pub handle: Option<u64>,
}

/// Point-in-time engine status
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    pub enabled: bool,
    pub active_directive_count: usize,
    pub last_apply: Option<ApplySummary>,
    pub drift_count: usize,
    pub fingerprint: Option<String>,
    pub entities: Vec<(EntityRef, EntityStatus)>,
}

#[derive(Debug, Default)]
struct EngineState {
    ledger: HashMap<EntityRef, Vec<ActiveDirective>>,
    entities: BTreeMap<EntityRef, EntityStatus>,
    shaped_devices: BTreeSet<String>,
    enabled: bool,
    last_apply: Option<ApplySummary>,
    drift_count: usize,
    fingerprint: Option<String>,
}

impl EngineState {
    fn active_handle(&self, directive: &Directive) -> Option<u64> {
        self.ledger
            .get(&directive.owner)?
            .iter()
            .find(|a| &a.directive == directive)?
            .handle
    }

    /// Lifecycle transitions and compile errors for `members`, before applying
    fn settle(
        &mut self,
        snapshot: &PolicySnapshot,
        compilation: &Compilation,
        members: &BTreeSet<EntityRef>,
    ) {
        for entity in members {
            let present = snapshot.contains(entity);
            let status = self.entities.entry(*entity).or_default();
            if status.state == LifecycleState::Deleted {
                if !present {
                    continue;
                }
                // id reused by a new record
                *status = EntityStatus::default();
            }
            let transition = if !present {
                Transition::Delete
            } else if !snapshot.is_enabled(entity) {
                Transition::Disable
            } else if status.state == LifecycleState::Disabled {
                Transition::Enable
            } else {
                Transition::Apply
            };
            if let Err(e) = status.advance(transition, entity) {
                warn!("{e}");
            }
            status.clear_errors();
            if let Some(err) = compilation.error_for(entity) {
                status.mark_degraded(err.to_string());
            }
        }
    }

    fn refresh_counts(&mut self, members: &BTreeSet<EntityRef>) {
        for entity in members {
            let count = self.ledger.get(entity).map_or(0, Vec::len);
            if let Some(status) = self.entities.get_mut(entity) {
                status.active_directives = count;
            }
        }
    }

    fn degrade(&mut self, entity: EntityRef, error: impl Into<String>) {
        self.entities.entry(entity).or_default().mark_degraded(error);
    }
}

/// The enforcement engine
pub struct Engine<R: CommandRunner> {
    runner: Arc<R>,
    table: String,
    timeout: Duration,
    order: PriorityOrder,
    journal: Option<AuditLog>,
    namespace: RwLock<()>,
    scopes: Mutex<HashMap<Scope, Arc<Mutex<()>>>>,
    state: Mutex<EngineState>,
}

impl<R: CommandRunner> Engine<R> {
    pub fn new(runner: R, config: &EngineConfig, journal: Option<AuditLog>) -> Self {
        Self {
            runner: Arc::new(runner),
            table: config.table.clone(),
            timeout: config.command_timeout(),
            order: config.priority_order,
            journal: journal.filter(|_| config.directive_log),
            namespace: RwLock::new(()),
            scopes: Mutex::new(HashMap::new()),
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn runner(&self) -> Arc<R> {
        Arc::clone(&self.runner)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn order(&self) -> PriorityOrder {
        self.order
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn lock_scopes(&self, scopes: BTreeSet<Scope>) -> Vec<OwnedMutexGuard<()>> {
        let locks: Vec<Arc<Mutex<()>>> = {
            let mut table = self.scopes.lock().await;
            scopes
                .into_iter()
                .map(|s| Arc::clone(table.entry(s).or_default()))
                .collect()
        };
        // BTreeSet order is the global lock order
        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Appends to the directive log, when one is configured
    pub async fn record_event(&self, event: AuditEvent) {
        if let Some(journal) = &self.journal {
            journal.record(&event).await;
        }
    }

    /// Runs one invocation outside any directive bookkeeping, logging it to
    /// the directive log under `event_type`
    pub async fn execute(
        &self,
        invocation: &Invocation,
        event_type: EventType,
        owner: Option<EntityRef>,
    ) -> Result<CommandOutput> {
        let result = self.runner.run(invocation, self.timeout).await;
        let mut event = AuditEvent::new(
            event_type,
            result.is_ok(),
            serde_json::json!({ "argv": invocation.to_string() }),
            result.as_ref().err().map(Error::detail),
        );
        event.owner = owner;
        self.record_event(event).await;
        result
    }

    async fn apply_one(&self, directive: &Directive, before: Option<u64>, report: &mut ApplyReport) {
        let invocation = directive.placed_invocation(&self.table, before);
        debug!("apply {directive}: {invocation}");
        let result = self.runner.run(&invocation, self.timeout).await;

        let event = AuditEvent::new(
            EventType::ApplyDirective,
            result.is_ok(),
            serde_json::json!({ "argv": invocation.to_string() }),
            result.as_ref().err().map(Error::detail),
        )
        .with_directive(directive, directive.owner);
        self.record_event(event).await;

        match result {
            Ok(output) => {
                let handle = if directive.chain().is_some() {
                    let handle = parse_handle(&output.stdout);
                    if handle.is_none() {
                        warn!("nft printed no handle for {directive}; it can only be removed by a rebuild");
                    }
                    handle
                } else {
                    None
                };
                self.state
                    .lock()
                    .await
                    .ledger
                    .entry(directive.owner)
                    .or_default()
                    .push(ActiveDirective {
                        directive: directive.clone(),
                        handle,
                    });
                report.results.push(ApplyResult {
                    operation: Operation::Apply,
                    status: ApplyStatus::Applied,
                    directive: directive.clone(),
                    error: None,
                });
            }
            Err(e) => {
                error!("Failed to apply {directive} ({}): {e}", directive.owner);
                self.state.lock().await.degrade(directive.owner, e.to_string());
                report.results.push(ApplyResult {
                    operation: Operation::Apply,
                    status: ApplyStatus::Failed,
                    directive: directive.clone(),
                    error: Some(e.to_string()),
                });
            }
        }
    }

    async fn remove_one(&self, active: &ActiveDirective, report: &mut ApplyReport) {
        let directive = &active.directive;
        let result = match directive.removal(&self.table, active.handle) {
            Some(invocation) => {
                debug!("remove {directive}: {invocation}");
                let result = self.runner.run(&invocation, self.timeout).await.map(|_| ());
                let event = AuditEvent::new(
                    EventType::RemoveDirective,
                    result.is_ok(),
                    serde_json::json!({ "argv": invocation.to_string() }),
                    result.as_ref().err().map(Error::detail),
                )
                .with_directive(directive, directive.owner);
                self.record_event(event).await;
                result
            }
            None => Err(Error::drift(
                &directive.owner,
                format!("no handle recorded for {directive}; run a rebuild"),
            )),
        };

        let (status, error) = match result {
            Ok(()) => (ApplyStatus::Applied, None),
            // already gone is the state removal asks for
            Err(e) if e.detail().contains("No such file or directory") => {
                debug!("{directive} was already absent");
                (ApplyStatus::Applied, None)
            }
            Err(e) => {
                error!("Failed to remove {directive} ({}): {e}", directive.owner);
                self.state.lock().await.degrade(directive.owner, e.to_string());
                (ApplyStatus::Failed, Some(e.to_string()))
            }
        };
        report.results.push(ApplyResult {
            operation: Operation::Remove,
            status,
            directive: directive.clone(),
            error,
        });
    }

    /// Flushes and reapplies current desired state for `target`.
    ///
    /// Waits for any in-flight rebuild; the snapshot is taken once the lock
    /// is held so the newest policy wins.
    pub async fn rebuild<S: PolicySource + ?Sized>(
        &self,
        source: &S,
        target: RebuildTarget,
    ) -> Result<ApplyReport> {
        let report = match target {
            RebuildTarget::Shaper(config_id) => {
                let _ns = self.namespace.read().await;
                let snapshot = source.snapshot()?;
                self.reshape_config(&snapshot, config_id, ApplyMode::Rebuild).await
            }
            RebuildTarget::All | RebuildTarget::Firewall => {
                let _ns = self.namespace.write().await;
                let snapshot = source.snapshot()?;
                let mut report = self.rebuild_firewall_locked(&snapshot).await;
                if target == RebuildTarget::All {
                    self.reshape_all_locked(&snapshot, &mut report).await;
                    let compilation = compiler::compile(&snapshot, self.order);
                    self.state.lock().await.fingerprint =
                        Some(directive::fingerprint(&self.table, &compilation.directives));
                }
                report
            }
        };

        self.finish(&report).await;
        info!(
            "Rebuild finished: {} applied, {} failed, {} entity errors",
            report.succeeded(),
            report.failed(),
            report.errors.len()
        );
        self.record_event(AuditEvent::new(
            EventType::Rebuild,
            report.is_clean(),
            serde_json::json!({
                "target": target,
                "applied": report.succeeded(),
                "failed": report.failed(),
            }),
            report.summary().errors.first().cloned(),
        ))
        .await;
        Ok(report)
    }

    async fn finish(&self, report: &ApplyReport) {
        self.state.lock().await.last_apply = Some(report.summary());
    }

    async fn rebuild_firewall_locked(&self, snapshot: &PolicySnapshot) -> ApplyReport {
        let mut report = ApplyReport::new(ApplyMode::Rebuild);
        let compilation = compiler::compile_firewall(snapshot, self.order);

        let members: BTreeSet<EntityRef> = {
            let state = self.state.lock().await;
            snapshot
                .entities()
                .into_iter()
                .chain(state.entities.keys().copied())
                .filter(|e| !e.is_shaper())
                .collect()
        };
        report.absorb_compile(&compilation, &members);

        info!("Rebuilding table inet {}", self.table);
        for (i, step) in directive::namespace_setup(&self.table).iter().enumerate() {
            // step 1 deletes the table it just ensured, so only a failure past it matters
            if let Err(e) = self.runner.run(step, self.timeout).await {
                if i == 1 {
                    debug!("table delete during rebuild: {e}");
                    continue;
                }
                error!("Namespace preparation failed at '{step}': {e}");
                report.errors.push(format!("namespace: {e}"));
            }
        }

        {
            let mut state = self.state.lock().await;
            state.ledger.retain(|owner, _| owner.is_shaper());
            state.enabled = true;
            state.settle(snapshot, &compilation, &members);
        }

        for directive in &compilation.directives {
            self.apply_one(directive, None, &mut report).await;
        }

        self.state.lock().await.refresh_counts(&members);
        report
    }

    async fn reshape_all_locked(&self, snapshot: &PolicySnapshot, report: &mut ApplyReport) {
        let compilation = qos::compile_shapers(snapshot);
        let members: BTreeSet<EntityRef> = {
            let state = self.state.lock().await;
            snapshot
                .entities()
                .into_iter()
                .chain(state.entities.keys().copied())
                .filter(EntityRef::is_shaper)
                .collect()
        };
        report.absorb_compile(&compilation, &members);

        let devices: BTreeSet<String> = {
            let state = self.state.lock().await;
            state
                .shaped_devices
                .iter()
                .cloned()
                .chain(compilation.directives.iter().filter_map(|d| d.device().map(String::from)))
                .collect()
        };
        let _guards = self
            .lock_scopes(devices.iter().cloned().map(Scope::Shaper).collect())
            .await;
        for device in &devices {
            self.flush_device(device).await;
        }

        {
            let mut state = self.state.lock().await;
            state.ledger.retain(|owner, _| !owner.is_shaper());
            state.shaped_devices = compilation
                .directives
                .iter()
                .filter_map(|d| d.device().map(String::from))
                .collect();
            state.settle(snapshot, &compilation, &members);
        }
        for directive in &compilation.directives {
            self.apply_one(directive, None, report).await;
        }
        self.state.lock().await.refresh_counts(&members);
    }

    async fn flush_device(&self, device: &str) {
        // a device without a root qdisc makes tc fail; that is the desired state
        if let Err(e) = self.runner.run(&directive::shaper_flush(device), self.timeout).await {
            debug!("flush of {device}: {e}");
        }
    }

    /// Rebuilds the trees of one QoS configuration, including devices it
    /// used previously but no longer shapes
    async fn reshape_config(
        &self,
        snapshot: &PolicySnapshot,
        config_id: EntityId,
        mode: ApplyMode,
    ) -> ApplyReport {
        let mut report = ApplyReport::new(mode);
        let compilation = qos::compile_shapers(snapshot);

        let mut members = shaper_members(snapshot, config_id);
        let old_devices: BTreeSet<String> = {
            let state = self.state.lock().await;
            state
                .ledger
                .iter()
                .filter(|(owner, _)| members.contains(*owner))
                .flat_map(|(_, active)| active.iter().filter_map(|a| a.directive.device().map(String::from)))
                .collect()
        };
        let desired: Vec<&Directive> = compilation
            .directives
            .iter()
            .filter(|d| members.contains(&d.owner))
            .collect();
        let new_devices: BTreeSet<String> = desired
            .iter()
            .filter_map(|d| d.device().map(String::from))
            .collect();
        let devices: BTreeSet<String> = old_devices.union(&new_devices).cloned().collect();

        // anything else live on these devices is rebuilt away too
        {
            let state = self.state.lock().await;
            for (owner, active) in &state.ledger {
                if active
                    .iter()
                    .any(|a| a.directive.device().is_some_and(|d| devices.contains(d)))
                {
                    members.insert(*owner);
                }
            }
        }
        report.absorb_compile(&compilation, &members);

        let _guards = self
            .lock_scopes(devices.iter().cloned().map(Scope::Shaper).collect())
            .await;
        for device in &devices {
            self.flush_device(device).await;
        }

        {
            let mut state = self.state.lock().await;
            for owner in &members {
                state.ledger.remove(owner);
            }
            for device in old_devices.difference(&new_devices) {
                state.shaped_devices.remove(device);
            }
            state.shaped_devices.extend(new_devices.iter().cloned());
            state.settle(snapshot, &compilation, &members);
        }

        for directive in desired {
            self.apply_one(directive, None, &mut report).await;
        }
        self.state.lock().await.refresh_counts(&members);
        report
    }

    /// Compiles current policy and (re)applies the directives of one entity.
    ///
    /// An entity missing from the snapshot has its directives removed and is
    /// marked deleted. Before the first rebuild there is no namespace to
    /// insert into, so this falls back to a packet-filter rebuild.
    pub async fn apply_entity<S: PolicySource + ?Sized>(
        &self,
        source: &S,
        entity: EntityRef,
    ) -> Result<ApplyReport> {
        let snapshot = source.snapshot()?;
        let report = self.reconcile_entity(&snapshot, &snapshot, entity).await?;
        self.finish(&report).await;
        Ok(report)
    }

    /// Removes the directives of one entity (before its record is deleted,
    /// or when it is disabled) and records the lifecycle transition.
    pub async fn remove_entity<S: PolicySource + ?Sized>(
        &self,
        source: &S,
        entity: EntityRef,
        delete: bool,
    ) -> Result<ApplyReport> {
        let transition = if delete {
            Transition::Delete
        } else {
            Transition::Disable
        };
        let next = {
            let mut state = self.state.lock().await;
            let status = state.entities.entry(entity).or_default();
            status.state.next(transition, &entity)?
        };

        let snapshot = source.snapshot()?;
        let reduced = snapshot.without(&entity);
        let report = self.reconcile_entity(&snapshot, &reduced, entity).await?;

        {
            let mut state = self.state.lock().await;
            let status = state.entities.entry(entity).or_default();
            status.state = next;
            status.active_directives = 0;
        }
        info!("{entity} {}", if delete { "deleted" } else { "disabled" });
        self.finish(&report).await;
        Ok(report)
    }

    async fn reconcile_entity(
        &self,
        full: &PolicySnapshot,
        effective: &PolicySnapshot,
        entity: EntityRef,
    ) -> Result<ApplyReport> {
        if entity.is_shaper() {
            let config_id = match full.owning_qos_config(&entity) {
                Some(id) => Some(id),
                None => self.live_config_of(&entity).await,
            };
            let Some(config_id) = config_id else {
                let mut state = self.state.lock().await;
                state.ledger.remove(&entity);
                return Ok(ApplyReport::new(ApplyMode::Incremental));
            };
            let _ns = self.namespace.read().await;
            let report = self
                .reshape_config(effective, config_id, ApplyMode::Incremental)
                .await;
            self.update_fingerprint(effective).await;
            return Ok(report);
        }

        if !self.state.lock().await.enabled {
            info!("Table inet {} not built yet; rebuilding packet filter", self.table);
            return self.rebuild(effective, RebuildTarget::Firewall).await;
        }

        let _ns = self.namespace.read().await;
        let compilation = compiler::compile_firewall(effective, self.order);

        // the ledger is only trusted once the scopes it lives in are held;
        // a concurrent apply may have widened them meanwhile
        let (members, old, _guards) = loop {
            let (_, _, scopes) = self.incremental_plan(full, &compilation, entity).await;
            let guards = self.lock_scopes(scopes.clone()).await;
            let (members, old, held) = self.incremental_plan(full, &compilation, entity).await;
            if held.is_subset(&scopes) {
                break (members, old, guards);
            }
            debug!("Scopes of {entity} changed while locking; retrying");
        };

        let mut report = ApplyReport::new(ApplyMode::Incremental);
        report.absorb_compile(&compilation, &members);

        {
            let mut state = self.state.lock().await;
            for member in &members {
                state.ledger.remove(member);
            }
        }

        // rules first (they may reference sets), then sets; elements go with their set
        let removed_sets: BTreeSet<&str> = old
            .iter()
            .filter_map(|a| match &a.directive.kind {
                DirectiveKind::CreateSet { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        for active in old.iter().rev().filter(|a| a.directive.chain().is_some()) {
            self.remove_one(active, &mut report).await;
        }
        for active in old.iter().rev().filter(|a| a.directive.chain().is_none()) {
            if let DirectiveKind::AddMember { set, .. } = &active.directive.kind
                && removed_sets.contains(set.as_str())
            {
                continue;
            }
            self.remove_one(active, &mut report).await;
        }

        self.state
            .lock()
            .await
            .settle(effective, &compilation, &members);

        for (index, directive) in compilation.directives.iter().enumerate() {
            if !members.contains(&directive.owner) {
                continue;
            }
            let before = match directive.chain() {
                Some(chain) => {
                    let state = self.state.lock().await;
                    compilation.directives[index + 1..]
                        .iter()
                        .filter(|d| d.chain() == Some(chain))
                        .find_map(|d| state.active_handle(d))
                }
                None => None,
            };
            self.apply_one(directive, before, &mut report).await;
        }

        self.state.lock().await.refresh_counts(&members);
        self.update_fingerprint(effective).await;
        debug!(
            "Incremental apply of {entity} touched {} entities: {} ok, {} failed",
            members.len(),
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }

    /// Entities an incremental apply of `entity` touches, their live
    /// directives, and every scope either side lives in
    async fn incremental_plan(
        &self,
        full: &PolicySnapshot,
        compilation: &Compilation,
        entity: EntityRef,
    ) -> (BTreeSet<EntityRef>, Vec<ActiveDirective>, BTreeSet<Scope>) {
        let state = self.state.lock().await;
        let members = dependents(full, entity, &state.ledger);
        let old: Vec<ActiveDirective> = members
            .iter()
            .filter_map(|m| state.ledger.get(m))
            .flatten()
            .cloned()
            .collect();
        let scopes: BTreeSet<Scope> = old
            .iter()
            .map(|a| a.directive.scope.clone())
            .chain(
                compilation
                    .directives
                    .iter()
                    .filter(|d| members.contains(&d.owner))
                    .map(|d| d.scope.clone()),
            )
            .collect();
        (members, old, scopes)
    }

    async fn update_fingerprint(&self, snapshot: &PolicySnapshot) {
        let compilation = compiler::compile(snapshot, self.order);
        self.state.lock().await.fingerprint =
            Some(directive::fingerprint(&self.table, &compilation.directives));
    }

    /// QoS configuration whose live tree holds directives of `entity`
    async fn live_config_of(&self, entity: &EntityRef) -> Option<EntityId> {
        let state = self.state.lock().await;
        let devices: BTreeSet<&str> = state
            .ledger
            .get(entity)?
            .iter()
            .filter_map(|a| a.directive.device())
            .collect();
        state.ledger.iter().find_map(|(owner, active)| match owner {
            EntityRef::QosConfig(id)
                if active
                    .iter()
                    .any(|a| a.directive.device().is_some_and(|d| devices.contains(d))) =>
            {
                Some(*id)
            }
            _ => None,
        })
    }

    /// Marks devices as shaped so a later teardown flushes them even when
    /// this process did not build their trees
    pub async fn claim_devices(&self, devices: impl IntoIterator<Item = String>) {
        self.state.lock().await.shaped_devices.extend(devices);
    }

    /// Deletes the managed table and every shaper tree
    pub async fn teardown(&self) -> Result<ApplyReport> {
        let _ns = self.namespace.write().await;
        let mut report = ApplyReport::new(ApplyMode::Rebuild);

        match self
            .execute(&directive::namespace_teardown(&self.table), EventType::Teardown, None)
            .await
        {
            Ok(_) => info!("Deleted table inet {}", self.table),
            Err(e) if e.detail().contains("No such file") => {
                debug!("table inet {} was not present", self.table);
            }
            Err(e) => {
                error!("Teardown of table inet {} failed: {e}", self.table);
                report.errors.push(format!("namespace: {e}"));
            }
        }

        let devices: Vec<String> = self.state.lock().await.shaped_devices.iter().cloned().collect();
        for device in &devices {
            self.flush_device(device).await;
        }

        let mut state = self.state.lock().await;
        state.ledger.clear();
        state.shaped_devices.clear();
        state.enabled = false;
        state.fingerprint = None;
        for status in state.entities.values_mut() {
            status.active_directives = 0;
        }
        state.last_apply = Some(report.summary());
        Ok(report)
    }

    /// Loads a saved nft script, and optionally a tc batch, in place of the
    /// managed namespace
    ///
    /// Restored rules carry no recorded handles, so the ledger is dropped and
    /// the next incremental apply falls back to a rebuild.
    pub async fn restore(&self, nft_script: &Path, tc_batch: Option<&Path>) -> Result<()> {
        let _ns = self.namespace.write().await;

        let load = Invocation::nft(["-f".to_string(), nft_script.display().to_string()]);
        if let Err(e) = self.execute(&load, EventType::Restore, None).await {
            error!("Restore of {} failed: {e}", nft_script.display());
            return Err(e);
        }
        info!("Restored table inet {} from {}", self.table, nft_script.display());

        if let Some(batch) = tc_batch {
            let shape = Invocation::tc([
                "-force".to_string(),
                "-batch".to_string(),
                batch.display().to_string(),
            ]);
            if let Err(e) = self.execute(&shape, EventType::Restore, None).await {
                error!("Restore of shaper trees failed: {e}");
                return Err(e);
            }
        }

        let mut state = self.state.lock().await;
        state.ledger.clear();
        state.enabled = false;
        state.fingerprint = None;
        for status in state.entities.values_mut() {
            status.active_directives = 0;
        }
        Ok(())
    }

    pub async fn status(&self) -> EngineStatus {
        let state = self.state.lock().await;
        EngineStatus {
            enabled: state.enabled,
            active_directive_count: state.ledger.values().map(Vec::len).sum(),
            last_apply: state.last_apply.clone(),
            drift_count: state.drift_count,
            fingerprint: state.fingerprint.clone(),
            entities: state
                .entities
                .iter()
                .map(|(e, s)| (*e, s.clone()))
                .collect(),
        }
    }

    pub async fn entity_status(&self, entity: &EntityRef) -> Option<EntityStatus> {
        self.state.lock().await.entities.get(entity).cloned()
    }

    /// Live directives of one entity, in the order they were applied
    pub async fn active_for(&self, entity: &EntityRef) -> Vec<ActiveDirective> {
        self.state
            .lock()
            .await
            .ledger
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    /// Every live directive, grouped by owner
    pub async fn active(&self) -> BTreeMap<EntityRef, Vec<ActiveDirective>> {
        self.state
            .lock()
            .await
            .ledger
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub async fn record_drift(&self, count: usize) {
        self.state.lock().await.drift_count = count;
    }

    /// Flags an entity whose live state could not be corrected
    pub async fn mark_degraded(&self, entity: EntityRef, error: &Error) {
        self.state.lock().await.degrade(entity, error.to_string());
    }
}

/// The QoS entities belonging to one configuration
fn shaper_members(snapshot: &PolicySnapshot, config_id: EntityId) -> BTreeSet<EntityRef> {
    let mut out = BTreeSet::from([EntityRef::QosConfig(config_id)]);
    let classes: Vec<EntityId> = snapshot
        .qos_classes
        .iter()
        .filter(|c| c.config_id == config_id)
        .map(|c| c.id)
        .collect();
    out.extend(classes.iter().map(|id| EntityRef::QosClass(*id)));
    out.extend(
        snapshot
            .qos_rules
            .iter()
            .filter(|r| classes.contains(&r.class_id))
            .map(|r| EntityRef::QosRule(r.id)),
    );
    out
}

/// `entity` plus every entity whose directives are built from it: a zone's
/// rules and forwards, the rules matching against an ipset
fn dependents(
    snapshot: &PolicySnapshot,
    entity: EntityRef,
    ledger: &HashMap<EntityRef, Vec<ActiveDirective>>,
) -> BTreeSet<EntityRef> {
    let mut out = BTreeSet::from([entity]);
    let live = ledger.get(&entity).map(Vec::as_slice).unwrap_or_default();

    match entity {
        EntityRef::Zone(id) => {
            let mut names: BTreeSet<String> = snapshot
                .zones
                .iter()
                .filter(|z| z.id == id)
                .map(|z| z.name.clone())
                .collect();
            names.extend(live.iter().filter_map(|a| match &a.directive.scope {
                Scope::Zone(name) => Some(name.clone()),
                _ => None,
            }));
            out.extend(
                snapshot
                    .rules
                    .iter()
                    .filter(|r| names.contains(&r.zone))
                    .map(|r| EntityRef::Rule(r.id)),
            );
            out.extend(
                snapshot
                    .port_forwards
                    .iter()
                    .filter(|f| {
                        names.contains(&f.source_zone)
                            || f.dest_zone.as_ref().is_some_and(|d| names.contains(d))
                    })
                    .map(|f| EntityRef::PortForward(f.id)),
            );
            for (owner, active) in ledger {
                if active
                    .iter()
                    .any(|a| matches!(&a.directive.scope, Scope::Zone(n) if names.contains(n)))
                {
                    out.insert(*owner);
                }
            }
        }
        EntityRef::IpSet(id) => {
            let mut names: BTreeSet<String> = snapshot
                .ipsets
                .iter()
                .filter(|s| s.id == id)
                .map(|s| s.name.clone())
                .collect();
            names.extend(live.iter().filter_map(|a| match &a.directive.kind {
                DirectiveKind::CreateSet { name, .. } => Some(name.clone()),
                _ => None,
            }));
            let references = |spec: &str| {
                spec.trim()
                    .strip_prefix('@')
                    .is_some_and(|n| names.contains(n))
            };
            out.extend(
                snapshot
                    .rules
                    .iter()
                    .filter(|r| references(&r.source) || references(&r.destination))
                    .map(|r| EntityRef::Rule(r.id)),
            );
            for (owner, active) in ledger {
                if active
                    .iter()
                    .any(|a| a.directive.referenced_sets().iter().any(|s| names.contains(*s)))
                {
                    out.insert(*owner);
                }
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{FakeRunner, engine_config, ipset, rule, zone};
    use crate::core::model::IpSetKind;

    fn policy() -> PolicySnapshot {
        let mut s = PolicySnapshot::default();
        s.zones.push(zone(1, "wan", 0, &["eth0"]));
        s.zones.push(zone(2, "lan", 1, &["eth1"]));
        s.rules.push(rule(10, "wan", 10, "tcp", "22"));
        s.rules.push(rule(11, "wan", 20, "tcp", "443"));
        s.rules.push(rule(12, "lan", 10, "udp", "53"));
        s
    }

    fn engine(runner: FakeRunner) -> Engine<FakeRunner> {
        Engine::new(runner, &engine_config(), None)
    }

    #[test]
    fn test_parse_handle() {
        assert_eq!(
            parse_handle("add rule inet zonefw zones tcp dport 22 accept # handle 17\n"),
            Some(17)
        );
        assert_eq!(parse_handle(""), None);
    }

    #[tokio::test]
    async fn test_rebuild_records_handles() {
        let runner = FakeRunner::new();
        let engine = engine(runner.clone());
        let report = engine.rebuild(&policy(), RebuildTarget::All).await.unwrap();
        assert!(report.is_clean(), "{:?}", report.summary());

        let live = engine.active_for(&EntityRef::Rule(10)).await;
        assert_eq!(live.len(), 1);
        assert!(live[0].handle.is_some());

        let status = engine.status().await;
        assert!(status.enabled);
        // 3 rules + 2 zone catch-alls
        assert_eq!(status.active_directive_count, 5);
        assert!(status.fingerprint.is_some());
        assert_eq!(runner.count_matching("delete table inet zonefw"), 1);
    }

    #[tokio::test]
    async fn test_failed_directive_degrades_owner_and_continues() {
        let runner = FakeRunner::new();
        runner.fail_when("dport 443", "Error: Could not process rule: No such file or directory");
        let engine = engine(runner);
        let report = engine.rebuild(&policy(), RebuildTarget::Firewall).await.unwrap();

        assert_eq!(report.failed(), 1);
        assert_eq!(report.succeeded(), 4);
        let status = engine.entity_status(&EntityRef::Rule(11)).await.unwrap();
        assert!(status.degraded);
        assert_eq!(status.active_directives, 0);
        let ok = engine.entity_status(&EntityRef::Rule(12)).await.unwrap();
        assert!(!ok.degraded);
        assert_eq!(ok.state, LifecycleState::Applied);
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_not_retried() {
        let runner = FakeRunner::new();
        runner.time_out_when("dport 22");
        let engine = engine(runner.clone());
        let report = engine.rebuild(&policy(), RebuildTarget::Firewall).await.unwrap();
        assert_eq!(report.failed(), 1);
        assert!(report.summary().errors[0].contains("timed out"));
        assert_eq!(runner.count_matching("dport 22"), 1);
    }

    #[tokio::test]
    async fn test_incremental_insert_uses_next_live_handle() {
        let runner = FakeRunner::new();
        let engine = engine(runner.clone());
        let mut s = policy();
        engine.rebuild(&s, RebuildTarget::Firewall).await.unwrap();
        let next = engine.active_for(&EntityRef::Rule(11)).await[0].handle.unwrap();

        s.rules.push(rule(13, "wan", 15, "tcp", "80"));
        let report = engine.apply_entity(&s, EntityRef::Rule(13)).await.unwrap();
        assert_eq!(report.succeeded(), 1);
        let last = runner.invocations().pop().unwrap();
        assert!(
            last.script_line()
                .starts_with(&format!("insert rule inet zonefw zones position {next}")),
            "{last}"
        );
    }

    #[tokio::test]
    async fn test_incremental_before_rebuild_falls_back() {
        let runner = FakeRunner::new();
        let engine = engine(runner.clone());
        engine.apply_entity(&policy(), EntityRef::Rule(10)).await.unwrap();
        assert_eq!(runner.count_matching("delete table inet zonefw"), 1);
        assert!(engine.status().await.enabled);
    }

    #[tokio::test]
    async fn test_remove_entity_deletes_by_handle() {
        let runner = FakeRunner::new();
        let engine = engine(runner.clone());
        let s = policy();
        engine.rebuild(&s, RebuildTarget::Firewall).await.unwrap();
        let handle = engine.active_for(&EntityRef::Rule(10)).await[0].handle.unwrap();

        engine.remove_entity(&s, EntityRef::Rule(10), true).await.unwrap();
        assert_eq!(
            runner.invocations().last().unwrap().script_line(),
            format!("delete rule inet zonefw zones handle {handle}")
        );
        let status = engine.entity_status(&EntityRef::Rule(10)).await.unwrap();
        assert_eq!(status.state, LifecycleState::Deleted);

        let again = engine.remove_entity(&s, EntityRef::Rule(10), true).await;
        assert!(matches!(again, Err(Error::Lifecycle(_))));
    }

    #[tokio::test]
    async fn test_zone_change_reapplies_its_rules() {
        let runner = FakeRunner::new();
        let engine = engine(runner.clone());
        let mut s = policy();
        engine.rebuild(&s, RebuildTarget::Firewall).await.unwrap();
        let before = runner.invocations().len();

        s.zones[0].interfaces = vec!["ppp0".into()];
        let report = engine.apply_entity(&s, EntityRef::Zone(1)).await.unwrap();
        // 3 wan directives removed and re-added
        assert_eq!(report.results.len(), 6);
        let issued = &runner.invocations()[before..];
        assert!(issued.iter().all(|i| !i.script_line().contains("\"eth1\"")));
        assert_eq!(engine.active_for(&EntityRef::Rule(12)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_ipset_change_removes_referencing_rules_first() {
        let runner = FakeRunner::new();
        let engine = engine(runner.clone());
        let mut s = policy();
        s.ipsets.push(ipset(5, "blocklist", IpSetKind::Network, &["10.0.0.0/8"]));
        let mut r = rule(14, "wan", 1, "all", "any");
        r.source = "@blocklist".into();
        s.rules.push(r);
        engine.rebuild(&s, RebuildTarget::Firewall).await.unwrap();
        let before = runner.invocations().len();

        s.ipsets[0].members.push("192.168.0.0/16".into());
        engine.apply_entity(&s, EntityRef::IpSet(5)).await.unwrap();
        let issued: Vec<String> = runner.invocations()[before..]
            .iter()
            .map(Invocation::script_line)
            .collect();
        assert!(issued[0].starts_with("delete rule inet zonefw zones handle"));
        assert_eq!(issued[1], "delete set inet zonefw blocklist");
        assert!(issued[2].starts_with("add set inet zonefw blocklist"));
        assert!(issued.last().unwrap().contains("@blocklist"));
    }

    #[tokio::test]
    async fn test_teardown_disables() {
        let runner = FakeRunner::new();
        let engine = engine(runner.clone());
        engine.rebuild(&policy(), RebuildTarget::All).await.unwrap();
        engine.teardown().await.unwrap();
        let status = engine.status().await;
        assert!(!status.enabled);
        assert_eq!(status.active_directive_count, 0);
    }

    #[tokio::test]
    async fn test_restore_loads_script_and_forgets_handles() {
        let runner = FakeRunner::new();
        let engine = engine(runner.clone());
        engine.rebuild(&policy(), RebuildTarget::All).await.unwrap();

        engine
            .restore(Path::new("/tmp/zonefw.nft"), Some(Path::new("/tmp/zonefw.tc")))
            .await
            .unwrap();
        assert_eq!(runner.count_matching("-f /tmp/zonefw.nft"), 1);
        assert_eq!(runner.count_matching("-force -batch /tmp/zonefw.tc"), 1);
        let status = engine.status().await;
        assert!(!status.enabled);
        assert_eq!(status.active_directive_count, 0);

        // handles are unknown, so the next change rebuilds the table
        let before = runner.invocations().len();
        engine.apply_entity(&policy(), EntityRef::Zone(1)).await.unwrap();
        assert!(runner.invocations()[before..]
            .iter()
            .any(|i| i.script_line().starts_with("delete table inet zonefw")));
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_ledger() {
        let runner = FakeRunner::new();
        let engine = engine(runner.clone());
        engine.rebuild(&policy(), RebuildTarget::All).await.unwrap();
        let active = engine.status().await.active_directive_count;

        runner.fail_when("-f /tmp/broken.nft", "Error: syntax error, unexpected junk");
        let err = engine.restore(Path::new("/tmp/broken.nft"), None).await.unwrap_err();
        assert!(err.detail().contains("syntax error"));
        assert_eq!(runner.count_matching("-batch"), 0);
        assert_eq!(engine.status().await.active_directive_count, active);
        assert!(engine.status().await.enabled);
    }
}

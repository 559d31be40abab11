//! State synchronizer: compares live NAT mappings and sets against desired state
//!
//! Live state is read with `nft -j list table`, once for the managed table and
//! once per configured foreign table (where other tools such as UPnP daemons
//! install their mappings). Mappings in the managed table carry a comment tag
//! naming the entity that produced them; anything untagged was installed by
//! someone else.
//!
//! For each desired port forward the live mapping is **present** (tagged with
//! its entity and equal, or untagged with an equal key anywhere), **divergent**
//! (tagged but different) or **absent**. Divergent and absent forwards are
//! re-applied. Tagged mappings nothing desires are deleted. Untagged mappings
//! nothing desires are imported into the policy or reported as orphans,
//! depending on [`UnknownMappingPolicy`].

use crate::audit::{AuditEvent, EventType};
use crate::config::{EngineConfig, UnknownMappingPolicy, parse_table_ref};
use crate::core::compiler;
use crate::core::directive::{self, Directive, DirectiveKind, Invocation, parse_entity_tag};
use crate::core::engine::{CommandRunner, Engine, RebuildTarget};
use crate::core::error::{Error, Result};
use crate::core::model::{EntityRef, ImportedForward, PolicySnapshot, PolicyStore, Protocol};
use crate::core::spec::{PortItem, PortSpec};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One live DNAT rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedMapping {
    /// Entity named by the rule's comment tag
    pub owner: Option<EntityRef>,
    pub handle: Option<u64>,
    pub family: String,
    pub table: String,
    pub chain: String,
    pub interfaces: Vec<String>,
    pub protocol: Protocol,
    pub external_port: PortSpec,
    pub dest_ip: IpAddr,
    pub dest_port: PortSpec,
}

impl fmt::Display for ObservedMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}: {} {}→{}",
            self.family, self.table, self.chain, self.protocol, self.external_port, self.dest_ip
        )?;
        if !self.dest_port.is_any() {
            write!(f, ":{}", self.dest_port)?;
        }
        Ok(())
    }
}

/// One live set with its elements rendered the way directives render them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedSet {
    pub family: String,
    pub table: String,
    pub name: String,
    pub elements: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedState {
    /// Whether the managed table exists at all
    pub managed_present: bool,
    pub mappings: Vec<ObservedMapping>,
    pub sets: Vec<ObservedSet>,
}

/// Reads live state from the enforcement facility
pub trait StateObserver: Send + Sync + 'static {
    fn observe(&self) -> impl Future<Output = Result<ObservedState>> + Send;
}

/// Observes through `nft -j list table`
pub struct NftObserver<R: CommandRunner> {
    runner: Arc<R>,
    table: String,
    foreign: Vec<(String, String)>,
    timeout: Duration,
}

impl<R: CommandRunner> NftObserver<R> {
    pub fn new(runner: Arc<R>, config: &EngineConfig) -> Result<Self> {
        let foreign = config
            .observe_tables
            .iter()
            .map(|t| parse_table_ref(t).map_err(|e| Error::validation("config", e)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            runner,
            table: config.table.clone(),
            foreign,
            timeout: config.command_timeout(),
        })
    }

    async fn list(&self, family: &str, table: &str) -> Result<String> {
        let invocation = Invocation::nft(["-j", "list", "table", family, table]);
        Ok(self.runner.run(&invocation, self.timeout).await?.stdout)
    }
}

impl<R: CommandRunner> StateObserver for NftObserver<R> {
    async fn observe(&self) -> Result<ObservedState> {
        let mut state = ObservedState::default();

        match self.list("inet", &self.table).await {
            Ok(json) => {
                state.managed_present = true;
                let (mappings, sets) = parse_ruleset(&json)?;
                state.mappings.extend(mappings);
                state.sets.extend(sets);
            }
            Err(e) if e.detail().contains("No such file") => {
                debug!("table inet {} not present", self.table);
            }
            Err(e) => return Err(e),
        }

        for (family, table) in &self.foreign {
            // a foreign table that does not exist yet holds no mappings
            match self.list(family, table).await {
                Ok(json) => state.mappings.extend(parse_ruleset(&json)?.0),
                Err(e) => warn!("Cannot list table {family} {table}: {e}"),
            }
        }
        Ok(state)
    }
}

/// Parses `nft -j list table` output into DNAT mappings and sets
pub fn parse_ruleset(json: &str) -> Result<(Vec<ObservedMapping>, Vec<ObservedSet>)> {
    let root: Value = serde_json::from_str(json)?;
    let items = root
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Internal("nft output has no 'nftables' array".into()))?;

    let mut mappings = Vec::new();
    let mut sets = Vec::new();
    for item in items {
        if let Some(rule) = item.get("rule") {
            if let Some(mapping) = parse_mapping(rule) {
                mappings.push(mapping);
            }
        } else if let Some(set) = item.get("set") {
            sets.push(ObservedSet {
                family: str_field(set, "family"),
                table: str_field(set, "table"),
                name: str_field(set, "name"),
                elements: set
                    .get("elem")
                    .and_then(Value::as_array)
                    .map(|elems| elems.iter().filter_map(render_element).collect())
                    .unwrap_or_default(),
            });
        }
    }
    Ok((mappings, sets))
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn render_element(elem: &Value) -> Option<String> {
    match elem {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => {
            if let Some(prefix) = map.get("prefix") {
                let addr = prefix.get("addr")?.as_str()?;
                let len = prefix.get("len")?.as_u64()?;
                Some(format!("{addr}/{len}"))
            } else if let Some(parts) = map.get("concat").and_then(Value::as_array) {
                let rendered: Option<Vec<String>> = parts.iter().map(render_element).collect();
                Some(rendered?.join(" . "))
            } else if let Some(range) = map.get("range").and_then(Value::as_array) {
                let lo = render_element(range.first()?)?;
                let hi = render_element(range.get(1)?)?;
                Some(format!("{lo}-{hi}"))
            } else {
                // elements with timeouts or comments wrap the value
                map.get("elem").and_then(|e| e.get("val")).and_then(render_element)
            }
        }
        _ => None,
    }
}

fn port_item(value: &Value) -> Option<PortItem> {
    if let Some(port) = value.as_u64() {
        return u16::try_from(port).ok().map(PortItem::Port);
    }
    let range = value.get("range")?.as_array()?;
    let lo = u16::try_from(range.first()?.as_u64()?).ok()?;
    let hi = u16::try_from(range.get(1)?.as_u64()?).ok()?;
    Some(PortItem::Range(lo, hi))
}

fn port_spec(value: &Value) -> Option<PortSpec> {
    let items: Vec<PortItem> = match value.get("set").and_then(Value::as_array) {
        Some(set) => set.iter().map(port_item).collect::<Option<_>>()?,
        None => vec![port_item(value)?],
    };
    Some(match items.as_slice() {
        [PortItem::Port(p)] => PortSpec::Single(*p),
        [PortItem::Range(lo, hi)] => PortSpec::Range(*lo, *hi),
        _ => PortSpec::List(items),
    })
}

fn strings(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        other => other
            .get("set")
            .and_then(Value::as_array)
            .map(|set| set.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default(),
    }
}

fn protocol_of(names: &[String]) -> Option<Protocol> {
    let has = |p: &str| names.iter().any(|n| n == p);
    match (has("tcp"), has("udp")) {
        (true, true) => Some(Protocol::TcpUdp),
        (true, false) => Some(Protocol::Tcp),
        (false, true) => Some(Protocol::Udp),
        _ => None,
    }
}

fn parse_mapping(rule: &Value) -> Option<ObservedMapping> {
    let exprs = rule.get("expr")?.as_array()?;
    let dnat = exprs.iter().find_map(|e| e.get("dnat"))?;
    let dest_ip: IpAddr = dnat.get("addr")?.as_str()?.parse().ok()?;
    let dest_port = match dnat.get("port") {
        Some(port) => port_spec(port)?,
        None => PortSpec::Any,
    };

    let mut interfaces = Vec::new();
    let mut protocol = None;
    let mut external_port = PortSpec::Any;
    for expr in exprs {
        let Some(m) = expr.get("match") else { continue };
        let (Some(left), Some(right)) = (m.get("left"), m.get("right")) else {
            continue;
        };
        if let Some(meta) = left.get("meta").and_then(|m| m.get("key")).and_then(Value::as_str) {
            match meta {
                "iifname" => interfaces = strings(right),
                "l4proto" => protocol = protocol_of(&strings(right)),
                _ => {}
            }
        } else if let Some(payload) = left.get("payload") {
            let proto = payload.get("protocol").and_then(Value::as_str).unwrap_or_default();
            if payload.get("field").and_then(Value::as_str) == Some("dport") {
                external_port = port_spec(right)?;
                if proto != "th" {
                    protocol = protocol_of(&[proto.to_string()]);
                }
            }
        }
    }
    interfaces.sort();

    Some(ObservedMapping {
        owner: rule
            .get("comment")
            .and_then(Value::as_str)
            .and_then(parse_entity_tag),
        handle: rule.get("handle").and_then(Value::as_u64),
        family: str_field(rule, "family"),
        table: str_field(rule, "table"),
        chain: str_field(rule, "chain"),
        interfaces,
        protocol: protocol.unwrap_or(Protocol::All),
        external_port,
        dest_ip,
        dest_port,
    })
}

/// Identity used to compare a live mapping with a desired DNAT
#[derive(Debug, Clone, PartialEq, Eq)]
struct MappingKey {
    interfaces: Vec<String>,
    protocol: Protocol,
    external: Vec<(u16, u16)>,
    dest_ip: IpAddr,
    dest_port: Vec<(u16, u16)>,
}

fn sorted_ranges(spec: &PortSpec) -> Vec<(u16, u16)> {
    let mut ranges = spec.ranges();
    ranges.sort_unstable();
    ranges
}

impl MappingKey {
    fn of_directive(directive: &Directive) -> Option<Self> {
        let DirectiveKind::Dnat {
            interfaces,
            protocol,
            external_port,
            dest_ip,
            dest_port,
            ..
        } = &directive.kind
        else {
            return None;
        };
        let mut interfaces = interfaces.clone();
        interfaces.sort();
        Some(Self {
            interfaces,
            protocol: *protocol,
            external: sorted_ranges(external_port),
            dest_ip: *dest_ip,
            dest_port: sorted_ranges(dest_port),
        })
    }

    fn without_interfaces(mut self) -> Self {
        self.interfaces.clear();
        self
    }

    fn of_mapping(mapping: &ObservedMapping) -> Self {
        Self {
            interfaces: mapping.interfaces.clone(),
            protocol: mapping.protocol,
            external: sorted_ranges(&mapping.external_port),
            dest_ip: mapping.dest_ip,
            dest_port: sorted_ranges(&mapping.dest_port),
        }
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Divergences found, whether or not they were corrected
    pub drift_count: usize,
    pub corrected: usize,
    pub imported: usize,
    pub orphaned: usize,
    pub orphans: Vec<String>,
    pub errors: Vec<String>,
}

impl SyncReport {
    /// Divergences left after the pass, as exposed by the status query
    pub fn unresolved(&self) -> usize {
        self.drift_count.saturating_sub(self.corrected)
    }
}

/// Compares live state with the policy and corrects what diverged.
///
/// Each correction is an incremental apply (or a single delete) through the
/// engine, so its locks serialize against concurrent rebuilds.
pub async fn reconcile<R, O, S>(
    engine: &Engine<R>,
    observer: &O,
    store: &S,
    policy: UnknownMappingPolicy,
) -> Result<SyncReport>
where
    R: CommandRunner,
    O: StateObserver + ?Sized,
    S: PolicyStore + ?Sized,
{
    let snapshot = store.snapshot()?;
    let observed = observer.observe().await?;
    let enforced = engine.status().await.enabled;
    let mut report = SyncReport::default();

    if enforced && !observed.managed_present {
        warn!("Table inet {} vanished; rebuilding", engine.table());
        report.drift_count += 1;
        match engine.rebuild(store, RebuildTarget::Firewall).await {
            Ok(r) if r.failed() == 0 => report.corrected += 1,
            Ok(r) => report.errors.extend(r.summary().errors),
            Err(e) => report.errors.push(e.to_string()),
        }
    } else if enforced {
        reconcile_forwards(engine, store, &snapshot, &observed, &mut report).await;
        reconcile_sets(engine, store, &snapshot, &observed, &mut report).await;
    }

    handle_unknown(engine, store, &snapshot, &observed, policy, &mut report).await;
    if report.imported > 0
        && let Err(e) = store.persist().await
    {
        report.errors.push(format!("saving imported forwards: {e}"));
    }

    engine.record_drift(report.unresolved()).await;
    engine
        .record_event(AuditEvent::new(
            EventType::Sync,
            report.errors.is_empty(),
            serde_json::json!({
                "drift": report.drift_count,
                "corrected": report.corrected,
                "imported": report.imported,
                "orphaned": report.orphaned,
            }),
            report.errors.first().cloned(),
        ))
        .await;
    info!(
        "Sync: {} drift, {} corrected, {} imported, {} orphaned",
        report.drift_count, report.corrected, report.imported, report.orphaned
    );
    Ok(report)
}

/// Desired DNAT directives by owning forward
fn desired_forwards(snapshot: &PolicySnapshot, engine_order: compiler::PriorityOrder) -> Vec<(EntityRef, MappingKey)> {
    compiler::compile_firewall(snapshot, engine_order)
        .directives
        .iter()
        .filter_map(|d| MappingKey::of_directive(d).map(|k| (d.owner, k)))
        .collect()
}

fn in_table(family: &str, table: &str, managed: &str) -> bool {
    family == "inet" && table == managed
}

async fn correct<R, S>(engine: &Engine<R>, store: &S, entity: EntityRef, report: &mut SyncReport)
where
    R: CommandRunner,
    S: PolicyStore + ?Sized,
{
    match engine.apply_entity(store, entity).await {
        Ok(r) if r.failed() == 0 => report.corrected += 1,
        Ok(r) => report.errors.extend(r.summary().errors),
        Err(e) => {
            engine.mark_degraded(entity, &e).await;
            report.errors.push(format!("{entity}: {e}"));
        }
    }
}

async fn reconcile_forwards<R, S>(
    engine: &Engine<R>,
    store: &S,
    snapshot: &PolicySnapshot,
    observed: &ObservedState,
    report: &mut SyncReport,
) where
    R: CommandRunner,
    S: PolicyStore + ?Sized,
{
    let desired = desired_forwards(snapshot, engine.order());
    let desired_owners: BTreeSet<EntityRef> = desired.iter().map(|(e, _)| *e).collect();

    for (entity, key) in &desired {
        let tagged: Vec<&ObservedMapping> = observed
            .mappings
            .iter()
            .filter(|m| in_table(&m.family, &m.table, engine.table()) && m.owner == Some(*entity))
            .collect();
        let present = tagged.iter().any(|m| &MappingKey::of_mapping(m) == key)
            || observed
                .mappings
                .iter()
                .any(|m| m.owner.is_none() && &MappingKey::of_mapping(m) == key);
        if present {
            continue;
        }

        report.drift_count += 1;
        if tagged.is_empty() {
            warn!("{entity}: mapping absent; re-applying");
        } else {
            warn!("{entity}: live mapping diverged; re-applying");
        }
        correct(engine, store, *entity, report).await;
    }

    // tagged mappings nothing asks for any more
    for mapping in &observed.mappings {
        let Some(owner) = mapping.owner else { continue };
        if !in_table(&mapping.family, &mapping.table, engine.table())
            || desired_owners.contains(&owner)
        {
            continue;
        }
        report.drift_count += 1;
        let Some(handle) = mapping.handle else {
            report.errors.push(format!("{owner}: stale mapping without handle"));
            continue;
        };
        warn!("{owner}: removing stale mapping {mapping}");
        let invocation = Invocation::nft([
            "delete".to_string(),
            "rule".into(),
            "inet".into(),
            engine.table().into(),
            mapping.chain.clone(),
            "handle".into(),
            handle.to_string(),
        ]);
        match engine.execute(&invocation, EventType::Sync, Some(owner)).await {
            Ok(_) => report.corrected += 1,
            Err(e) => report.errors.push(format!("{owner}: {e}")),
        }
    }
}

async fn reconcile_sets<R, S>(
    engine: &Engine<R>,
    store: &S,
    snapshot: &PolicySnapshot,
    observed: &ObservedState,
    report: &mut SyncReport,
) where
    R: CommandRunner,
    S: PolicyStore + ?Sized,
{
    let compilation = compiler::compile_firewall(snapshot, engine.order());
    let mut desired: BTreeMap<&str, (EntityRef, BTreeSet<String>)> = BTreeMap::new();
    let mut members: BTreeMap<&str, Vec<&Directive>> = BTreeMap::new();
    for directive in &compilation.directives {
        match &directive.kind {
            DirectiveKind::CreateSet { name, .. } => {
                desired.insert(name.as_str(), (directive.owner, BTreeSet::new()));
            }
            DirectiveKind::AddMember { set, element } => {
                if let Some((_, elements)) = desired.get_mut(set.as_str()) {
                    elements.insert(element.clone());
                }
                members.entry(set.as_str()).or_default().push(directive);
            }
            _ => {}
        }
    }

    let live: BTreeMap<&str, &ObservedSet> = observed
        .sets
        .iter()
        .filter(|s| in_table(&s.family, &s.table, engine.table()))
        .map(|s| (s.name.as_str(), s))
        .collect();

    for (name, (entity, elements)) in &desired {
        let Some(set) = live.get(name) else {
            report.drift_count += 1;
            warn!("{entity}: set {name} missing; re-applying");
            correct(engine, store, *entity, report).await;
            continue;
        };
        if &set.elements == elements {
            continue;
        }

        report.drift_count += 1;
        warn!("{entity}: set {name} elements diverged; reloading");
        let mut steps = vec![directive::set_flush(engine.table(), name)];
        steps.extend(
            members
                .get(name)
                .into_iter()
                .flatten()
                .map(|d| d.invocation(engine.table())),
        );
        let mut failed = None;
        for step in &steps {
            if let Err(e) = engine.execute(step, EventType::Sync, Some(*entity)).await {
                failed = Some(e);
                break;
            }
        }
        match failed {
            None => report.corrected += 1,
            Some(e) => {
                engine.mark_degraded(*entity, &e).await;
                report.errors.push(format!("{entity}: {e}"));
            }
        }
    }

    for name in live.keys().filter(|n| !desired.contains_key(*n)) {
        report.drift_count += 1;
        warn!("Removing undeclared set {name}");
        let invocation = Invocation::nft(["delete", "set", "inet", engine.table(), *name]);
        match engine.execute(&invocation, EventType::Sync, None).await {
            Ok(_) => report.corrected += 1,
            Err(e) => report.errors.push(format!("set {name}: {e}")),
        }
    }
}

/// Every port forward of the policy, enabled or not, keyed without interfaces
fn policy_forwards(snapshot: &PolicySnapshot) -> Vec<MappingKey> {
    snapshot
        .port_forwards
        .iter()
        .filter_map(|f| {
            Some(MappingKey {
                interfaces: Vec::new(),
                protocol: f.protocol,
                external: sorted_ranges(&f.external_port.parse::<PortSpec>().ok()?),
                dest_ip: f.dest_ip.trim().parse().ok()?,
                dest_port: sorted_ranges(&f.dest_port.parse::<PortSpec>().ok()?),
            })
        })
        .collect()
}

/// Zone an imported mapping belongs to: the one owning its inbound
/// interface, else the first enabled masquerading zone
fn import_zone(snapshot: &PolicySnapshot, mapping: &ObservedMapping) -> Option<String> {
    let mut zones: Vec<_> = snapshot.zones.iter().filter(|z| z.enabled).collect();
    zones.sort_by_key(|z| z.id);
    zones
        .iter()
        .find(|z| mapping.interfaces.iter().any(|i| z.interfaces.contains(i)))
        .or_else(|| zones.iter().find(|z| z.masquerade))
        .map(|z| z.name.clone())
}

async fn handle_unknown<R, S>(
    engine: &Engine<R>,
    store: &S,
    snapshot: &PolicySnapshot,
    observed: &ObservedState,
    policy: UnknownMappingPolicy,
    report: &mut SyncReport,
) where
    R: CommandRunner,
    S: PolicyStore + ?Sized,
{
    let desired: Vec<MappingKey> = desired_forwards(snapshot, engine.order())
        .into_iter()
        .map(|(_, k)| k)
        .collect();

    let mut known = policy_forwards(snapshot);

    for mapping in observed.mappings.iter().filter(|m| m.owner.is_none()) {
        let key = MappingKey::of_mapping(mapping);
        if desired.contains(&key) {
            continue;
        }
        // an import compiles with every interface of its zone, so it never
        // matches the mapping exactly
        let loose = key.without_interfaces();
        if known.contains(&loose) {
            debug!("{mapping} is already a port forward");
            continue;
        }

        let zone = match policy {
            UnknownMappingPolicy::Import => import_zone(snapshot, mapping),
            UnknownMappingPolicy::Orphan => None,
        };
        let Some(zone) = zone else {
            report.drift_count += 1;
            report.orphaned += 1;
            report.orphans.push(mapping.to_string());
            debug!("Orphan mapping {mapping}");
            continue;
        };

        let imported = ImportedForward {
            source_zone: zone,
            protocol: mapping.protocol,
            external_port: mapping.external_port.to_string(),
            dest_ip: mapping.dest_ip.to_string(),
            dest_port: mapping.dest_port.to_string(),
            description: format!(
                "imported from {} {}/{}",
                mapping.family, mapping.table, mapping.chain
            ),
        };
        let result = store.import_port_forward(imported);
        let event = AuditEvent::new(
            EventType::ImportMapping,
            result.is_ok(),
            serde_json::json!({ "mapping": mapping.to_string() }),
            result.as_ref().err().map(ToString::to_string),
        );
        engine.record_event(event).await;
        match result {
            Ok(id) => {
                info!("Imported {mapping} as {}", EntityRef::PortForward(id));
                report.imported += 1;
                known.push(loose);
            }
            Err(e) => report.errors.push(format!("import {mapping}: {e}")),
        }
    }
}

//! Rule compiler: policy snapshot → ordered directive list
//!
//! Compilation is a pure function of the snapshot. Output order:
//!
//! 1. every enabled ipset (`CreateSet`, then one `AddMember` per element)
//! 2. every enabled port forward (`Dnat` immediately followed by `ForwardAccept`)
//! 3. for each enabled zone in priority order: its enabled rules in priority
//!    order, then `Masquerade` / `MssClamp` when set, then the zone's
//!    `DefaultPolicy` catch-all
//! 4. shaper trees, one per enabled QoS configuration (see [`crate::core::qos`])
//!
//! A malformed entity never aborts the whole compile. Its error is recorded
//! against the entity and compilation continues with the next one.

use crate::core::directive::{AddrMatch, Directive, DirectiveKind, MatchCriteria, Scope, SetFamily};
use crate::core::error::{Error, Result};
use crate::core::model::{EntityRef, IpSet, PolicySnapshot, PortForward, Rule, Zone};
use crate::core::spec::{AddrSpec, Family, PortSpec, ServiceEntry, normalize_network};
use crate::validators;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use tracing::debug;

/// Which end of the priority scale is evaluated first
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum PriorityOrder {
    /// Lower number first
    #[default]
    #[strum(serialize = "ascending")]
    Ascending,
    /// Higher number first
    #[strum(serialize = "descending")]
    Descending,
}

impl PriorityOrder {
    /// Sort key; ties always fall back to ascending id
    pub fn key(self, priority: i32, id: u32) -> (i64, u32) {
        match self {
            PriorityOrder::Ascending => (i64::from(priority), id),
            PriorityOrder::Descending => (-i64::from(priority), id),
        }
    }
}

/// An error attributed to the entity whose directives it blocked
#[derive(Debug)]
pub struct EntityError {
    pub entity: EntityRef,
    pub error: Error,
}

/// Output of one compile
#[derive(Debug, Default)]
pub struct Compilation {
    pub directives: Vec<Directive>,
    pub errors: Vec<EntityError>,
    pub warnings: Vec<String>,
}

impl Compilation {
    fn reject(&mut self, entity: EntityRef, error: Error) {
        debug!("Compile rejected {entity}: {error}");
        self.errors.push(EntityError { entity, error });
    }

    /// Directives owned by any entity in `owners`, in compiled order
    pub fn owned_by(&self, owners: &HashSet<EntityRef>) -> Vec<Directive> {
        self.directives
            .iter()
            .filter(|d| owners.contains(&d.owner))
            .cloned()
            .collect()
    }

    pub fn error_for(&self, entity: &EntityRef) -> Option<&Error> {
        self.errors
            .iter()
            .find(|e| &e.entity == entity)
            .map(|e| &e.error)
    }

    fn absorb(&mut self, other: Compilation) {
        self.directives.extend(other.directives);
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Re-labels a grammar error with the entity and field it came from
fn field_error(entity: &EntityRef, field: &str, err: Error) -> Error {
    match err {
        Error::Validation { message, .. } => Error::validation(entity, format!("{field}: {message}")),
        other => other,
    }
}

fn parse_ports(entity: &EntityRef, field: &str, raw: &str) -> Result<PortSpec> {
    raw.parse().map_err(|e| field_error(entity, field, e))
}

/// Resolved view of the enabled ipsets
#[derive(Default)]
struct SetTable {
    active: HashMap<String, (SetFamily, bool)>,
    disabled: HashSet<String>,
}

impl SetTable {
    fn resolve(&self, entity: &EntityRef, spec: AddrSpec) -> Result<AddrMatch> {
        match spec {
            AddrSpec::Any => Ok(AddrMatch::Any),
            AddrSpec::Net(net) => Ok(AddrMatch::Net(net)),
            AddrSpec::Set(name) => {
                if let Some((family, with_port)) = self.active.get(&name) {
                    Ok(AddrMatch::Set {
                        name,
                        family: *family,
                        with_port: *with_port,
                    })
                } else if self.disabled.contains(&name) {
                    Err(Error::compilation(entity, format!("ipset '{name}' is disabled")))
                } else {
                    Err(Error::compilation(entity, format!("ipset '{name}' does not exist")))
                }
            }
        }
    }
}

/// Zones that passed validation, by name
struct ZoneTable<'a> {
    valid: HashMap<&'a str, &'a Zone>,
    invalid: HashSet<&'a str>,
}

impl<'a> ZoneTable<'a> {
    /// Resolves a zone reference. `Ok(None)` means the zone exists but is disabled.
    fn lookup(&self, entity: &EntityRef, name: &str) -> Result<Option<&'a Zone>> {
        if let Some(zone) = self.valid.get(name) {
            return Ok(zone.enabled.then_some(*zone));
        }
        if self.invalid.contains(name) {
            return Err(Error::compilation(entity, format!("zone '{name}' failed validation")));
        }
        Err(Error::compilation(entity, format!("zone '{name}' does not exist")))
    }
}

/// Compiles the complete snapshot: packet filter followed by every shaper tree.
pub fn compile(snapshot: &PolicySnapshot, order: PriorityOrder) -> Compilation {
    let mut out = compile_firewall(snapshot, order);
    out.absorb(crate::core::qos::compile_shapers(snapshot));
    out
}

/// Compiles only the packet-filter part of the snapshot.
pub fn compile_firewall(snapshot: &PolicySnapshot, order: PriorityOrder) -> Compilation {
    let mut out = Compilation::default();

    let zones = validate_zones(snapshot, &mut out);
    let sets = compile_sets(snapshot, &mut out);
    check_service_groups(snapshot, &mut out);
    compile_forwards(snapshot, &zones, &mut out);

    let mut ordered: Vec<&Zone> = zones.valid.values().copied().filter(|z| z.enabled).collect();
    ordered.sort_by_key(|z| order.key(z.priority, z.id));

    for rule in &snapshot.rules {
        let entity = EntityRef::Rule(rule.id);
        if rule.enabled
            && let Err(e) = zones.lookup(&entity, &rule.zone)
        {
            out.reject(entity, e);
        }
    }

    for zone in ordered {
        let scope = Scope::Zone(zone.name.clone());
        let mut rules: Vec<&Rule> = snapshot
            .rules
            .iter()
            .filter(|r| r.enabled && r.zone == zone.name)
            .collect();
        rules.sort_by_key(|r| order.key(r.priority, r.id));

        for rule in rules {
            let entity = EntityRef::Rule(rule.id);
            match compile_rule(rule, zone, &sets) {
                Ok(kind) => out.directives.push(Directive::new(entity, scope.clone(), kind)),
                Err(e) => out.reject(entity, e),
            }
            if let Some(group) = &rule.service_group
                && !snapshot.service_groups.iter().any(|g| &g.name == group)
            {
                out.warnings
                    .push(format!("{entity} references unknown service group '{group}'"));
            }
        }

        let owner = EntityRef::Zone(zone.id);
        if zone.masquerade {
            out.directives.push(Directive::new(
                owner,
                scope.clone(),
                DirectiveKind::Masquerade {
                    interfaces: zone.interfaces.clone(),
                },
            ));
        }
        if zone.mss_clamping {
            out.directives.push(Directive::new(
                owner,
                scope.clone(),
                DirectiveKind::MssClamp {
                    interfaces: zone.interfaces.clone(),
                },
            ));
        }
        out.directives.push(Directive::new(
            owner,
            scope,
            DirectiveKind::DefaultPolicy {
                interfaces: zone.interfaces.clone(),
                verdict: zone.default_policy,
            },
        ));
    }

    out
}

fn validate_zones<'a>(snapshot: &'a PolicySnapshot, out: &mut Compilation) -> ZoneTable<'a> {
    let mut table = ZoneTable {
        valid: HashMap::new(),
        invalid: HashSet::new(),
    };
    let mut by_id: Vec<&Zone> = snapshot.zones.iter().collect();
    by_id.sort_by_key(|z| z.id);

    for zone in by_id {
        let entity = EntityRef::Zone(zone.id);
        if table.valid.contains_key(zone.name.as_str()) || table.invalid.contains(zone.name.as_str())
        {
            out.reject(
                entity,
                Error::validation(entity, format!("duplicate zone name '{}'", zone.name)),
            );
            continue;
        }
        match validate_zone(zone) {
            Ok(()) => {
                table.valid.insert(&zone.name, zone);
            }
            Err(e) => {
                table.invalid.insert(&zone.name);
                if zone.enabled {
                    out.reject(entity, e);
                }
            }
        }
    }
    table
}

fn validate_zone(zone: &Zone) -> Result<()> {
    let entity = EntityRef::Zone(zone.id);
    validators::validate_zone_name(&zone.name).map_err(|e| Error::validation(entity, e))?;
    if zone.interfaces.is_empty() {
        return Err(Error::validation(entity, "zone has no interfaces"));
    }
    for iface in &zone.interfaces {
        validators::validate_interface(iface).map_err(|e| Error::validation(entity, e))?;
    }
    Ok(())
}

fn compile_sets(snapshot: &PolicySnapshot, out: &mut Compilation) -> SetTable {
    let mut table = SetTable::default();
    let mut by_id: Vec<&IpSet> = snapshot.ipsets.iter().collect();
    by_id.sort_by_key(|s| s.id);
    let mut seen = HashSet::new();

    for set in by_id {
        let entity = EntityRef::IpSet(set.id);
        if !seen.insert(set.name.as_str()) {
            out.reject(
                entity,
                Error::validation(entity, format!("duplicate ipset name '{}'", set.name)),
            );
            continue;
        }
        if !set.enabled {
            table.disabled.insert(set.name.clone());
            continue;
        }
        match set_elements(set) {
            Ok((family, elements)) => {
                let scope = Scope::Sets;
                out.directives.push(Directive::new(
                    entity,
                    scope.clone(),
                    DirectiveKind::CreateSet {
                        name: set.name.clone(),
                        family,
                        with_port: set.kind.with_port(),
                        interval: set.kind.with_prefix(),
                    },
                ));
                for element in elements {
                    out.directives.push(Directive::new(
                        entity,
                        scope.clone(),
                        DirectiveKind::AddMember {
                            set: set.name.clone(),
                            element,
                        },
                    ));
                }
                table
                    .active
                    .insert(set.name.clone(), (family, set.kind.with_port()));
            }
            Err(e) => {
                table.disabled.insert(set.name.clone());
                out.reject(entity, e);
            }
        }
    }
    table
}

/// Validates set members against the set kind and renders nft elements.
///
/// Port-carrying members are written `addr,port` or `addr,proto:port`
/// (protocol defaults to tcp, as with ipset).
pub fn set_elements(set: &IpSet) -> Result<(SetFamily, Vec<String>)> {
    let entity = EntityRef::IpSet(set.id);
    validators::validate_set_name(&set.name).map_err(|e| Error::validation(entity, e))?;

    let mut family = None;
    let mut elements = Vec::new();
    for raw in &set.members {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (addr, port) = match (set.kind.with_port(), raw.split_once(',')) {
            (true, Some((addr, port))) => (addr.trim(), Some(port.trim())),
            (true, None) => {
                return Err(Error::validation(
                    entity,
                    format!("member '{raw}' needs a port (addr,port)"),
                ));
            }
            (false, _) => (raw, None),
        };

        let net = normalize_network(addr).map_err(|e| field_error(&entity, "member", e))?;
        let is_host = net.prefix() == if net.is_ipv4() { 32 } else { 128 };
        if !set.kind.with_prefix() && !is_host {
            return Err(Error::validation(
                entity,
                format!("member '{raw}' is a network but the set holds addresses"),
            ));
        }
        let member_family = Family::of(&net);
        match family {
            None => family = Some(member_family),
            Some(f) if f != member_family => {
                return Err(Error::validation(entity, "members mix IPv4 and IPv6"));
            }
            Some(_) => {}
        }

        let mut element = crate::core::spec::network_to_nft(&net);
        if let Some(port) = port {
            let (proto, port) = match port.split_once(':') {
                Some((proto, port)) => (proto.trim().to_ascii_lowercase(), port.trim()),
                None => ("tcp".to_string(), port),
            };
            if proto != "tcp" && proto != "udp" {
                return Err(Error::validation(
                    entity,
                    format!("member '{raw}': protocol must be tcp or udp"),
                ));
            }
            let ports = parse_ports(&entity, "member", port)?;
            if !matches!(ports, PortSpec::Single(_) | PortSpec::Range(..)) {
                return Err(Error::validation(
                    entity,
                    format!("member '{raw}' needs a single port or range"),
                ));
            }
            element = format!("{element} . {proto} . {ports}");
        }
        if elements.contains(&element) {
            return Err(Error::validation(entity, format!("duplicate member '{raw}'")));
        }
        elements.push(element);
    }

    let family = match family {
        Some(Family::V6) => SetFamily::V6,
        _ => SetFamily::V4,
    };
    Ok((family, elements))
}

fn check_service_groups(snapshot: &PolicySnapshot, out: &mut Compilation) {
    let mut seen = HashSet::new();
    let mut groups: Vec<_> = snapshot.service_groups.iter().collect();
    groups.sort_by_key(|g| g.id);
    for group in groups {
        let entity = EntityRef::ServiceGroup(group.id);
        if !seen.insert(group.name.as_str()) {
            out.reject(
                entity,
                Error::validation(entity, format!("duplicate service group name '{}'", group.name)),
            );
            continue;
        }
        for entry in &group.entries {
            if let Err(e) = entry.parse::<ServiceEntry>() {
                out.reject(entity, field_error(&entity, "entry", e));
                break;
            }
        }
    }
}

/// Validated port forward, ready to emit
struct ForwardPlan<'a> {
    forward: &'a PortForward,
    external_port: PortSpec,
    external_addr: Option<ipnetwork::IpNetwork>,
    dest_ip: IpAddr,
    dest_port: PortSpec,
    source: &'a Zone,
    dest: Option<&'a Zone>,
}

fn plan_forward<'a>(forward: &'a PortForward, zones: &ZoneTable<'a>) -> Result<Option<ForwardPlan<'a>>> {
    let entity = EntityRef::PortForward(forward.id);
    if !forward.protocol.carries_ports() {
        return Err(Error::validation(entity, "protocol must be tcp, udp or tcp+udp"));
    }
    let external_port = parse_ports(&entity, "external_port", &forward.external_port)?;
    if external_port.is_any() {
        return Err(Error::validation(entity, "external_port must not be 'any'"));
    }
    let dest_port = parse_ports(&entity, "dest_port", &forward.dest_port)?;
    if matches!(dest_port, PortSpec::List(_)) {
        return Err(Error::validation(entity, "dest_port must be a single port or range"));
    }
    if let (PortSpec::Range(..), Some(ext), Some(dst)) =
        (&dest_port, external_port.width(), dest_port.width())
        && ext != dst
    {
        return Err(Error::validation(
            entity,
            "dest_port range must be as wide as external_port",
        ));
    }
    let dest_ip: IpAddr = forward.dest_ip.trim().parse().map_err(|_| {
        Error::validation(entity, format!("dest_ip: '{}' is not a host address", forward.dest_ip))
    })?;
    let dest_family = match dest_ip {
        IpAddr::V4(_) => Family::V4,
        IpAddr::V6(_) => Family::V6,
    };
    let external_addr = match &forward.external_addr {
        None => None,
        Some(raw) => match raw.parse::<AddrSpec>().map_err(|e| field_error(&entity, "external_addr", e))? {
            AddrSpec::Any => None,
            AddrSpec::Net(net) => {
                if Family::of(&net) != dest_family {
                    return Err(Error::validation(
                        entity,
                        "external_addr and dest_ip are different address families",
                    ));
                }
                Some(net)
            }
            AddrSpec::Set(_) => {
                return Err(Error::validation(entity, "external_addr cannot reference an ipset"));
            }
        },
    };

    let Some(source) = zones.lookup(&entity, &forward.source_zone)? else {
        return Ok(None);
    };
    let dest = match &forward.dest_zone {
        Some(name) => match zones.lookup(&entity, name)? {
            Some(zone) => Some(zone),
            None => return Ok(None),
        },
        None => None,
    };

    Ok(Some(ForwardPlan {
        forward,
        external_port,
        external_addr,
        dest_ip,
        dest_port,
        source,
        dest,
    }))
}

fn compile_forwards(snapshot: &PolicySnapshot, zones: &ZoneTable<'_>, out: &mut Compilation) {
    let mut forwards: Vec<&PortForward> = snapshot.port_forwards.iter().filter(|f| f.enabled).collect();
    forwards.sort_by_key(|f| f.id);
    let mut accepted: Vec<ForwardPlan<'_>> = Vec::new();

    for forward in forwards {
        let entity = EntityRef::PortForward(forward.id);
        let plan = match plan_forward(forward, zones) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                out.warnings
                    .push(format!("{entity} skipped: its zone is disabled"));
                continue;
            }
            Err(e) => {
                out.reject(entity, e);
                continue;
            }
        };

        if let Some(existing) = accepted.iter().find(|a| {
            a.forward.protocol.overlaps(plan.forward.protocol)
                && a.external_port.overlaps(&plan.external_port)
                && (a.external_addr.is_none()
                    || plan.external_addr.is_none()
                    || a.external_addr == plan.external_addr)
        }) {
            out.reject(
                entity,
                Error::validation(
                    entity,
                    format!(
                        "external port {} conflicts with {}",
                        plan.external_port,
                        EntityRef::PortForward(existing.forward.id)
                    ),
                ),
            );
            continue;
        }

        let accept_port = if plan.dest_port.is_any() {
            plan.external_port.clone()
        } else {
            plan.dest_port.clone()
        };
        out.directives.push(Directive::new(
            entity,
            Scope::Forwards,
            DirectiveKind::Dnat {
                interfaces: plan.source.interfaces.clone(),
                protocol: forward.protocol,
                external_port: plan.external_port.clone(),
                external_addr: plan.external_addr,
                dest_ip: plan.dest_ip,
                dest_port: plan.dest_port.clone(),
            },
        ));
        out.directives.push(Directive::new(
            entity,
            Scope::Forwards,
            DirectiveKind::ForwardAccept {
                interfaces: plan.dest.map(|z| z.interfaces.clone()).unwrap_or_default(),
                protocol: forward.protocol,
                dest_ip: plan.dest_ip,
                dest_port: accept_port,
            },
        ));
        accepted.push(plan);
    }
}

fn compile_rule(rule: &Rule, zone: &Zone, sets: &SetTable) -> Result<DirectiveKind> {
    let entity = EntityRef::Rule(rule.id);
    let source: AddrSpec = rule
        .source
        .parse()
        .map_err(|e| field_error(&entity, "source", e))?;
    let destination: AddrSpec = rule
        .destination
        .parse()
        .map_err(|e| field_error(&entity, "destination", e))?;
    let src_port = parse_ports(&entity, "src_port", &rule.src_port)?;
    let dst_port = parse_ports(&entity, "dst_port", &rule.dst_port)?;

    if !rule.protocol.carries_ports() && (!src_port.is_any() || !dst_port.is_any()) {
        return Err(Error::validation(
            entity,
            format!("ports require tcp, udp or tcp+udp (protocol is {})", rule.protocol),
        ));
    }

    let source = sets.resolve(&entity, source)?;
    let destination = sets.resolve(&entity, destination)?;
    if let (Some(a), Some(b)) = (source.family(), destination.family())
        && a != b
    {
        return Err(Error::validation(
            entity,
            "source and destination are different address families",
        ));
    }

    let log_prefix = rule.log.then(|| {
        validators::log_prefix(&[
            crate::core::directive::TAG_PREFIX,
            &zone.name,
            &format!("r{}", rule.id),
        ])
    });

    Ok(DirectiveKind::Match {
        interfaces: zone.interfaces.clone(),
        criteria: MatchCriteria {
            source,
            destination,
            protocol: rule.protocol,
            src_port,
            dst_port,
        },
        log_prefix,
        action: rule.action,
    })
}

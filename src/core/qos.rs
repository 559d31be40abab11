//! QoS shaper: hierarchical bandwidth classes on HTB
//!
//! Each enabled [`QosConfig`] yields one tree per shaped device:
//!
//! - egress on `interface`, sized by `upload_bandwidth`
//! - ingress on `ingress_device` (an IFB device) when configured, sized by
//!   `download_bandwidth`
//!
//! Tree layout:
//!
//! ```text
//! 1:    htb root qdisc, default → default class
//! 1:1   aggregate node (hierarchical configs only), rate = ceil = total
//! 1:1N  one node per class, N = 0.. in class priority order
//! ```
//!
//! Classification uses `flower` filters (or `matchall` for rules with no
//! criteria), one per rule per tree in rule priority order.

use crate::core::compiler::{Compilation, EntityError};
use crate::core::directive::{ClassId, ClassifyMatch, Directive, DirectiveKind, Scope};
use crate::core::error::{Error, Result};
use crate::core::model::{Direction, EntityRef, PolicySnapshot, Protocol, QosClass, QosConfig, QosRule};
use crate::core::spec::{AddrSpec, Family, PortSpec};
use crate::validators;
use std::collections::HashSet;

/// Named DSCP codepoints
pub const DSCP_CLASSES: [(&str, u8); 21] = [
    ("CS0", 0x00),
    ("CS1", 0x08),
    ("AF11", 0x0A),
    ("AF12", 0x0C),
    ("AF13", 0x0E),
    ("CS2", 0x10),
    ("AF21", 0x12),
    ("AF22", 0x14),
    ("AF23", 0x16),
    ("CS3", 0x18),
    ("AF31", 0x1A),
    ("AF32", 0x1C),
    ("AF33", 0x1E),
    ("CS4", 0x20),
    ("AF41", 0x22),
    ("AF42", 0x24),
    ("AF43", 0x26),
    ("CS5", 0x28),
    ("EF", 0x2E),
    ("CS6", 0x30),
    ("CS7", 0x38),
];

/// First class node minor id
const CLASS_MINOR_BASE: u16 = 10;
const AGGREGATE: ClassId = ClassId { major: 1, minor: 1 };

/// Parses a DSCP class name (`EF`, `af41`) or a numeric codepoint (`46`, `0x2e`).
///
/// # Errors
///
/// Returns `Err` for unknown names and values above 63.
pub fn parse_dscp(input: &str) -> std::result::Result<u8, String> {
    let trimmed = input.trim();
    if let Some((_, value)) = DSCP_CLASSES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(trimmed))
    {
        return Ok(*value);
    }
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => trimmed.parse::<u8>().ok(),
    };
    match parsed {
        Some(v) if v <= 63 => Ok(v),
        _ => Err(format!("unknown DSCP value '{trimmed}'")),
    }
}

/// Guaranteed and ceiling rates in kbit for a class on a tree of `total_kbit`
pub fn class_rates(total_kbit: u32, min_pct: u8, max_pct: u8) -> (u32, u32) {
    let share = |pct: u8| ((u64::from(total_kbit) * u64::from(pct)) / 100).max(1) as u32;
    let guaranteed = share(min_pct);
    (guaranteed, share(max_pct).max(guaranteed))
}

fn validate_class(class: &QosClass) -> Result<()> {
    let entity = EntityRef::QosClass(class.id);
    if !(1..=7).contains(&class.priority) {
        return Err(Error::validation(
            entity,
            format!("class '{}': priority must be 1-7", class.name),
        ));
    }
    if class.min_bandwidth > 100 || class.max_bandwidth > 100 {
        return Err(Error::validation(
            entity,
            format!("class '{}': bandwidth percentages must be 0-100", class.name),
        ));
    }
    if class.min_bandwidth > class.max_bandwidth {
        return Err(Error::validation(
            entity,
            format!(
                "class '{}': min_bandwidth {}% exceeds max_bandwidth {}%",
                class.name, class.min_bandwidth, class.max_bandwidth
            ),
        ));
    }
    Ok(())
}

/// One shaped device of a config
struct Tree {
    device: String,
    total_kbit: u32,
    ingress: bool,
}

fn validate_config(config: &QosConfig) -> Result<Vec<Tree>> {
    let entity = EntityRef::QosConfig(config.id);
    validators::validate_interface(&config.interface).map_err(|e| Error::validation(entity, e))?;

    let mut trees = Vec::new();
    if config.upload_bandwidth > 0 {
        trees.push(Tree {
            device: config.interface.clone(),
            total_kbit: config.upload_bandwidth,
            ingress: false,
        });
    }
    if let Some(ifb) = &config.ingress_device {
        validators::validate_interface(ifb).map_err(|e| Error::validation(entity, e))?;
        if ifb == &config.interface {
            return Err(Error::validation(entity, "ingress_device must differ from interface"));
        }
        if config.download_bandwidth > 0 {
            trees.push(Tree {
                device: ifb.clone(),
                total_kbit: config.download_bandwidth,
                ingress: true,
            });
        }
    }
    if trees.is_empty() {
        return Err(Error::validation(entity, "no bandwidth configured"));
    }
    Ok(trees)
}

/// Compiles every enabled QoS configuration, in id order.
pub fn compile_shapers(snapshot: &PolicySnapshot) -> Compilation {
    let mut out = Compilation::default();
    let mut configs: Vec<&QosConfig> = snapshot.qos_configs.iter().filter(|c| c.enabled).collect();
    configs.sort_by_key(|c| c.id);

    let mut devices: HashSet<String> = HashSet::new();
    for config in configs {
        let claimed: Vec<String> = std::iter::once(config.interface.clone())
            .chain(config.ingress_device.clone())
            .collect();
        if let Some(dup) = claimed.iter().find(|d| devices.contains(*d)) {
            let entity = EntityRef::QosConfig(config.id);
            out.errors.push(EntityError {
                entity,
                error: Error::validation(entity, format!("device '{dup}' is already shaped")),
            });
            continue;
        }
        devices.extend(claimed);
        let shaped = shape(snapshot, config);
        out.directives.extend(shaped.directives);
        out.errors.extend(shaped.errors);
        out.warnings.extend(shaped.warnings);
    }
    out
}

/// Compiles one QoS configuration into its shaper trees.
pub fn shape(snapshot: &PolicySnapshot, config: &QosConfig) -> Compilation {
    let mut out = Compilation::default();
    let config_ref = EntityRef::QosConfig(config.id);

    let trees = match validate_config(config) {
        Ok(trees) => trees,
        Err(error) => {
            out.errors.push(EntityError {
                entity: config_ref,
                error,
            });
            return out;
        }
    };

    let mut classes: Vec<&QosClass> = snapshot
        .qos_classes
        .iter()
        .filter(|c| c.config_id == config.id)
        .collect();
    classes.sort_by_key(|c| (c.priority, c.id));

    let mut valid: Vec<&QosClass> = Vec::new();
    for class in classes.iter().copied() {
        let entity = EntityRef::QosClass(class.id);
        let result = if valid.iter().any(|v| v.name == class.name) {
            Err(Error::validation(
                entity,
                format!("duplicate class name '{}'", class.name),
            ))
        } else {
            validate_class(class)
        };
        match result {
            Ok(()) => valid.push(class),
            Err(error) => out.errors.push(EntityError { entity, error }),
        }
    }

    let Some(default_pos) = valid.iter().position(|c| c.name == config.default_class) else {
        out.errors.push(EntityError {
            entity: config_ref,
            error: Error::validation(
                config_ref,
                format!(
                    "default class '{}' is missing or invalid",
                    config.default_class
                ),
            ),
        });
        return out;
    };

    let min_total: u32 = valid.iter().map(|c| u32::from(c.min_bandwidth)).sum();
    if min_total > 100 {
        out.warnings.push(format!(
            "{config_ref} ({}): guaranteed bandwidth totals {min_total}% (over 100%)",
            config.interface
        ));
    }

    let class_id = |pos: usize| ClassId::new(CLASS_MINOR_BASE + pos as u16);

    for tree in &trees {
        let scope = Scope::Shaper(tree.device.clone());
        out.directives.push(Directive::new(
            config_ref,
            scope.clone(),
            DirectiveKind::RootDiscipline {
                device: tree.device.clone(),
                total_kbit: tree.total_kbit,
                default_class: class_id(default_pos),
            },
        ));
        let parent = if config.hierarchical {
            out.directives.push(Directive::new(
                config_ref,
                scope.clone(),
                DirectiveKind::ClassNode {
                    device: tree.device.clone(),
                    name: "total".into(),
                    parent: ClassId::ROOT,
                    classid: AGGREGATE,
                    guaranteed_kbit: tree.total_kbit,
                    ceiling_kbit: tree.total_kbit,
                    priority: 0,
                },
            ));
            AGGREGATE
        } else {
            ClassId::ROOT
        };

        for (pos, class) in valid.iter().enumerate() {
            let (guaranteed_kbit, ceiling_kbit) =
                class_rates(tree.total_kbit, class.min_bandwidth, class.max_bandwidth);
            out.directives.push(Directive::new(
                EntityRef::QosClass(class.id),
                scope.clone(),
                DirectiveKind::ClassNode {
                    device: tree.device.clone(),
                    name: class.name.clone(),
                    parent,
                    classid: class_id(pos),
                    guaranteed_kbit,
                    ceiling_kbit,
                    priority: class.priority - 1,
                },
            ));
        }
    }

    let mut rules: Vec<(&QosRule, usize)> = Vec::new();
    for rule in snapshot.qos_rules.iter().filter(|r| r.enabled) {
        if let Some(pos) = valid.iter().position(|c| c.id == rule.class_id) {
            rules.push((rule, pos));
        } else if let Some(class) = classes.iter().find(|c| c.id == rule.class_id) {
            let entity = EntityRef::QosRule(rule.id);
            out.errors.push(EntityError {
                entity,
                error: Error::compilation(
                    entity,
                    format!("class '{}' failed validation", class.name),
                ),
            });
        }
    }
    rules.sort_by_key(|(r, pos)| (r.priority, valid[*pos].priority, r.id));

    let mut prefs = vec![0u32; trees.len()];
    for (rule, pos) in rules {
        let entity = EntityRef::QosRule(rule.id);
        let matches = match classify_matches(rule) {
            Ok(m) => m,
            Err(error) => {
                out.errors.push(EntityError { entity, error });
                continue;
            }
        };
        let targets: Vec<usize> = trees
            .iter()
            .enumerate()
            .filter(|(_, t)| match rule.direction {
                Direction::Out => !t.ingress,
                Direction::In => t.ingress,
                Direction::Both => true,
            })
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            out.errors.push(EntityError {
                entity,
                error: Error::validation(
                    entity,
                    format!("no {} shaper tree on {}", rule.direction, config.interface),
                ),
            });
            continue;
        }

        let class = valid[pos];
        for tree_idx in targets {
            let tree = &trees[tree_idx];
            for criteria in &matches {
                prefs[tree_idx] += 1;
                out.directives.push(Directive::new(
                    entity,
                    Scope::Shaper(tree.device.clone()),
                    DirectiveKind::Classify {
                        device: tree.device.clone(),
                        pref: prefs[tree_idx],
                        criteria: criteria.clone(),
                        target: class_id(pos),
                        target_name: class.name.clone(),
                    },
                ));
            }
        }
    }

    out
}

/// Expands one rule into the concrete filters needed to express it
fn classify_matches(rule: &QosRule) -> Result<Vec<ClassifyMatch>> {
    let entity = EntityRef::QosRule(rule.id);
    let net = |field: &str, raw: &str| -> Result<Option<ipnetwork::IpNetwork>> {
        match raw.parse::<AddrSpec>() {
            Ok(AddrSpec::Any) => Ok(None),
            Ok(AddrSpec::Net(net)) => Ok(Some(net)),
            Ok(AddrSpec::Set(_)) => Err(Error::validation(
                entity,
                format!("{field}: ipset references are not supported for classification"),
            )),
            Err(Error::Validation { message, .. }) => {
                Err(Error::validation(entity, format!("{field}: {message}")))
            }
            Err(e) => Err(e),
        }
    };
    let ports = |field: &str, raw: &str| -> Result<PortSpec> {
        let spec: PortSpec = raw.parse().map_err(|e| match e {
            Error::Validation { message, .. } => {
                Error::validation(entity, format!("{field}: {message}"))
            }
            other => other,
        })?;
        if matches!(spec, PortSpec::List(_)) {
            return Err(Error::validation(
                entity,
                format!("{field}: port lists are not supported for classification"),
            ));
        }
        Ok(spec)
    };

    let source = net("source", &rule.source)?;
    let destination = net("destination", &rule.destination)?;
    let src_port = ports("src_port", &rule.src_port)?;
    let dst_port = ports("dst_port", &rule.dst_port)?;
    let has_ports = !src_port.is_any() || !dst_port.is_any();
    if has_ports && !rule.protocol.carries_ports() {
        return Err(Error::validation(
            entity,
            format!("ports require tcp, udp or tcp+udp (protocol is {})", rule.protocol),
        ));
    }
    let dscp = match &rule.dscp {
        Some(raw) if !raw.trim().is_empty() => {
            Some(parse_dscp(raw).map_err(|e| Error::validation(entity, e))?)
        }
        _ => None,
    };

    let family = match (source.map(|n| Family::of(&n)), destination.map(|n| Family::of(&n))) {
        (Some(a), Some(b)) if a != b => {
            return Err(Error::validation(
                entity,
                "source and destination are different address families",
            ));
        }
        (a, b) => a.or(b),
    };

    let empty = source.is_none()
        && destination.is_none()
        && !has_ports
        && dscp.is_none()
        && rule.protocol == Protocol::All;
    if empty {
        return Ok(vec![ClassifyMatch {
            family: None,
            protocol: Protocol::All,
            source: None,
            destination: None,
            src_port,
            dst_port,
            dscp: None,
        }]);
    }

    let families = match family {
        Some(f) => vec![f],
        None => vec![Family::V4, Family::V6],
    };
    let protocols = match rule.protocol {
        Protocol::TcpUdp if has_ports => vec![Protocol::Tcp, Protocol::Udp],
        other => vec![other],
    };

    let mut matches = Vec::new();
    for family in families {
        for protocol in &protocols {
            matches.push(ClassifyMatch {
                family: Some(family),
                protocol: *protocol,
                source,
                destination,
                src_port: src_port.clone(),
                dst_port: dst_port.clone(),
                dscp,
            });
        }
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{qos_class, qos_config, qos_rule};

    fn snapshot() -> PolicySnapshot {
        let mut s = PolicySnapshot::default();
        s.qos_configs.push(qos_config(1, "eth0", 10_000, "bulk"));
        s.qos_classes.push(qos_class(10, 1, "voip", 1, 30, 100));
        s.qos_classes.push(qos_class(11, 1, "bulk", 5, 20, 80));
        s
    }

    #[test]
    fn test_dscp_names_and_numbers() {
        assert_eq!(parse_dscp("EF"), Ok(46));
        assert_eq!(parse_dscp("af41"), Ok(34));
        assert_eq!(parse_dscp("0x2e"), Ok(46));
        assert_eq!(parse_dscp("10"), Ok(10));
        assert!(parse_dscp("64").is_err());
        assert!(parse_dscp("gold").is_err());
    }

    #[test]
    fn test_class_rates() {
        assert_eq!(class_rates(10_000, 30, 100), (3000, 10_000));
        assert_eq!(class_rates(100, 0, 0), (1, 1));
    }

    #[test]
    fn test_tree_shape_hierarchical() {
        let out = shape(&snapshot(), &snapshot().qos_configs[0]);
        assert!(out.errors.is_empty(), "{:?}", out.errors);
        let text: Vec<String> = out.directives.iter().map(ToString::to_string).collect();
        assert_eq!(
            text,
            vec![
                "RootDiscipline(eth0, 10000kbit)",
                "ClassNode(total, guaranteed=10000kbit, ceiling=10000kbit, prio=0)",
                "ClassNode(voip, guaranteed=3000kbit, ceiling=10000kbit, prio=0)",
                "ClassNode(bulk, guaranteed=2000kbit, ceiling=8000kbit, prio=4)",
            ]
        );
        let root = out.directives[0].invocation("").script_line();
        assert_eq!(root, "qdisc replace dev eth0 root handle 1: htb default 11");
    }

    #[test]
    fn test_flat_tree_parents_on_root() {
        let mut s = snapshot();
        s.qos_configs[0].hierarchical = false;
        let out = shape(&s, &s.qos_configs[0]);
        assert_eq!(out.directives.len(), 3);
        assert!(
            out.directives[1]
                .invocation("")
                .script_line()
                .contains("parent 1: classid 1:10")
        );
    }

    #[test]
    fn test_min_over_max_names_class() {
        let mut s = snapshot();
        s.qos_classes.push(qos_class(12, 1, "broken", 3, 60, 40));
        let out = shape(&s, &s.qos_configs[0]);
        let err = out.error_for(&EntityRef::QosClass(12)).unwrap();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("broken"));
        assert!(out.directives.iter().all(|d| d.owner != EntityRef::QosClass(12)));
    }

    #[test]
    fn test_rules_of_invalid_class_are_reported() {
        let mut s = snapshot();
        s.qos_classes.push(qos_class(12, 1, "broken", 3, 60, 40));
        s.qos_rules.push(qos_rule(20, 12, 0));
        s.qos_rules.push(qos_rule(21, 10, 0));
        // belongs to another configuration's class
        s.qos_rules.push(qos_rule(22, 99, 0));
        let out = shape(&s, &s.qos_configs[0]);

        let err = out.error_for(&EntityRef::QosRule(20)).unwrap();
        assert!(matches!(err, Error::Compilation { .. }));
        assert!(err.to_string().contains("broken"));
        assert!(out.directives.iter().all(|d| d.owner != EntityRef::QosRule(20)));
        assert!(out.error_for(&EntityRef::QosRule(21)).is_none());
        assert!(out.directives.iter().any(|d| d.owner == EntityRef::QosRule(21)));
        assert!(out.error_for(&EntityRef::QosRule(22)).is_none());
    }

    #[test]
    fn test_oversubscription_is_warning() {
        let mut s = snapshot();
        s.qos_classes.push(qos_class(12, 1, "games", 2, 60, 100));
        let out = shape(&s, &s.qos_configs[0]);
        assert!(out.errors.is_empty());
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("110%"));
    }

    #[test]
    fn test_missing_default_class() {
        let mut s = snapshot();
        s.qos_configs[0].default_class = "nope".into();
        let out = shape(&s, &s.qos_configs[0]);
        assert!(out.directives.is_empty());
        assert!(out.error_for(&EntityRef::QosConfig(1)).is_some());
    }

    #[test]
    fn test_classify_order_and_expansion() {
        let mut s = snapshot();
        let mut sip = qos_rule(20, 10, 5);
        sip.protocol = Protocol::Udp;
        sip.dst_port = "5060".into();
        sip.source = "192.168.1.0/24".into();
        s.qos_rules.push(sip);
        let mut ef = qos_rule(21, 10, 1);
        ef.dscp = Some("EF".into());
        s.qos_rules.push(ef);
        let mut web = qos_rule(22, 11, 5);
        web.protocol = Protocol::TcpUdp;
        web.dst_port = "443".into();
        web.source = "10.0.0.0/8".into();
        s.qos_rules.push(web);

        let out = shape(&s, &s.qos_configs[0]);
        assert!(out.errors.is_empty(), "{:?}", out.errors);
        let filters: Vec<(EntityRef, u32)> = out
            .directives
            .iter()
            .filter_map(|d| match &d.kind {
                DirectiveKind::Classify { pref, .. } => Some((d.owner, *pref)),
                _ => None,
            })
            .collect();
        // dscp-only rule matches both families; tcp+udp with ports splits per protocol
        assert_eq!(
            filters,
            vec![
                (EntityRef::QosRule(21), 1),
                (EntityRef::QosRule(21), 2),
                (EntityRef::QosRule(20), 3),
                (EntityRef::QosRule(22), 4),
                (EntityRef::QosRule(22), 5),
            ]
        );
    }

    #[test]
    fn test_ingress_direction_needs_ifb() {
        let mut s = snapshot();
        let mut inbound = qos_rule(20, 10, 1);
        inbound.direction = Direction::In;
        s.qos_rules.push(inbound);
        let out = shape(&s, &s.qos_configs[0]);
        assert!(out.error_for(&EntityRef::QosRule(20)).is_some());

        s.qos_configs[0].ingress_device = Some("ifb0".into());
        s.qos_configs[0].download_bandwidth = 50_000;
        let out = shape(&s, &s.qos_configs[0]);
        assert!(out.errors.is_empty());
        assert!(out.directives.iter().any(|d| matches!(
            &d.kind,
            DirectiveKind::Classify { device, .. } if device == "ifb0"
        )));
        assert!(out.directives.iter().any(|d| d.to_string() == "RootDiscipline(ifb0, 50000kbit)"));
    }

    #[test]
    fn test_port_lists_rejected() {
        let mut s = snapshot();
        let mut r = qos_rule(20, 10, 1);
        r.protocol = Protocol::Tcp;
        r.dst_port = "80,443".into();
        s.qos_rules.push(r);
        let out = shape(&s, &s.qos_configs[0]);
        assert!(
            out.error_for(&EntityRef::QosRule(20))
                .unwrap()
                .to_string()
                .contains("port lists")
        );
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let mut s = snapshot();
        s.qos_configs.push(qos_config(2, "eth0", 5_000, "bulk"));
        let out = compile_shapers(&s);
        assert!(out.error_for(&EntityRef::QosConfig(2)).is_some());
    }
}

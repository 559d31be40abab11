//! Directives: the imperative output of the compilers
//!
//! A [`Directive`] is one step against the enforcement facility: one nft rule,
//! set or element, or one tc qdisc/class/filter. Each directive renders to
//! exactly one argument vector ([`Invocation`]); nothing is ever joined into a
//! shell string.
//!
//! Packet-filter directives live in one managed `inet` table. The chain
//! layout is fixed and created by [`namespace_setup`]:
//!
//! ```text
//! input   (filter hook)  invalid drop, established accept, lo accept, jump zones
//! forward (filter hook)  invalid drop, jump clamp, established accept, jump forwards, jump zones
//! prerouting  (nat)      DNAT directives
//! postrouting (nat)      Masquerade directives
//! clamp                  MSS clamping per zone
//! forwards               ForwardAccept directives (evaluated before any zone catch-all)
//! zones                  rule matches and zone catch-alls, in compiled order
//! ```
//!
//! Every rule carries `comment "zonefw:<kind>:<id>"` so live state can be
//! attributed back to the entity that produced it.

use crate::core::model::{EntityRef, Protocol, Verdict};
use crate::core::spec::{Family, PortSpec, network_to_nft};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;

/// Prefix of every comment tag written into the managed table
pub const TAG_PREFIX: &str = "zonefw";

pub const CHAIN_PREROUTING: &str = "prerouting";
pub const CHAIN_POSTROUTING: &str = "postrouting";
pub const CHAIN_CLAMP: &str = "clamp";
pub const CHAIN_FORWARDS: &str = "forwards";
pub const CHAIN_ZONES: &str = "zones";

/// Comment tag attributing a live object to an entity
pub fn entity_tag(entity: &EntityRef) -> String {
    format!("{TAG_PREFIX}:{}:{}", entity.kind(), entity.id())
}

/// Inverse of [`entity_tag`]
pub fn parse_entity_tag(comment: &str) -> Option<EntityRef> {
    let rest = comment.trim().strip_prefix(TAG_PREFIX)?.strip_prefix(':')?;
    rest.parse().ok()
}

/// Which external program executes an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum Program {
    #[strum(serialize = "nft")]
    #[serde(rename = "nft")]
    Nft,
    #[strum(serialize = "tc")]
    #[serde(rename = "tc")]
    Tc,
}

/// One argument-vector command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Invocation {
    pub program: Program,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn nft<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: Program::Nft,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tc<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: Program::Tc,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Arguments without output-control flags, as a script line
    pub fn script_line(&self) -> String {
        self.args
            .iter()
            .filter(|a| !a.starts_with("--"))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Grouping used for locking and for insertion ordering
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    Sets,
    Forwards,
    Zone(String),
    Shaper(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Sets => write!(f, "sets"),
            Scope::Forwards => write!(f, "forwards"),
            Scope::Zone(name) => write!(f, "{name}"),
            Scope::Shaper(device) => write!(f, "{device}"),
        }
    }
}

/// Resolved address match
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrMatch {
    Any,
    Net(IpNetwork),
    Set {
        name: String,
        family: SetFamily,
        with_port: bool,
    },
}

impl AddrMatch {
    pub fn family(&self) -> Option<Family> {
        match self {
            AddrMatch::Any => None,
            AddrMatch::Net(net) => Some(Family::of(net)),
            AddrMatch::Set { family, .. } => Some(family.family()),
        }
    }
}

impl fmt::Display for AddrMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrMatch::Any => write!(f, "any"),
            AddrMatch::Net(net) => write!(f, "{}", network_to_nft(net)),
            AddrMatch::Set { name, .. } => write!(f, "@{name}"),
        }
    }
}

/// Address family of an ipset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetFamily {
    V4,
    V6,
}

impl SetFamily {
    pub const fn family(self) -> Family {
        match self {
            SetFamily::V4 => Family::V4,
            SetFamily::V6 => Family::V6,
        }
    }

    const fn addr_type(self) -> &'static str {
        match self {
            SetFamily::V4 => "ipv4_addr",
            SetFamily::V6 => "ipv6_addr",
        }
    }
}

/// Packet criteria shared by filter rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchCriteria {
    pub source: AddrMatch,
    pub destination: AddrMatch,
    pub protocol: Protocol,
    pub src_port: PortSpec,
    pub dst_port: PortSpec,
}

impl MatchCriteria {
    pub fn family(&self) -> Option<Family> {
        self.source.family().or_else(|| self.destination.family())
    }
}

/// HTB class handle `major:minor`; minor 0 renders as the qdisc handle `1:`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId {
    pub major: u16,
    pub minor: u16,
}

impl ClassId {
    pub const ROOT: ClassId = ClassId { major: 1, minor: 0 };

    pub const fn new(minor: u16) -> Self {
        Self { major: 1, minor }
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{}:", self.major)
        } else {
            write!(f, "{}:{}", self.major, self.minor)
        }
    }
}

/// Traffic-control classifier match (tc flower)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassifyMatch {
    /// `None` matches every ethertype with a matchall filter
    pub family: Option<Family>,
    pub protocol: Protocol,
    pub source: Option<IpNetwork>,
    pub destination: Option<IpNetwork>,
    pub src_port: PortSpec,
    pub dst_port: PortSpec,
    /// DSCP codepoint, 0-63
    pub dscp: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectiveKind {
    CreateSet {
        name: String,
        family: SetFamily,
        with_port: bool,
        interval: bool,
    },
    AddMember {
        set: String,
        element: String,
    },
    Dnat {
        interfaces: Vec<String>,
        protocol: Protocol,
        external_port: PortSpec,
        external_addr: Option<IpNetwork>,
        dest_ip: IpAddr,
        dest_port: PortSpec,
    },
    ForwardAccept {
        interfaces: Vec<String>,
        protocol: Protocol,
        dest_ip: IpAddr,
        dest_port: PortSpec,
    },
    Match {
        interfaces: Vec<String>,
        criteria: MatchCriteria,
        log_prefix: Option<String>,
        action: Verdict,
    },
    Masquerade {
        interfaces: Vec<String>,
    },
    MssClamp {
        interfaces: Vec<String>,
    },
    DefaultPolicy {
        interfaces: Vec<String>,
        verdict: Verdict,
    },
    RootDiscipline {
        device: String,
        total_kbit: u32,
        default_class: ClassId,
    },
    ClassNode {
        device: String,
        name: String,
        parent: ClassId,
        classid: ClassId,
        guaranteed_kbit: u32,
        ceiling_kbit: u32,
        /// HTB prio, 0 (highest) to 7
        priority: u8,
    },
    Classify {
        device: String,
        pref: u32,
        criteria: ClassifyMatch,
        target: ClassId,
        target_name: String,
    },
}

/// One compiled step, owned by the entity that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Directive {
    pub owner: EntityRef,
    pub scope: Scope,
    pub kind: DirectiveKind,
}

fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

/// `iifname "eth0"` or `iifname { "eth0", "eth1" }`
fn interface_match(keyword: &str, interfaces: &[String], out: &mut Vec<String>) {
    match interfaces {
        [] => {}
        [single] => {
            out.push(keyword.to_string());
            out.push(quoted(single));
        }
        many => {
            out.push(keyword.to_string());
            let joined: Vec<String> = many.iter().map(|i| quoted(i)).collect();
            out.push(format!("{{ {} }}", joined.join(", ")));
        }
    }
}

/// Protocol selector plus optional port matches
fn l4_match(
    protocol: Protocol,
    family: Option<Family>,
    src_port: &PortSpec,
    dst_port: &PortSpec,
    out: &mut Vec<String>,
) {
    let has_ports = !src_port.is_any() || !dst_port.is_any();
    let ports = |prefix: &str, out: &mut Vec<String>| {
        if !src_port.is_any() {
            out.extend([prefix.to_string(), "sport".into(), src_port.to_nft()]);
        }
        if !dst_port.is_any() {
            out.extend([prefix.to_string(), "dport".into(), dst_port.to_nft()]);
        }
    };
    match protocol {
        Protocol::All => {}
        Protocol::Tcp | Protocol::Udp if has_ports => ports(protocol.as_ref(), out),
        Protocol::Tcp | Protocol::Udp => {
            out.extend(["meta".into(), "l4proto".into(), protocol.to_string()]);
        }
        Protocol::TcpUdp => {
            out.extend(["meta".into(), "l4proto".into(), "{ tcp, udp }".into()]);
            ports("th", out);
        }
        Protocol::Icmp => {
            let proto = match family {
                Some(Family::V4) => "icmp",
                Some(Family::V6) => "ipv6-icmp",
                None => "{ icmp, ipv6-icmp }",
            };
            out.extend(["meta".into(), "l4proto".into(), proto.into()]);
        }
    }
}

fn addr_match(direction: &str, addr: &AddrMatch, out: &mut Vec<String>) {
    let (addr_key, port_key) = if direction == "s" {
        ("saddr", "sport")
    } else {
        ("daddr", "dport")
    };
    match addr {
        AddrMatch::Any => {}
        AddrMatch::Net(net) => out.extend([
            Family::of(net).nft_keyword().to_string(),
            addr_key.to_string(),
            network_to_nft(net),
        ]),
        AddrMatch::Set {
            name,
            family,
            with_port,
        } => {
            out.extend([family.family().nft_keyword().to_string(), addr_key.to_string()]);
            if *with_port {
                out.extend([
                    ".".into(),
                    "meta".into(),
                    "l4proto".into(),
                    ".".into(),
                    "th".into(),
                    port_key.into(),
                ]);
            }
            out.push(format!("@{name}"));
        }
    }
}

fn family_of_ip(ip: &IpAddr) -> Family {
    match ip {
        IpAddr::V4(_) => Family::V4,
        IpAddr::V6(_) => Family::V6,
    }
}

fn title(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Accept => "Accept",
        Verdict::Drop => "Drop",
        Verdict::Reject => "Reject",
    }
}

impl Directive {
    pub fn new(owner: EntityRef, scope: Scope, kind: DirectiveKind) -> Self {
        Self { owner, scope, kind }
    }

    pub const fn program(&self) -> Program {
        match self.kind {
            DirectiveKind::RootDiscipline { .. }
            | DirectiveKind::ClassNode { .. }
            | DirectiveKind::Classify { .. } => Program::Tc,
            _ => Program::Nft,
        }
    }

    /// Chain an nft rule directive lives in; `None` for sets, elements and tc objects
    pub const fn chain(&self) -> Option<&'static str> {
        match self.kind {
            DirectiveKind::Dnat { .. } => Some(CHAIN_PREROUTING),
            DirectiveKind::ForwardAccept { .. } => Some(CHAIN_FORWARDS),
            DirectiveKind::Match { .. } | DirectiveKind::DefaultPolicy { .. } => Some(CHAIN_ZONES),
            DirectiveKind::Masquerade { .. } => Some(CHAIN_POSTROUTING),
            DirectiveKind::MssClamp { .. } => Some(CHAIN_CLAMP),
            _ => None,
        }
    }

    /// Shaped device of a tc directive
    pub fn device(&self) -> Option<&str> {
        match &self.kind {
            DirectiveKind::RootDiscipline { device, .. }
            | DirectiveKind::ClassNode { device, .. }
            | DirectiveKind::Classify { device, .. } => Some(device),
            _ => None,
        }
    }

    /// Ipsets a rule directive matches against
    pub fn referenced_sets(&self) -> Vec<&str> {
        let DirectiveKind::Match { criteria, .. } = &self.kind else {
            return Vec::new();
        };
        [&criteria.source, &criteria.destination]
            .into_iter()
            .filter_map(|addr| match addr {
                AddrMatch::Set { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Rule expression for nft rule directives, ending with the entity tag comment
    pub fn rule_body(&self) -> Option<Vec<String>> {
        let mut out = Vec::new();
        match &self.kind {
            DirectiveKind::Dnat {
                interfaces,
                protocol,
                external_port,
                external_addr,
                dest_ip,
                dest_port,
            } => {
                let family = family_of_ip(dest_ip);
                interface_match("iifname", interfaces, &mut out);
                if let Some(addr) = external_addr {
                    out.extend([
                        family.nft_keyword().to_string(),
                        "daddr".into(),
                        network_to_nft(addr),
                    ]);
                }
                l4_match(*protocol, Some(family), &PortSpec::Any, external_port, &mut out);
                let target = match (family, dest_port) {
                    (_, PortSpec::Any) => dest_ip.to_string(),
                    (Family::V4, port) => format!("{dest_ip}:{}", port),
                    (Family::V6, port) => format!("[{dest_ip}]:{}", port),
                };
                out.extend([
                    "dnat".into(),
                    family.nft_keyword().to_string(),
                    "to".into(),
                    target,
                ]);
            }
            DirectiveKind::ForwardAccept {
                interfaces,
                protocol,
                dest_ip,
                dest_port,
            } => {
                let family = family_of_ip(dest_ip);
                interface_match("oifname", interfaces, &mut out);
                out.extend([
                    family.nft_keyword().to_string(),
                    "daddr".into(),
                    dest_ip.to_string(),
                ]);
                l4_match(*protocol, Some(family), &PortSpec::Any, dest_port, &mut out);
                out.push("accept".into());
            }
            DirectiveKind::Match {
                interfaces,
                criteria,
                log_prefix,
                action,
            } => {
                interface_match("iifname", interfaces, &mut out);
                addr_match("s", &criteria.source, &mut out);
                addr_match("d", &criteria.destination, &mut out);
                l4_match(
                    criteria.protocol,
                    criteria.family(),
                    &criteria.src_port,
                    &criteria.dst_port,
                    &mut out,
                );
                if let Some(prefix) = log_prefix {
                    out.extend(["log".into(), "prefix".into(), quoted(prefix)]);
                }
                out.push(action.to_string());
            }
            DirectiveKind::Masquerade { interfaces } => {
                interface_match("oifname", interfaces, &mut out);
                out.push("masquerade".into());
            }
            DirectiveKind::MssClamp { interfaces } => {
                interface_match("oifname", interfaces, &mut out);
                out.extend(
                    ["tcp", "flags", "syn", "tcp", "option", "maxseg", "size", "set", "rt", "mtu"]
                        .map(String::from),
                );
            }
            DirectiveKind::DefaultPolicy {
                interfaces,
                verdict,
            } => {
                interface_match("iifname", interfaces, &mut out);
                out.push(verdict.to_string());
            }
            _ => return None,
        }
        out.extend(["comment".into(), quoted(&entity_tag(&self.owner))]);
        Some(out)
    }

    /// Appending invocation. nft rules request `--echo --handle` so the
    /// assigned handle can be recorded.
    pub fn invocation(&self, table: &str) -> Invocation {
        self.placed_invocation(table, None)
    }

    /// Invocation inserting before the rule with handle `before`, or appending when `None`
    pub fn placed_invocation(&self, table: &str, before: Option<u64>) -> Invocation {
        if let (Some(chain), Some(body)) = (self.chain(), self.rule_body()) {
            let mut args: Vec<String> = vec!["--echo".into(), "--handle".into()];
            match before {
                Some(handle) => args.extend([
                    "insert".into(),
                    "rule".into(),
                    "inet".into(),
                    table.into(),
                    chain.into(),
                    "position".into(),
                    handle.to_string(),
                ]),
                None => args.extend([
                    "add".into(),
                    "rule".into(),
                    "inet".into(),
                    table.into(),
                    chain.into(),
                ]),
            }
            args.extend(body);
            return Invocation::nft(args);
        }

        match &self.kind {
            DirectiveKind::CreateSet {
                name,
                family,
                with_port,
                interval,
            } => {
                let key = if *with_port {
                    format!("{} . inet_proto . inet_service", family.addr_type())
                } else {
                    family.addr_type().to_string()
                };
                let flags = if *interval { " flags interval ;" } else { "" };
                Invocation::nft([
                    "add".to_string(),
                    "set".into(),
                    "inet".into(),
                    table.into(),
                    name.clone(),
                    format!("{{ type {key} ;{flags} }}"),
                ])
            }
            DirectiveKind::AddMember { set, element } => Invocation::nft([
                "add".to_string(),
                "element".into(),
                "inet".into(),
                table.into(),
                set.clone(),
                format!("{{ {element} }}"),
            ]),
            DirectiveKind::RootDiscipline {
                device,
                default_class,
                ..
            } => Invocation::tc([
                "qdisc".to_string(),
                "replace".into(),
                "dev".into(),
                device.clone(),
                "root".into(),
                "handle".into(),
                ClassId::ROOT.to_string(),
                "htb".into(),
                "default".into(),
                default_class.minor.to_string(),
            ]),
            DirectiveKind::ClassNode {
                device,
                parent,
                classid,
                guaranteed_kbit,
                ceiling_kbit,
                priority,
                ..
            } => Invocation::tc([
                "class".to_string(),
                "replace".into(),
                "dev".into(),
                device.clone(),
                "parent".into(),
                parent.to_string(),
                "classid".into(),
                classid.to_string(),
                "htb".into(),
                "rate".into(),
                format!("{guaranteed_kbit}kbit"),
                "ceil".into(),
                format!("{ceiling_kbit}kbit"),
                "prio".into(),
                priority.to_string(),
            ]),
            DirectiveKind::Classify {
                device,
                pref,
                criteria,
                target,
                ..
            } => Invocation::tc(classify_args(device, *pref, criteria, *target)),
            // rule kinds are handled above
            _ => Invocation::nft(Vec::<String>::new()),
        }
    }

    /// Invocation undoing this directive. Rules need the handle recorded when
    /// they were added; class nodes and filters vanish with their root qdisc.
    pub fn removal(&self, table: &str, handle: Option<u64>) -> Option<Invocation> {
        if let Some(chain) = self.chain() {
            let handle = handle?;
            return Some(Invocation::nft([
                "delete".to_string(),
                "rule".into(),
                "inet".into(),
                table.into(),
                chain.into(),
                "handle".into(),
                handle.to_string(),
            ]));
        }
        match &self.kind {
            DirectiveKind::CreateSet { name, .. } => Some(Invocation::nft([
                "delete".to_string(),
                "set".into(),
                "inet".into(),
                table.into(),
                name.clone(),
            ])),
            DirectiveKind::AddMember { set, element } => Some(Invocation::nft([
                "delete".to_string(),
                "element".into(),
                "inet".into(),
                table.into(),
                set.clone(),
                format!("{{ {element} }}"),
            ])),
            DirectiveKind::RootDiscipline { device, .. } => Some(shaper_flush(device)),
            _ => None,
        }
    }
}

fn classify_args(device: &str, pref: u32, criteria: &ClassifyMatch, target: ClassId) -> Vec<String> {
    let ethertype = match criteria.family {
        Some(Family::V4) => "ip",
        Some(Family::V6) => "ipv6",
        None => "all",
    };
    let mut args: Vec<String> = [
        "filter", "add", "dev", device, "parent", "1:", "protocol", ethertype, "pref",
    ]
    .map(String::from)
    .to_vec();
    args.push(pref.to_string());

    if criteria.family.is_none() {
        args.push("matchall".into());
    } else {
        args.push("flower".into());
        if let Some(proto) = criteria.protocol.transport_names().first()
            && criteria.protocol != Protocol::TcpUdp
        {
            let proto = if *proto == "icmp" && criteria.family == Some(Family::V6) {
                "icmpv6"
            } else {
                proto
            };
            args.extend(["ip_proto".into(), proto.into()]);
        }
        if let Some(src) = &criteria.source {
            args.extend(["src_ip".into(), network_to_nft(src)]);
        }
        if let Some(dst) = &criteria.destination {
            args.extend(["dst_ip".into(), network_to_nft(dst)]);
        }
        if !criteria.src_port.is_any() {
            args.extend(["src_port".into(), criteria.src_port.to_string()]);
        }
        if !criteria.dst_port.is_any() {
            args.extend(["dst_port".into(), criteria.dst_port.to_string()]);
        }
        if let Some(dscp) = criteria.dscp {
            args.extend(["ip_tos".into(), format!("{:#04x}/0xfc", dscp << 2)]);
        }
    }
    args.extend(["classid".into(), target.to_string()]);
    args
}

/// Empties a set while keeping it (and the rules referencing it) in place
pub fn set_flush(table: &str, name: &str) -> Invocation {
    Invocation::nft(["flush", "set", "inet", table, name])
}

/// Removes the managed table and everything in it
pub fn namespace_teardown(table: &str) -> Invocation {
    Invocation::nft(["delete", "table", "inet", table])
}

/// Removes a device's root qdisc and with it every class and filter
pub fn shaper_flush(device: &str) -> Invocation {
    Invocation::tc(["qdisc", "del", "dev", device, "root"])
}

/// Invocations that flush and recreate the managed table with its fixed chain layout
pub fn namespace_setup(table: &str) -> Vec<Invocation> {
    let mut steps = vec![
        Invocation::nft(["add", "table", "inet", table]),
        Invocation::nft(["delete", "table", "inet", table]),
        Invocation::nft(["add", "table", "inet", table]),
    ];
    let base_chains = [
        ("input", "{ type filter hook input priority 0 ; policy accept ; }"),
        ("forward", "{ type filter hook forward priority 0 ; policy accept ; }"),
        (CHAIN_PREROUTING, "{ type nat hook prerouting priority -100 ; }"),
        (CHAIN_POSTROUTING, "{ type nat hook postrouting priority 100 ; }"),
    ];
    for (chain, spec) in base_chains {
        steps.push(Invocation::nft(["add", "chain", "inet", table, chain, spec]));
    }
    for chain in [CHAIN_CLAMP, CHAIN_FORWARDS, CHAIN_ZONES] {
        steps.push(Invocation::nft(["add", "chain", "inet", table, chain]));
    }

    let base_rules: [(&str, &[&str]); 9] = [
        ("input", &["ct", "state", "invalid", "drop"]),
        ("input", &["ct", "state", "established,related", "accept"]),
        ("input", &["iifname", "\"lo\"", "accept"]),
        ("input", &["jump", CHAIN_ZONES]),
        ("forward", &["ct", "state", "invalid", "drop"]),
        ("forward", &["jump", CHAIN_CLAMP]),
        ("forward", &["ct", "state", "established,related", "accept"]),
        ("forward", &["jump", CHAIN_FORWARDS]),
        ("forward", &["jump", CHAIN_ZONES]),
    ];
    for (chain, expr) in base_rules {
        let mut args = vec!["add", "rule", "inet", table, chain];
        args.extend_from_slice(expr);
        steps.push(Invocation::nft(args));
    }
    steps
}

/// `nft -f` script recreating the managed table and every nft directive
pub fn render_nft_script(table: &str, directives: &[Directive]) -> String {
    let mut out = String::from("#!/usr/sbin/nft -f\n");
    out.push_str(&format!("# generated by {TAG_PREFIX}\n"));
    for step in namespace_setup(table) {
        out.push_str(&step.script_line());
        out.push('\n');
    }
    for directive in directives.iter().filter(|d| d.program() == Program::Nft) {
        out.push_str(&directive.invocation(table).script_line());
        out.push('\n');
    }
    out
}

/// `tc -batch` script for every shaper directive, preceded by root flushes
pub fn render_tc_batch(directives: &[Directive]) -> String {
    let mut out = String::new();
    for directive in directives {
        if let DirectiveKind::RootDiscipline { device, .. } = &directive.kind {
            out.push_str(&shaper_flush(device).script_line());
            out.push('\n');
        }
        if directive.program() == Program::Tc {
            out.push_str(&directive.invocation("").script_line());
            out.push('\n');
        }
    }
    out
}

/// Managed-table listing in the layout `nft list table` prints, for diffing
pub fn render_listing(table: &str, directives: &[Directive]) -> String {
    let mut out = format!("table inet {table} {{\n");
    for directive in directives {
        let DirectiveKind::CreateSet { name, .. } = &directive.kind else {
            continue;
        };
        let members: Vec<&str> = directives
            .iter()
            .filter_map(|d| match &d.kind {
                DirectiveKind::AddMember { set, element } if set == name => Some(element.as_str()),
                _ => None,
            })
            .collect();
        out.push_str(&format!("\tset {name} {{\n"));
        if !members.is_empty() {
            out.push_str(&format!("\t\telements = {{ {} }}\n", members.join(", ")));
        }
        out.push_str("\t}\n");
    }
    for chain in [
        CHAIN_PREROUTING,
        CHAIN_POSTROUTING,
        CHAIN_CLAMP,
        CHAIN_FORWARDS,
        CHAIN_ZONES,
    ] {
        out.push_str(&format!("\tchain {chain} {{\n"));
        for directive in directives.iter().filter(|d| d.chain() == Some(chain)) {
            if let Some(body) = directive.rule_body() {
                out.push_str(&format!("\t\t{}\n", body.join(" ")));
            }
        }
        out.push_str("\t}\n");
    }
    out.push_str("}\n");
    out
}

/// SHA-256 over every rendered invocation, in order
pub fn fingerprint(table: &str, directives: &[Directive]) -> String {
    let mut hasher = Sha256::new();
    for directive in directives {
        hasher.update(directive.invocation(table).to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DirectiveKind::CreateSet { name, .. } => write!(f, "CreateSet({name})"),
            DirectiveKind::AddMember { set, element } => write!(f, "AddMember({set}, {element})"),
            DirectiveKind::Dnat {
                external_port,
                dest_ip,
                dest_port,
                ..
            } => {
                if dest_port.is_any() {
                    write!(f, "DNAT({external_port}→{dest_ip})")
                } else {
                    write!(f, "DNAT({external_port}→{dest_ip}:{dest_port})")
                }
            }
            DirectiveKind::ForwardAccept {
                protocol,
                dest_ip,
                dest_port,
                ..
            } => {
                if dest_port.is_any() {
                    write!(f, "ForwardAccept({protocol},{dest_ip})")
                } else {
                    write!(f, "ForwardAccept({protocol},{dest_ip}:{dest_port})")
                }
            }
            DirectiveKind::Match {
                criteria, action, ..
            } => {
                let mut parts = Vec::new();
                if criteria.protocol != Protocol::All {
                    parts.push(criteria.protocol.to_string());
                }
                if !matches!(criteria.source, AddrMatch::Any) {
                    parts.push(format!("from {}", criteria.source));
                }
                if !matches!(criteria.destination, AddrMatch::Any) {
                    parts.push(format!("to {}", criteria.destination));
                }
                if !criteria.src_port.is_any() {
                    parts.push(format!("sport{}", criteria.src_port));
                }
                if !criteria.dst_port.is_any() {
                    parts.push(format!("dport{}", criteria.dst_port));
                }
                if parts.is_empty() {
                    parts.push("any".into());
                }
                write!(f, "Match({})->{} on {}", parts.join(","), title(*action), self.scope)
            }
            DirectiveKind::Masquerade { .. } => write!(f, "Masquerade on {}", self.scope),
            DirectiveKind::MssClamp { .. } => write!(f, "MssClamp on {}", self.scope),
            DirectiveKind::DefaultPolicy { verdict, .. } => {
                write!(f, "DefaultPolicy({verdict}) on {}", self.scope)
            }
            DirectiveKind::RootDiscipline {
                device, total_kbit, ..
            } => write!(f, "RootDiscipline({device}, {total_kbit}kbit)"),
            DirectiveKind::ClassNode {
                name,
                guaranteed_kbit,
                ceiling_kbit,
                priority,
                ..
            } => write!(
                f,
                "ClassNode({name}, guaranteed={guaranteed_kbit}kbit, ceiling={ceiling_kbit}kbit, prio={priority})"
            ),
            DirectiveKind::Classify {
                device,
                target_name,
                criteria,
                ..
            } => {
                let mut parts = Vec::new();
                if criteria.protocol != Protocol::All {
                    parts.push(criteria.protocol.to_string());
                }
                if let Some(src) = &criteria.source {
                    parts.push(format!("from {}", network_to_nft(src)));
                }
                if let Some(dst) = &criteria.destination {
                    parts.push(format!("to {}", network_to_nft(dst)));
                }
                if !criteria.src_port.is_any() {
                    parts.push(format!("sport{}", criteria.src_port));
                }
                if !criteria.dst_port.is_any() {
                    parts.push(format!("dport{}", criteria.dst_port));
                }
                if let Some(dscp) = criteria.dscp {
                    parts.push(format!("dscp{dscp}"));
                }
                if parts.is_empty() {
                    parts.push("any".into());
                }
                write!(f, "Classify({} -> {target_name} on {device})", parts.join(","))
            }
        }
    }
}

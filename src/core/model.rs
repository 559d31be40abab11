//! Policy model: the declarative entities the compiler reads
//!
//! Entities are flat records with numeric ids, the same shape the external
//! policy store keeps them in. Address and port fields stay as the raw strings
//! an operator typed; the compiler parses them (see [`crate::core::spec`]) so a
//! malformed value only blocks its own entity.
//!
//! The compiler never writes back. The only write path is
//! [`PolicyStore::import_port_forward`], used by the synchronizer when it adopts
//! a live mapping it did not create.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;

pub type EntityId = u32;

/// Verdict used both by rules and by a zone's trailing catch-all
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    #[strum(serialize = "accept")]
    Accept,
    #[default]
    #[strum(serialize = "drop")]
    Drop,
    #[strum(serialize = "reject")]
    Reject,
}

/// Layer-4 protocol selector
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Protocol {
    #[default]
    #[serde(rename = "all")]
    #[strum(serialize = "all")]
    All,
    #[serde(rename = "tcp")]
    #[strum(serialize = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    #[strum(serialize = "udp")]
    Udp,
    #[serde(rename = "icmp")]
    #[strum(serialize = "icmp")]
    Icmp,
    #[serde(rename = "tcp+udp", alias = "tcp,udp")]
    #[strum(to_string = "tcp+udp", serialize = "tcp,udp")]
    TcpUdp,
}

impl Protocol {
    /// Whether port matching is meaningful for this protocol
    pub const fn carries_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp | Protocol::TcpUdp)
    }

    /// Protocols covered, in canonical order
    pub fn transport_names(self) -> &'static [&'static str] {
        match self {
            Protocol::Tcp => &["tcp"],
            Protocol::Udp => &["udp"],
            Protocol::TcpUdp => &["tcp", "udp"],
            Protocol::Icmp => &["icmp"],
            Protocol::All => &[],
        }
    }

    /// True when both selectors can match the same packet
    pub fn overlaps(self, other: Protocol) -> bool {
        if self == Protocol::All || other == Protocol::All {
            return true;
        }
        self.transport_names()
            .iter()
            .any(|p| other.transport_names().contains(p))
    }
}

/// Element layout of an ipset
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum IpSetKind {
    #[default]
    #[serde(rename = "address", alias = "hash:ip")]
    #[strum(serialize = "address")]
    Address,
    #[serde(rename = "network", alias = "hash:net")]
    #[strum(serialize = "network")]
    Network,
    #[serde(rename = "address+port", alias = "hash:ip,port")]
    #[strum(serialize = "address+port")]
    AddressPort,
    #[serde(rename = "network+port", alias = "hash:net,port")]
    #[strum(serialize = "network+port")]
    NetworkPort,
}

impl IpSetKind {
    pub const fn with_port(self) -> bool {
        matches!(self, IpSetKind::AddressPort | IpSetKind::NetworkPort)
    }

    pub const fn with_prefix(self) -> bool {
        matches!(self, IpSetKind::Network | IpSetKind::NetworkPort)
    }
}

/// Traffic direction a QoS rule classifies
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[strum(serialize = "in")]
    In,
    #[default]
    #[strum(serialize = "out")]
    Out,
    #[strum(serialize = "both")]
    Both,
}

fn default_any() -> String {
    "any".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Zone {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub default_policy: Verdict,
    #[serde(default)]
    pub masquerade: bool,
    #[serde(default)]
    pub mss_clamping: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: EntityId,
    /// Owning zone, by name
    pub zone: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_any")]
    pub source: String,
    #[serde(default = "default_any")]
    pub destination: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_any")]
    pub src_port: String,
    #[serde(default = "default_any")]
    pub dst_port: String,
    #[serde(default)]
    pub action: Verdict,
    #[serde(default)]
    pub log: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    /// Informational only; the compiler never expands it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortForward {
    pub id: EntityId,
    #[serde(default)]
    pub label: String,
    pub source_zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_zone: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    pub external_port: String,
    /// Restricts the DNAT to packets addressed to this external address or network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_addr: Option<String>,
    pub dest_ip: String,
    #[serde(default = "default_any")]
    pub dest_port: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpSet {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub kind: IpSetKind,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceGroup {
    pub id: EntityId,
    pub name: String,
    /// `protocol:port-spec` entries such as `tcp:80,443`
    #[serde(default)]
    pub entries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QosConfig {
    pub id: EntityId,
    pub interface: String,
    /// kbit/s
    #[serde(default)]
    pub download_bandwidth: u32,
    /// kbit/s
    #[serde(default)]
    pub upload_bandwidth: u32,
    pub default_class: String,
    #[serde(default = "default_true")]
    pub hierarchical: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// IFB device carrying redirected ingress traffic for download shaping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QosClass {
    pub id: EntityId,
    pub config_id: EntityId,
    pub name: String,
    /// 1 (highest) to 7 (lowest)
    pub priority: u8,
    pub min_bandwidth: u8,
    pub max_bandwidth: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QosRule {
    pub id: EntityId,
    pub class_id: EntityId,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_any")]
    pub source: String,
    #[serde(default = "default_any")]
    pub destination: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_any")]
    pub src_port: String,
    #[serde(default = "default_any")]
    pub dst_port: String,
    /// DSCP class name (`EF`, `AF41`, ...) or numeric codepoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dscp: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Identity of one policy entity, the unit of incremental apply and status tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityRef {
    IpSet(EntityId),
    PortForward(EntityId),
    Zone(EntityId),
    Rule(EntityId),
    ServiceGroup(EntityId),
    QosConfig(EntityId),
    QosClass(EntityId),
    QosRule(EntityId),
}

impl EntityRef {
    pub const fn kind(&self) -> &'static str {
        match self {
            EntityRef::IpSet(_) => "ipset",
            EntityRef::PortForward(_) => "forward",
            EntityRef::Zone(_) => "zone",
            EntityRef::Rule(_) => "rule",
            EntityRef::ServiceGroup(_) => "service",
            EntityRef::QosConfig(_) => "qos",
            EntityRef::QosClass(_) => "qos-class",
            EntityRef::QosRule(_) => "qos-rule",
        }
    }

    pub const fn id(&self) -> EntityId {
        match *self {
            EntityRef::IpSet(id)
            | EntityRef::PortForward(id)
            | EntityRef::Zone(id)
            | EntityRef::Rule(id)
            | EntityRef::ServiceGroup(id)
            | EntityRef::QosConfig(id)
            | EntityRef::QosClass(id)
            | EntityRef::QosRule(id) => id,
        }
    }

    pub const fn is_shaper(&self) -> bool {
        matches!(
            self,
            EntityRef::QosConfig(_) | EntityRef::QosClass(_) | EntityRef::QosRule(_)
        )
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

impl FromStr for EntityRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| Error::validation(s, "expected <kind>:<id>"))?;
        let id: EntityId = id
            .parse()
            .map_err(|_| Error::validation(s, "entity id must be a number"))?;
        Ok(match kind {
            "ipset" => EntityRef::IpSet(id),
            "forward" => EntityRef::PortForward(id),
            "zone" => EntityRef::Zone(id),
            "rule" => EntityRef::Rule(id),
            "service" => EntityRef::ServiceGroup(id),
            "qos" => EntityRef::QosConfig(id),
            "qos-class" => EntityRef::QosClass(id),
            "qos-rule" => EntityRef::QosRule(id),
            other => return Err(Error::validation(s, format!("unknown entity kind '{other}'"))),
        })
    }
}

impl Serialize for EntityRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Point-in-time copy of the whole policy model
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicySnapshot {
    pub zones: Vec<Zone>,
    pub rules: Vec<Rule>,
    pub port_forwards: Vec<PortForward>,
    pub ipsets: Vec<IpSet>,
    pub service_groups: Vec<ServiceGroup>,
    pub qos_configs: Vec<QosConfig>,
    pub qos_classes: Vec<QosClass>,
    pub qos_rules: Vec<QosRule>,
}

impl PolicySnapshot {
    pub fn zone_by_name(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.name == name)
    }

    pub fn ipset_by_name(&self, name: &str) -> Option<&IpSet> {
        self.ipsets.iter().find(|s| s.name == name)
    }

    /// Whether the referenced record is present in the snapshot
    pub fn contains(&self, entity: &EntityRef) -> bool {
        let id = entity.id();
        match entity {
            EntityRef::IpSet(_) => self.ipsets.iter().any(|e| e.id == id),
            EntityRef::PortForward(_) => self.port_forwards.iter().any(|e| e.id == id),
            EntityRef::Zone(_) => self.zones.iter().any(|e| e.id == id),
            EntityRef::Rule(_) => self.rules.iter().any(|e| e.id == id),
            EntityRef::ServiceGroup(_) => self.service_groups.iter().any(|e| e.id == id),
            EntityRef::QosConfig(_) => self.qos_configs.iter().any(|e| e.id == id),
            EntityRef::QosClass(_) => self.qos_classes.iter().any(|e| e.id == id),
            EntityRef::QosRule(_) => self.qos_rules.iter().any(|e| e.id == id),
        }
    }

    /// Whether the entity is present and switched on (including its owners)
    pub fn is_enabled(&self, entity: &EntityRef) -> bool {
        let id = entity.id();
        match entity {
            EntityRef::IpSet(_) => self.ipsets.iter().any(|e| e.id == id && e.enabled),
            EntityRef::PortForward(_) => self.port_forwards.iter().any(|e| e.id == id && e.enabled),
            EntityRef::Zone(_) => self.zones.iter().any(|e| e.id == id && e.enabled),
            EntityRef::Rule(_) => self.rules.iter().any(|r| {
                r.id == id && r.enabled && self.zone_by_name(&r.zone).is_some_and(|z| z.enabled)
            }),
            EntityRef::ServiceGroup(_) => self.service_groups.iter().any(|e| e.id == id),
            EntityRef::QosConfig(_) => self.qos_configs.iter().any(|e| e.id == id && e.enabled),
            EntityRef::QosClass(_) => self.qos_classes.iter().any(|c| {
                c.id == id && self.is_enabled(&EntityRef::QosConfig(c.config_id))
            }),
            EntityRef::QosRule(_) => self.qos_rules.iter().any(|r| {
                r.id == id && r.enabled && self.is_enabled(&EntityRef::QosClass(r.class_id))
            }),
        }
    }

    /// The shaped interface configuration an entity belongs to, if any
    pub fn owning_qos_config(&self, entity: &EntityRef) -> Option<EntityId> {
        match *entity {
            EntityRef::QosConfig(id) => Some(id),
            EntityRef::QosClass(id) => self
                .qos_classes
                .iter()
                .find(|c| c.id == id)
                .map(|c| c.config_id),
            EntityRef::QosRule(id) => {
                let class_id = self.qos_rules.iter().find(|r| r.id == id)?.class_id;
                self.owning_qos_config(&EntityRef::QosClass(class_id))
            }
            _ => None,
        }
    }

    pub fn next_port_forward_id(&self) -> EntityId {
        self.port_forwards.iter().map(|f| f.id).max().unwrap_or(0) + 1
    }

    /// Copy of the snapshot with one record dropped
    pub fn without(&self, entity: &EntityRef) -> PolicySnapshot {
        let mut out = self.clone();
        let id = entity.id();
        match entity {
            EntityRef::IpSet(_) => out.ipsets.retain(|e| e.id != id),
            EntityRef::PortForward(_) => out.port_forwards.retain(|e| e.id != id),
            EntityRef::Zone(_) => out.zones.retain(|e| e.id != id),
            EntityRef::Rule(_) => out.rules.retain(|e| e.id != id),
            EntityRef::ServiceGroup(_) => out.service_groups.retain(|e| e.id != id),
            EntityRef::QosConfig(_) => out.qos_configs.retain(|e| e.id != id),
            EntityRef::QosClass(_) => out.qos_classes.retain(|e| e.id != id),
            EntityRef::QosRule(_) => out.qos_rules.retain(|e| e.id != id),
        }
        out
    }

    /// Every entity in the snapshot
    pub fn entities(&self) -> Vec<EntityRef> {
        let mut out = Vec::new();
        out.extend(self.ipsets.iter().map(|e| EntityRef::IpSet(e.id)));
        out.extend(self.port_forwards.iter().map(|e| EntityRef::PortForward(e.id)));
        out.extend(self.zones.iter().map(|e| EntityRef::Zone(e.id)));
        out.extend(self.rules.iter().map(|e| EntityRef::Rule(e.id)));
        out.extend(self.service_groups.iter().map(|e| EntityRef::ServiceGroup(e.id)));
        out.extend(self.qos_configs.iter().map(|e| EntityRef::QosConfig(e.id)));
        out.extend(self.qos_classes.iter().map(|e| EntityRef::QosClass(e.id)));
        out.extend(self.qos_rules.iter().map(|e| EntityRef::QosRule(e.id)));
        out
    }
}

/// A live mapping adopted into the desired policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedForward {
    pub source_zone: String,
    pub protocol: Protocol,
    pub external_port: String,
    pub dest_ip: String,
    pub dest_port: String,
    pub description: String,
}

/// Read projection of the external policy model
pub trait PolicySource: Send + Sync {
    fn snapshot(&self) -> Result<PolicySnapshot>;
}

/// A snapshot is its own (frozen) source
impl PolicySource for PolicySnapshot {
    fn snapshot(&self) -> Result<PolicySnapshot> {
        Ok(self.clone())
    }
}

/// Policy model with the single write path the synchronizer needs
pub trait PolicyStore: PolicySource {
    /// Adds a new enabled port forward and returns its id
    fn import_port_forward(&self, forward: ImportedForward) -> Result<EntityId>;

    /// Makes earlier imports durable; stores without backing storage have nothing to do
    fn persist(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

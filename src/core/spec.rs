//! Port-spec and address-spec grammars
//!
//! ```text
//! port-spec    := "any" | entry ("," entry)*
//! entry        := port | port "-" port        (start < end)
//! port         := 1..=65535
//! address-spec := "any" | ip | cidr | "@" ipset-name
//! ```
//!
//! Port specs are tokenized with a [`logos`] lexer. Address specs are parsed
//! with [`ipnetwork`] and normalized to their network address, so
//! `192.168.1.5/24` and `192.168.1.0/24` compile identically.

use crate::core::error::{Error, Result};
use crate::core::model::Protocol;
use ipnetwork::IpNetwork;
use logos::Logos;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
enum PortToken {
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<u32>().ok())]
    Number(u32),
    #[token("-")]
    Dash,
    #[token(",")]
    Comma,
    #[regex(r"[ \t]+")]
    Space,
}

/// One element of a port list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortItem {
    Port(u16),
    Range(u16, u16),
}

impl PortItem {
    const fn bounds(self) -> (u16, u16) {
        match self {
            PortItem::Port(p) => (p, p),
            PortItem::Range(s, e) => (s, e),
        }
    }
}

impl fmt::Display for PortItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortItem::Port(p) => write!(f, "{p}"),
            PortItem::Range(s, e) => write!(f, "{s}-{e}"),
        }
    }
}

/// Parsed port selector
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortSpec {
    Any,
    Single(u16),
    Range(u16, u16),
    List(Vec<PortItem>),
}

fn port_error(input: &str, message: impl fmt::Display) -> Error {
    Error::validation(format!("port-spec '{input}'"), message.to_string())
}

fn check_port(input: &str, value: u32) -> Result<u16> {
    match u16::try_from(value) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(port_error(input, format!("port {value} outside 1-65535"))),
    }
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("any") {
            return Ok(PortSpec::Any);
        }

        let mut tokens = Vec::new();
        for token in PortToken::lexer(trimmed) {
            match token {
                Ok(PortToken::Space) => {}
                Ok(token) => tokens.push(token),
                Err(()) => return Err(port_error(input, "expected digits, '-' or ','")),
            }
        }

        let mut items = Vec::new();
        for entry in tokens.split(|t| *t == PortToken::Comma) {
            let item = match entry {
                [PortToken::Number(p)] => PortItem::Port(check_port(input, *p)?),
                [PortToken::Number(s), PortToken::Dash, PortToken::Number(e)] => {
                    let (start, end) = (check_port(input, *s)?, check_port(input, *e)?);
                    if start >= end {
                        return Err(port_error(
                            input,
                            format!("range start {start} must be below end {end}"),
                        ));
                    }
                    PortItem::Range(start, end)
                }
                [] => return Err(port_error(input, "empty list entry")),
                _ => return Err(port_error(input, "malformed entry")),
            };
            if items.contains(&item) {
                return Err(port_error(input, format!("duplicate entry {item}")));
            }
            items.push(item);
        }

        Ok(match items.as_slice() {
            [PortItem::Port(p)] => PortSpec::Single(*p),
            [PortItem::Range(s, e)] => PortSpec::Range(*s, *e),
            _ => PortSpec::List(items),
        })
    }
}

impl PortSpec {
    pub const fn is_any(&self) -> bool {
        matches!(self, PortSpec::Any)
    }

    /// Inclusive ranges covered by this spec; empty for `Any`
    pub fn ranges(&self) -> Vec<(u16, u16)> {
        match self {
            PortSpec::Any => Vec::new(),
            PortSpec::Single(p) => vec![(*p, *p)],
            PortSpec::Range(s, e) => vec![(*s, *e)],
            PortSpec::List(items) => items.iter().map(|i| i.bounds()).collect(),
        }
    }

    /// Whether some port satisfies both specs
    pub fn overlaps(&self, other: &PortSpec) -> bool {
        if self.is_any() || other.is_any() {
            return true;
        }
        let theirs = other.ranges();
        self.ranges()
            .iter()
            .any(|(s, e)| theirs.iter().any(|(os, oe)| s <= oe && os <= e))
    }

    /// Number of ports covered, `None` for `Any`
    pub fn width(&self) -> Option<u32> {
        if self.is_any() {
            return None;
        }
        Some(
            self.ranges()
                .iter()
                .map(|(s, e)| u32::from(*e) - u32::from(*s) + 1)
                .sum(),
        )
    }

    /// nftables operand: `80`, `80-443`, or `{ 80, 443 }`
    pub fn to_nft(&self) -> String {
        match self {
            PortSpec::List(items) => {
                let joined: Vec<String> = items.iter().map(ToString::to_string).collect();
                format!("{{ {} }}", joined.join(", "))
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Any => write!(f, "any"),
            PortSpec::Single(p) => write!(f, "{p}"),
            PortSpec::Range(s, e) => write!(f, "{s}-{e}"),
            PortSpec::List(items) => {
                let joined: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "{}", joined.join(","))
            }
        }
    }
}

/// Address family of a concrete address match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const fn of(net: &IpNetwork) -> Self {
        match net {
            IpNetwork::V4(_) => Family::V4,
            IpNetwork::V6(_) => Family::V6,
        }
    }

    /// nftables payload keyword (`ip` / `ip6`)
    pub const fn nft_keyword(self) -> &'static str {
        match self {
            Family::V4 => "ip",
            Family::V6 => "ip6",
        }
    }
}

/// Parsed address selector
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddrSpec {
    Any,
    Net(IpNetwork),
    /// Reference to an ipset by name
    Set(String),
}

fn addr_error(input: &str, message: impl Into<String>) -> Error {
    Error::validation(format!("address-spec '{input}'"), message)
}

/// Canonical network for an address or CIDR (host bits cleared)
pub fn normalize_network(input: &str) -> Result<IpNetwork> {
    let trimmed = input.trim();
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(IpNetwork::from(ip));
    }
    let net: IpNetwork = trimmed
        .parse()
        .map_err(|_| addr_error(input, "not an IP address or CIDR network"))?;
    IpNetwork::new(net.network(), net.prefix())
        .map_err(|e| addr_error(input, format!("invalid prefix: {e}")))
}

/// Address or network rendered the way nftables prints it
pub fn network_to_nft(net: &IpNetwork) -> String {
    if net.prefix() == max_prefix(net) {
        net.ip().to_string()
    } else {
        format!("{}/{}", net.network(), net.prefix())
    }
}

const fn max_prefix(net: &IpNetwork) -> u8 {
    match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

impl FromStr for AddrSpec {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("any") {
            return Ok(AddrSpec::Any);
        }
        if let Some(name) = trimmed.strip_prefix('@') {
            crate::validators::validate_set_name(name).map_err(|e| addr_error(input, e))?;
            return Ok(AddrSpec::Set(name.to_string()));
        }
        normalize_network(trimmed).map(AddrSpec::Net)
    }
}

impl AddrSpec {
    pub const fn is_any(&self) -> bool {
        matches!(self, AddrSpec::Any)
    }

    /// Family of a concrete network; `None` for `Any` and set references
    pub const fn family(&self) -> Option<Family> {
        match self {
            AddrSpec::Net(net) => Some(Family::of(net)),
            _ => None,
        }
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrSpec::Any => write!(f, "any"),
            AddrSpec::Net(net) => write!(f, "{}", network_to_nft(net)),
            AddrSpec::Set(name) => write!(f, "@{name}"),
        }
    }
}

/// One `protocol:port-spec` entry of a service group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub protocol: Protocol,
    pub ports: PortSpec,
}

impl FromStr for ServiceEntry {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let (proto, ports) = input
            .split_once(':')
            .ok_or_else(|| Error::validation(format!("service '{input}'"), "expected protocol:ports"))?;
        let protocol: Protocol = proto.trim().to_ascii_lowercase().parse().map_err(|_| {
            Error::validation(format!("service '{input}'"), format!("unknown protocol '{proto}'"))
        })?;
        if !protocol.carries_ports() {
            return Err(Error::validation(
                format!("service '{input}'"),
                "protocol must be tcp, udp or tcp+udp",
            ));
        }
        let ports: PortSpec = ports.parse()?;
        if ports.is_any() {
            return Err(Error::validation(format!("service '{input}'"), "ports must be explicit"));
        }
        Ok(Self { protocol, ports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_spec_forms() {
        assert_eq!("80-443".parse::<PortSpec>().unwrap(), PortSpec::Range(80, 443));
        assert_eq!(
            "80,443,8080".parse::<PortSpec>().unwrap(),
            PortSpec::List(vec![
                PortItem::Port(80),
                PortItem::Port(443),
                PortItem::Port(8080)
            ])
        );
        assert_eq!("any".parse::<PortSpec>().unwrap(), PortSpec::Any);
        assert_eq!("ANY".parse::<PortSpec>().unwrap(), PortSpec::Any);
        assert_eq!(" 22 ".parse::<PortSpec>().unwrap(), PortSpec::Single(22));
        assert_eq!(
            "22, 1000-2000".parse::<PortSpec>().unwrap(),
            PortSpec::List(vec![PortItem::Port(22), PortItem::Range(1000, 2000)])
        );
    }

    #[test]
    fn test_port_spec_rejects_out_of_range() {
        let err = "70000".parse::<PortSpec>().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("70000"));
        assert!("0".parse::<PortSpec>().is_err());
        assert!("99999999999999".parse::<PortSpec>().is_err());
    }

    #[test]
    fn test_port_spec_rejects_malformed() {
        for bad in ["443-80", "80-80", "80,", ",80", "80,,443", "http", "80-", "1-2-3", "80,80"] {
            assert!(bad.parse::<PortSpec>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_port_spec_nft_rendering() {
        assert_eq!("80,443".parse::<PortSpec>().unwrap().to_nft(), "{ 80, 443 }");
        assert_eq!("80-90".parse::<PortSpec>().unwrap().to_nft(), "80-90");
    }

    #[test]
    fn test_port_spec_overlap() {
        let a: PortSpec = "8000-8100".parse().unwrap();
        let b: PortSpec = "22,8080".parse().unwrap();
        let c: PortSpec = "443".parse().unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(PortSpec::Any.overlaps(&c));
    }

    #[test]
    fn test_addr_spec_normalizes() {
        let spec: AddrSpec = "192.168.1.5/24".parse().unwrap();
        assert_eq!(spec.to_string(), "192.168.1.0/24");
        let host: AddrSpec = "10.0.0.1".parse().unwrap();
        assert_eq!(host.to_string(), "10.0.0.1");
        let v6: AddrSpec = "2001:db8::1/64".parse().unwrap();
        assert_eq!(v6.to_string(), "2001:db8::/64");
        assert_eq!(v6.family(), Some(Family::V6));
    }

    #[test]
    fn test_addr_spec_set_reference() {
        assert_eq!(
            "@blocklist".parse::<AddrSpec>().unwrap(),
            AddrSpec::Set("blocklist".into())
        );
        assert!("@bad name".parse::<AddrSpec>().is_err());
        assert!("300.1.1.1".parse::<AddrSpec>().is_err());
        assert!("10.0.0.0/33".parse::<AddrSpec>().is_err());
    }

    #[test]
    fn test_service_entry() {
        let entry: ServiceEntry = "tcp:80,443".parse().unwrap();
        assert_eq!(entry.protocol, Protocol::Tcp);
        assert!(matches!(entry.ports, PortSpec::List(_)));
        assert!("icmp:1".parse::<ServiceEntry>().is_err());
        assert!("tcp:any".parse::<ServiceEntry>().is_err());
        assert!("80".parse::<ServiceEntry>().is_err());
    }
}

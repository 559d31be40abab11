//! Policy compilation and enforcement
//!
//! This module contains the domain types and the machinery that turns a
//! policy snapshot into live nftables and tc state. It provides:
//!
//! - [`model`]: Policy entities, entity references and the policy source traits
//! - [`spec`]: Address, port and service-group grammars
//! - [`directive`]: Enforcement directives and their nft/tc invocations
//! - [`compiler`]: Packet-filter compilation and ordering
//! - [`qos`]: HTB shaper trees and traffic classification
//! - [`engine`]: Directive execution, rebuilds and incremental changes
//! - [`lifecycle`]: Per-entity lifecycle states and transitions
//! - [`sync`]: Live-state observation and drift correction
//! - [`scheduler`]: Background jobs with bounded concurrency
//! - [`store`]: File and in-memory policy stores
//! - [`views`]: Serializable status and compile output
//! - [`error`]: Error types and operator hints

pub mod compiler;
pub mod directive;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod qos;
pub mod scheduler;
pub mod spec;
pub mod store;
pub mod sync;
pub mod views;

#[cfg(test)]
pub mod test_helpers;

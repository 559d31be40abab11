//! zonefw - zone firewall and QoS policy engine
//!
//! Compiles a zone/rule/port-forward/ipset/QoS policy into nftables and tc
//! directives, enforces them on the host and keeps the live state in line
//! with the policy.
//!
//! # Architecture
//!
//! - [`core`] - Policy model, compiler, enforcement engine, synchronizer and job scheduler
//! - [`audit`] - Directive log of every executed nft/tc command
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Engine configuration persistence
//! - [`elevation`] - Privilege elevation for nft and tc
//! - [`export`] - Script export and diffing against the live table
//! - [`utils`] - Utility functions (XDG directories, interfaces)
//!
//! # Safety Features
//!
//! - Commands are argv vectors, never shell strings
//! - Per-command timeouts; a failed directive degrades only its owner
//! - Everything zonefw creates is tagged and lives in one managed table
//! - SHA-256 policy checksums and directive-set fingerprints
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod export;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use config::EngineConfig;
pub use core::compiler::{Compilation, PriorityOrder, compile};
pub use core::engine::{ApplyReport, Engine, RebuildTarget, SystemRunner};
pub use core::error::{Error, Result};
pub use core::model::{EntityRef, PolicySnapshot};
pub use core::scheduler::{Job, Scheduler};
pub use core::store::FilePolicyStore;
pub use core::sync::NftObserver;

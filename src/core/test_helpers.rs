//! Shared test utilities for core module tests
//!
//! Entity builders with sensible defaults, a recording [`FakeRunner`] that
//! stands in for nft/tc, and a [`FakeObserver`] returning canned live state.
//! This module is only compiled in test mode.

use crate::config::EngineConfig;
use crate::core::directive::{Invocation, Program};
use crate::core::engine::{CommandOutput, CommandRunner};
use crate::core::error::{Error, Result};
use crate::core::model::{
    Direction, EntityId, IpSet, IpSetKind, PortForward, Protocol, QosClass, QosConfig, QosRule,
    Rule, Verdict, Zone,
};
use crate::core::sync::{ObservedState, StateObserver};
use std::future::Future;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// For tests that just need the mock scripts, use `setup_mock_nft()` instead;
/// it doesn't require holding a guard.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("ZONEFW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("ZONEFW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

static MOCK_INIT: Once = Once::new();

/// Points `ZONEFW_NFT_COMMAND` / `ZONEFW_TC_COMMAND` at `tests/mock_nft.sh`
/// and `tests/mock_tc.sh` and disables elevation.
///
/// Thread-safe and idempotent; tests never touch the real facility.
pub fn setup_mock_nft() {
    MOCK_INIT.call_once(|| {
        let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/tests");
        // SAFETY: runs once, before the variables are read by any test
        unsafe {
            std::env::set_var("ZONEFW_NFT_COMMAND", format!("{dir}/mock_nft.sh"));
            std::env::set_var("ZONEFW_TC_COMMAND", format!("{dir}/mock_tc.sh"));
            std::env::set_var("ZONEFW_TEST_NO_ELEVATION", "1");
        }
    });
}

/// Engine configuration for unit tests: short timeout, no directive log
pub fn engine_config() -> EngineConfig {
    EngineConfig {
        command_timeout_ms: 1000,
        directive_log: false,
        ..EngineConfig::default()
    }
}

pub fn zone(id: EntityId, name: &str, priority: i32, interfaces: &[&str]) -> Zone {
    Zone {
        id,
        name: name.to_string(),
        description: String::new(),
        interfaces: interfaces.iter().map(ToString::to_string).collect(),
        default_policy: Verdict::Drop,
        masquerade: false,
        mss_clamping: false,
        priority,
        enabled: true,
    }
}

/// Accept rule in `zone` matching `protocol` and destination port
pub fn rule(id: EntityId, zone: &str, priority: i32, protocol: &str, dst_port: &str) -> Rule {
    Rule {
        id,
        zone: zone.to_string(),
        label: String::new(),
        source: "any".into(),
        destination: "any".into(),
        protocol: protocol.parse().unwrap_or_default(),
        src_port: "any".into(),
        dst_port: dst_port.to_string(),
        action: Verdict::Accept,
        log: false,
        enabled: true,
        priority,
        service_group: None,
    }
}

/// TCP forward from zone `wan`
pub fn forward(id: EntityId, external_port: &str, dest_ip: &str, dest_port: &str) -> PortForward {
    PortForward {
        id,
        label: String::new(),
        source_zone: "wan".into(),
        dest_zone: None,
        protocol: Protocol::Tcp,
        external_port: external_port.to_string(),
        external_addr: None,
        dest_ip: dest_ip.to_string(),
        dest_port: dest_port.to_string(),
        enabled: true,
        description: String::new(),
    }
}

pub fn ipset(id: EntityId, name: &str, kind: IpSetKind, members: &[&str]) -> IpSet {
    IpSet {
        id,
        name: name.to_string(),
        kind,
        members: members.iter().map(ToString::to_string).collect(),
        enabled: true,
    }
}

/// Enabled hierarchical egress configuration
pub fn qos_config(id: EntityId, interface: &str, upload_kbit: u32, default_class: &str) -> QosConfig {
    QosConfig {
        id,
        interface: interface.to_string(),
        download_bandwidth: 0,
        upload_bandwidth: upload_kbit,
        default_class: default_class.to_string(),
        hierarchical: true,
        enabled: true,
        ingress_device: None,
    }
}

pub fn qos_class(id: EntityId, config_id: EntityId, name: &str, priority: u8, min: u8, max: u8) -> QosClass {
    QosClass {
        id,
        config_id,
        name: name.to_string(),
        priority,
        min_bandwidth: min,
        max_bandwidth: max,
    }
}

/// Outbound rule matching everything
pub fn qos_rule(id: EntityId, class_id: EntityId, priority: i32) -> QosRule {
    QosRule {
        id,
        class_id,
        label: String::new(),
        source: "any".into(),
        destination: "any".into(),
        protocol: Protocol::All,
        src_port: "any".into(),
        dst_port: "any".into(),
        dscp: None,
        direction: Direction::Out,
        priority,
        enabled: true,
    }
}

#[derive(Default)]
struct FakeState {
    invocations: Vec<Invocation>,
    failures: Vec<(String, String)>,
    timeouts: Vec<String>,
    responses: Vec<(String, String)>,
    next_handle: u64,
    /// Rules the kernel would hold: handle → script line
    live: BTreeMap<u64, String>,
    latency: Duration,
}

/// Records every invocation instead of running it.
///
/// nft rule additions echo `# handle N` with increasing handles. Failures,
/// timeouts and canned stdout are injected by substring of the script line.
/// Rule additions and deletions are tracked, so tests can count what would
/// really be live.
#[derive(Clone, Default)]
pub struct FakeRunner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_when(&self, pattern: &str, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((pattern.to_string(), stderr.to_string()));
    }

    pub fn time_out_when(&self, pattern: &str) {
        self.state.lock().unwrap().timeouts.push(pattern.to_string());
    }

    pub fn respond_with(&self, pattern: &str, stdout: &str) {
        self.state
            .lock()
            .unwrap()
            .responses
            .push((pattern.to_string(), stdout.to_string()));
    }

    /// Delays every command, so concurrent callers interleave
    pub fn delay_each(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Live nft rules whose script line contains `pattern`
    pub fn live_matching(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .live
            .values()
            .filter(|line| line.contains(pattern))
            .count()
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failures.clear();
        state.timeouts.clear();
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().invocations.clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .invocations
            .iter()
            .filter(|i| i.script_line().contains(pattern))
            .count()
    }

    fn respond(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.invocations.push(invocation.clone());
        let line = invocation.script_line();
        let program = invocation.program.to_string();

        if state.timeouts.iter().any(|p| line.contains(p.as_str())) {
            return Err(Error::Timeout {
                program,
                after_ms: timeout.as_millis() as u64,
            });
        }
        if let Some((_, stderr)) = state.failures.iter().find(|(p, _)| line.contains(p.as_str())) {
            return Err(Error::Command {
                program,
                message: stderr.clone(),
                stderr: Some(stderr.clone()),
                exit_code: Some(1),
            });
        }
        if let Some((_, stdout)) = state.responses.iter().find(|(p, _)| line.contains(p.as_str())) {
            return Ok(CommandOutput {
                stdout: stdout.clone(),
                stderr: String::new(),
            });
        }

        if invocation.program == Program::Nft {
            if line.starts_with("delete table") {
                state.live.clear();
            } else if line.starts_with("delete rule")
                && let Some(handle) = line
                    .rsplit_once("handle ")
                    .and_then(|(_, h)| h.trim().parse::<u64>().ok())
            {
                state.live.remove(&handle);
            }
        }

        let stdout = if invocation.program == Program::Nft
            && invocation.args.iter().any(|a| a == "--handle")
        {
            state.next_handle += 1;
            let handle = state.next_handle;
            state.live.insert(handle, line.clone());
            format!("{line} # handle {handle}\n")
        } else {
            String::new()
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
        })
    }
}

impl CommandRunner for FakeRunner {
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandOutput>> + Send {
        let latency = self.state.lock().unwrap().latency;
        let result = self.respond(invocation, timeout);
        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            result
        }
    }
}

/// Returns whatever live state was last set
#[derive(Default)]
pub struct FakeObserver {
    state: Mutex<ObservedState>,
}

impl FakeObserver {
    pub fn set(&self, state: ObservedState) {
        *self.state.lock().unwrap() = state;
    }
}

impl StateObserver for FakeObserver {
    fn observe(&self) -> impl Future<Output = Result<ObservedState>> + Send {
        std::future::ready(Ok(self.state.lock().unwrap().clone()))
    }
}

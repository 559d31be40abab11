//! Integration tests for zonefw
//!
//! These tests drive the real `SystemRunner` end to end: rebuilds, failure
//! isolation, timeouts, observation, background jobs and export.
//!
//! # Running with Mock
//!
//! By default, these tests use the mock nft/tc scripts which don't require privileges:
//! ```bash
//! cargo test --test integration_tests
//! ```
//!
//! # Running with Real nftables
//!
//! To test against real nftables and tc (requires elevated privileges and
//! an `eth0`):
//! ```bash
//! sudo -E ZONEFW_USE_REAL_NFT=1 cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use zonefw::config::EngineConfig;
use zonefw::core::engine::{Engine, RebuildTarget, SystemRunner};
use zonefw::core::model::{EntityRef, PolicySnapshot, PolicySource};
use zonefw::core::scheduler::{Job, JobState, Scheduler};
use zonefw::core::store::{FilePolicyStore, parse_policy};
use zonefw::core::sync::{NftObserver, StateObserver};
use zonefw::config::UnknownMappingPolicy;
use zonefw::core::lifecycle::LifecycleState;
use zonefw::export;

static SETUP: Once = Once::new();

fn mock_path(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push(name);
    path
}

/// Points the engine at the mock scripts unless real nft is requested
fn setup_mock_nft() {
    SETUP.call_once(|| {
        if env::var("ZONEFW_USE_REAL_NFT").is_ok() {
            return;
        }
        unsafe {
            env::set_var("ZONEFW_NFT_COMMAND", mock_path("mock_nft.sh"));
            env::set_var("ZONEFW_TC_COMMAND", mock_path("mock_tc.sh"));
            env::set_var("ZONEFW_TEST_NO_ELEVATION", "1");
        }
    });
}

fn test_config() -> EngineConfig {
    setup_mock_nft();
    EngineConfig {
        table: "zonefw_test".into(),
        command_timeout_ms: 2000,
        directive_log: false,
        ..EngineConfig::default()
    }
    .with_env_overrides()
}

const POLICY: &str = r#"{
    "zones": [
        {"id": 1, "name": "wan", "interfaces": ["eth0"], "default_policy": "drop",
         "masquerade": true, "priority": 0},
        {"id": 2, "name": "lan", "interfaces": ["eth1"], "default_policy": "accept",
         "priority": 1}
    ],
    "rules": [
        {"id": 10, "zone": "wan", "label": "allow-ssh", "protocol": "tcp",
         "dst_port": "22", "action": "accept", "priority": 10},
        {"id": 11, "zone": "wan", "label": "block-list", "source": "@blocked",
         "action": "drop", "priority": 0},
        {"id": 12, "zone": "lan", "label": "dns", "protocol": "tcp+udp",
         "dst_port": "53", "action": "accept"}
    ],
    "port_forwards": [
        {"id": 20, "source_zone": "wan", "protocol": "tcp", "external_port": "8080",
         "dest_ip": "192.168.1.50", "dest_port": "80"}
    ],
    "ipsets": [
        {"id": 30, "name": "blocked", "kind": "network",
         "members": ["203.0.113.0/24", "198.51.100.7"]}
    ]
}"#;

fn policy() -> PolicySnapshot {
    parse_policy(POLICY).unwrap()
}

fn with_rule(snapshot: &mut PolicySnapshot, id: u32, dst_port: &str) {
    let mut rule = snapshot.rules[0].clone();
    rule.id = id;
    rule.label = format!("rule-{id}");
    rule.dst_port = dst_port.to_string();
    rule.priority = 50;
    snapshot.rules.push(rule);
}

#[tokio::test]
async fn test_rebuild_against_mock() {
    let config = test_config();
    let engine = Engine::new(SystemRunner::new(&config), &config, None);
    let report = engine
        .rebuild(&policy(), RebuildTarget::All)
        .await
        .expect("rebuild should not error");

    assert!(report.is_clean(), "{:?}", report.summary());
    let status = engine.status().await;
    assert!(status.enabled);
    assert!(status.active_directive_count > 0);
    for entity in [EntityRef::Rule(10), EntityRef::PortForward(20)] {
        let active = engine.active_for(&entity).await;
        assert!(!active.is_empty(), "{entity} has no live directives");
        assert!(active.iter().all(|a| a.handle.is_some()));
    }
    let set = engine.entity_status(&EntityRef::IpSet(30)).await.unwrap();
    assert_eq!(set.state, LifecycleState::Applied);
}

#[tokio::test]
async fn test_failed_rule_degrades_only_its_owner() {
    if env::var("ZONEFW_USE_REAL_NFT").is_ok() {
        return;
    }
    let config = test_config();
    let engine = Engine::new(SystemRunner::new(&config), &config, None);
    let mut snapshot = policy();
    // the mock rejects anything mentioning port 6666
    with_rule(&mut snapshot, 13, "6666");

    let report = engine.rebuild(&snapshot, RebuildTarget::Firewall).await.unwrap();
    assert_eq!(report.failed(), 1);
    let summary = report.summary();
    assert!(summary.errors[0].contains("Operation not permitted"), "{:?}", summary.errors);

    let failed = engine.entity_status(&EntityRef::Rule(13)).await.unwrap();
    assert!(failed.degraded);
    assert!(failed.last_error.is_some());
    let ok = engine.entity_status(&EntityRef::Rule(10)).await.unwrap();
    assert!(!ok.degraded);
    assert_eq!(engine.status().await.last_apply.unwrap().failed, 1);
}

#[tokio::test]
async fn test_hanging_command_times_out() {
    if env::var("ZONEFW_USE_REAL_NFT").is_ok() {
        return;
    }
    let config = EngineConfig {
        command_timeout_ms: 300,
        ..test_config()
    };
    let engine = Engine::new(SystemRunner::new(&config), &config, None);
    let mut snapshot = policy();
    // the mock sleeps on port 7777
    with_rule(&mut snapshot, 14, "7777");

    let started = std::time::Instant::now();
    let report = engine.rebuild(&snapshot, RebuildTarget::Firewall).await.unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
    assert_eq!(report.failed(), 1);
    assert!(report.summary().errors[0].contains("timed out after 300ms"));
}

#[tokio::test]
async fn test_incremental_apply_and_remove() {
    let config = test_config();
    let engine = Engine::new(SystemRunner::new(&config), &config, None);
    let mut snapshot = policy();
    engine.rebuild(&snapshot, RebuildTarget::Firewall).await.unwrap();

    with_rule(&mut snapshot, 15, "8443");
    let report = engine
        .apply_entity(&snapshot, EntityRef::Rule(15))
        .await
        .unwrap();
    assert!(report.is_clean(), "{:?}", report.summary());
    assert_eq!(engine.active_for(&EntityRef::Rule(15)).await.len(), 1);

    snapshot.rules.retain(|r| r.id != 15);
    engine
        .remove_entity(&snapshot, EntityRef::Rule(15), true)
        .await
        .unwrap();
    assert!(engine.active_for(&EntityRef::Rule(15)).await.is_empty());
    let status = engine.entity_status(&EntityRef::Rule(15)).await.unwrap();
    assert_eq!(status.state, LifecycleState::Deleted);
}

#[tokio::test]
async fn test_missing_shaper_device_degrades_qos_only() {
    if env::var("ZONEFW_USE_REAL_NFT").is_ok() {
        return;
    }
    let config = test_config();
    let engine = Engine::new(SystemRunner::new(&config), &config, None);
    let mut snapshot = policy();
    let extra: PolicySnapshot = parse_policy(
        r#"{
        "qos_configs": [{"id": 40, "interface": "nodev0", "upload_bandwidth": 20000,
                         "default_class": "bulk"}],
        "qos_classes": [
            {"id": 41, "config_id": 40, "name": "voip", "priority": 1,
             "min_bandwidth": 20, "max_bandwidth": 50},
            {"id": 42, "config_id": 40, "name": "bulk", "priority": 7,
             "min_bandwidth": 10, "max_bandwidth": 100}
        ]
    }"#,
    )
    .unwrap();
    snapshot.qos_configs = extra.qos_configs;
    snapshot.qos_classes = extra.qos_classes;

    let report = engine.rebuild(&snapshot, RebuildTarget::All).await.unwrap();
    assert!(report.failed() > 0);
    assert!(
        report
            .results
            .iter()
            .filter(|r| r.error.is_some())
            .all(|r| r.directive.owner.is_shaper())
    );
    let qos = engine.entity_status(&EntityRef::QosConfig(40)).await.unwrap();
    assert!(qos.degraded);
    let rule = engine.entity_status(&EntityRef::Rule(10)).await.unwrap();
    assert!(!rule.degraded);
}

#[tokio::test]
async fn test_observer_reads_managed_table() {
    let config = EngineConfig {
        observe_tables: vec!["ip nat".into()],
        ..test_config()
    };
    let runner = Arc::new(SystemRunner::new(&config));
    let observer = NftObserver::new(runner, &config).unwrap();
    let observed = observer.observe().await.unwrap();
    assert!(observed.managed_present);
    // the mock has no foreign tables; they are skipped, not fatal
    assert!(observed.mappings.is_empty());
}

#[tokio::test]
async fn test_scheduler_runs_jobs_on_file_policy() {
    let config = test_config();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.json");
    std::fs::write(&path, POLICY).unwrap();
    let store = Arc::new(FilePolicyStore::open(&path).await.unwrap());

    let engine = Arc::new(Engine::new(SystemRunner::new(&config), &config, None));
    let observer = Arc::new(NftObserver::new(engine.runner(), &config).unwrap());
    let scheduler = Scheduler::new(
        Arc::clone(&engine),
        observer,
        Arc::clone(&store),
        UnknownMappingPolicy::Orphan,
        config.max_concurrent_jobs,
    );

    let rebuild = scheduler.enqueue(Job::Rebuild {
        target: RebuildTarget::All,
    });
    let record = scheduler.wait(rebuild).await.unwrap();
    assert_eq!(record.state, JobState::Succeeded, "{:?}", record.error);

    // the mock lists an empty table, so the forward and set are re-asserted
    let sync = scheduler.enqueue(Job::Sync);
    let record = scheduler.wait(sync).await.unwrap();
    assert!(record.state.is_finished());
    let summary = record.summary.expect("sync publishes its report");
    assert!(summary["drift_count"].as_u64().unwrap() >= 1);

    let teardown = scheduler.enqueue(Job::Teardown);
    scheduler.wait(teardown).await.unwrap();
    assert!(!engine.status().await.enabled);
    assert_eq!(scheduler.jobs().len(), 3);
}

#[test]
fn test_export_writes_script() {
    let config = test_config();
    let compilation = zonefw::compile(&policy(), config.priority_order);
    let script = export::render_script(&config.table, &compilation);
    assert!(script.contains("dnat ip to 192.168.1.50:80"), "{script}");
    assert!(script.contains("zonefw:forward:20"));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zonefw.nft");
    export::save_script(&path, &script).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), script);
}

#[tokio::test]
async fn test_restore_saved_script_against_mock() {
    let config = test_config();
    let engine = Engine::new(SystemRunner::new(&config), &config, None);
    engine.rebuild(&policy(), RebuildTarget::All).await.unwrap();

    let compilation = zonefw::compile(&policy(), config.priority_order);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zonefw.nft");
    export::save_script(&path, &export::render_script(&config.table, &compilation)).unwrap();

    export::restore(&engine, &path).await.expect("restore should succeed");
    let status = engine.status().await;
    assert!(!status.enabled);
    assert_eq!(status.active_directive_count, 0);

    let missing = dir.path().join("absent.nft");
    let err = export::restore(&engine, &missing).await.unwrap_err();
    assert!(err.to_string().contains("absent.nft"), "{err}");
}

#[test]
fn test_policy_file_snapshot_matches_parse() {
    let parsed = policy();
    assert_eq!(parsed.zones.len(), 2);
    assert_eq!(parsed.rules[2].protocol.to_string(), "tcp+udp");
    assert!(parsed.snapshot().is_ok());
}

use crate::core::compiler::PriorityOrder;
use crate::core::error::{Error, Result};
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the synchronizer does with a live mapping nothing in the policy describes
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
pub enum UnknownMappingPolicy {
    /// Adopt it as a new port forward
    #[strum(serialize = "import")]
    Import,
    /// Leave it alone and report it
    #[default]
    #[strum(serialize = "orphan")]
    Orphan,
}

/// Engine configuration. Every field is optional in the JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Name of the managed `inet` table
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_nft")]
    pub nft_command: String,
    #[serde(default = "default_tc")]
    pub tc_command: String,
    /// Per-invocation deadline (clamped to 100-60000 ms)
    #[serde(default = "default_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Periodic sync interval for `run`; 0 disables the timer
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default)]
    pub unknown_mapping_policy: UnknownMappingPolicy,
    /// Foreign tables scanned for port mappings, as `<family> <name>` (e.g. `ip nat`)
    #[serde(default)]
    pub observe_tables: Vec<String>,
    #[serde(default)]
    pub priority_order: PriorityOrder,
    #[serde(default = "default_max_jobs")]
    pub max_concurrent_jobs: usize,
    /// Append every executed directive to the directive log
    #[serde(default = "default_true")]
    pub directive_log: bool,
    /// Policy file; defaults to `<data_dir>/policy.json`
    #[serde(default)]
    pub policy_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            nft_command: default_nft(),
            tc_command: default_tc(),
            command_timeout_ms: default_timeout_ms(),
            sync_interval_secs: default_sync_interval(),
            unknown_mapping_policy: UnknownMappingPolicy::default(),
            observe_tables: Vec::new(),
            priority_order: PriorityOrder::default(),
            max_concurrent_jobs: default_max_jobs(),
            directive_log: true,
            policy_path: None,
        }
    }
}

fn default_table() -> String {
    "zonefw".to_string()
}

fn default_nft() -> String {
    "nft".to_string()
}

fn default_tc() -> String {
    "tc".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_sync_interval() -> u64 {
    60
}

fn default_max_jobs() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.clamp(100, 60_000))
    }

    /// Applies `ZONEFW_NFT_COMMAND` / `ZONEFW_TC_COMMAND` overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(nft) = std::env::var("ZONEFW_NFT_COMMAND")
            && !nft.is_empty()
        {
            self.nft_command = nft;
        }
        if let Ok(tc) = std::env::var("ZONEFW_TC_COMMAND")
            && !tc.is_empty()
        {
            self.tc_command = tc;
        }
        self
    }

    /// Checks values that would only fail later, mid-apply
    pub fn validate(&self) -> Result<()> {
        crate::validators::validate_table_name(&self.table)
            .map_err(|e| Error::validation("config", e))?;
        if self.max_concurrent_jobs == 0 {
            return Err(Error::validation("config", "max_concurrent_jobs must be at least 1"));
        }
        for table in &self.observe_tables {
            parse_table_ref(table).map_err(|e| Error::validation("config", e))?;
        }
        Ok(())
    }

    pub fn resolved_policy_path(&self) -> Option<PathBuf> {
        self.policy_path
            .clone()
            .or_else(|| crate::utils::get_data_dir().map(|d| d.join("policy.json")))
    }
}

/// Splits `<family> <name>` into its parts
pub fn parse_table_ref(raw: &str) -> std::result::Result<(String, String), String> {
    let mut parts = raw.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(family), Some(name), None)
            if matches!(family, "ip" | "ip6" | "inet" | "bridge" | "netdev" | "arp") =>
        {
            crate::validators::validate_table_name(name)?;
            Ok((family.to_string(), name.to_string()))
        }
        _ => Err(format!("observed table '{raw}' must be '<family> <name>'")),
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|d| d.join("config.json"))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config(config: &EngineConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    write_atomic(path, json.as_bytes()).await
}

/// Atomic replace of `path`, created 0600 before any data is written
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save file. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from `path` (or the default location). A missing file
/// yields defaults; a malformed one is an error.
pub async fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path(),
    };
    let config = match path {
        Some(path) => match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str::<EngineConfig>(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => EngineConfig::default(),
            Err(e) => return Err(e.into()),
        },
        None => EngineConfig::default(),
    };
    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.table, "zonefw");
        assert_eq!(config.unknown_mapping_policy, UnknownMappingPolicy::Orphan);
    }

    #[test]
    fn test_timeout_is_clamped() {
        let mut config = EngineConfig {
            command_timeout_ms: 5,
            ..EngineConfig::default()
        };
        assert_eq!(config.command_timeout(), Duration::from_millis(100));
        config.command_timeout_ms = 10_000_000;
        assert_eq!(config.command_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_table_ref() {
        assert_eq!(
            parse_table_ref("ip nat").unwrap(),
            ("ip".to_string(), "nat".to_string())
        );
        assert!(parse_table_ref("nat").is_err());
        assert!(parse_table_ref("foo nat").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        let saved = std::env::var("ZONEFW_TC_COMMAND").ok();
        unsafe {
            std::env::set_var("ZONEFW_TC_COMMAND", "/tmp/mock_tc");
        }
        let config = EngineConfig::default().with_env_overrides();
        unsafe {
            match saved {
                Some(v) => std::env::set_var("ZONEFW_TC_COMMAND", v),
                None => std::env::remove_var("ZONEFW_TC_COMMAND"),
            }
        }
        assert_eq!(config.tc_command, "/tmp/mock_tc");
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = EngineConfig {
            unknown_mapping_policy: UnknownMappingPolicy::Import,
            observe_tables: vec!["ip nat".into()],
            ..EngineConfig::default()
        };
        save_config(&config, &path).await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = load_config(Some(&path)).await.unwrap();
        assert_eq!(loaded.unknown_mapping_policy, UnknownMappingPolicy::Import);
        assert_eq!(loaded.observe_tables, vec!["ip nat".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_config(Some(&path)).await.is_err());
    }
}

//! Policy stores
//!
//! [`FilePolicyStore`] keeps the policy as one JSON document with a sibling
//! `.sha256` file. Edits made outside zonefw are allowed; a checksum mismatch
//! only logs a warning so the operator knows the file was touched. The only
//! write is adopting imported port forwards, which rewrites the file
//! atomically (temp file, 0600, rename) together with a fresh checksum.
//!
//! [`MemoryPolicyStore`] holds the policy in memory, for embedding and tests.

use crate::config::write_atomic;
use crate::core::error::{Error, Result};
use crate::core::model::{
    EntityId, ImportedForward, PolicySnapshot, PolicySource, PolicyStore, PortForward,
};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Hex SHA-256 of the policy document
pub fn checksum(contents: &[u8]) -> String {
    format!("{:x}", Sha256::digest(contents))
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".sha256");
    PathBuf::from(p)
}

/// Parses a policy document
pub fn parse_policy(json: &str) -> Result<PolicySnapshot> {
    serde_json::from_str(json).map_err(|e| Error::validation("policy", format!("malformed policy: {e}")))
}

fn adopt(snapshot: &mut PolicySnapshot, forward: ImportedForward) -> EntityId {
    let id = snapshot.next_port_forward_id();
    snapshot.port_forwards.push(PortForward {
        id,
        label: String::new(),
        source_zone: forward.source_zone,
        dest_zone: None,
        protocol: forward.protocol,
        external_port: forward.external_port,
        external_addr: None,
        dest_ip: forward.dest_ip,
        dest_port: forward.dest_port,
        enabled: true,
        description: forward.description,
    });
    id
}

/// Policy persisted as a JSON file
#[derive(Debug)]
pub struct FilePolicyStore {
    path: PathBuf,
    snapshot: RwLock<PolicySnapshot>,
    dirty: AtomicBool,
}

impl FilePolicyStore {
    /// Loads the policy at `path`
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read or is not a valid policy
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = Self::read(&path).await?;
        Ok(Self {
            path,
            snapshot: RwLock::new(snapshot),
            dirty: AtomicBool::new(false),
        })
    }

    async fn read(path: &Path) -> Result<PolicySnapshot> {
        let contents = tokio::fs::read(path).await?;
        match tokio::fs::read_to_string(checksum_path(path)).await {
            Ok(expected) if expected.trim() != checksum(&contents) => {
                warn!(
                    "Policy file {} changed outside zonefw (checksum mismatch)",
                    path.display()
                );
            }
            _ => {}
        }
        parse_policy(&String::from_utf8_lossy(&contents))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file, replacing the in-memory policy
    pub async fn reload(&self) -> Result<()> {
        let snapshot = Self::read(&self.path).await?;
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Writes the policy and its checksum
    pub async fn save(&self) -> Result<()> {
        let json = {
            let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string_pretty(&*snapshot)?
        };
        write_atomic(&self.path, json.as_bytes()).await?;
        write_atomic(&checksum_path(&self.path), checksum(json.as_bytes()).as_bytes()).await?;
        self.dirty.store(false, Ordering::Release);
        info!("Saved policy to {}", self.path.display());
        Ok(())
    }
}

impl PolicySource for FilePolicyStore {
    fn snapshot(&self) -> Result<PolicySnapshot> {
        Ok(self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

impl PolicyStore for FilePolicyStore {
    fn import_port_forward(&self, forward: ImportedForward) -> Result<EntityId> {
        let id = adopt(
            &mut self.snapshot.write().unwrap_or_else(PoisonError::into_inner),
            forward,
        );
        self.dirty.store(true, Ordering::Release);
        Ok(id)
    }

    fn persist(&self) -> impl Future<Output = Result<()>> + Send {
        async move {
            if self.dirty.load(Ordering::Acquire) {
                self.save().await?;
            }
            Ok(())
        }
    }
}

/// In-memory policy
#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    snapshot: RwLock<PolicySnapshot>,
}

impl MemoryPolicyStore {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Applies an edit to the held policy
    pub fn update(&self, edit: impl FnOnce(&mut PolicySnapshot)) {
        edit(&mut self.snapshot.write().unwrap_or_else(PoisonError::into_inner));
    }
}

impl PolicySource for MemoryPolicyStore {
    fn snapshot(&self) -> Result<PolicySnapshot> {
        Ok(self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn import_port_forward(&self, forward: ImportedForward) -> Result<EntityId> {
        Ok(adopt(
            &mut self.snapshot.write().unwrap_or_else(PoisonError::into_inner),
            forward,
        ))
    }
}

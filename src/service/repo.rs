use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::{FireInfo, RuleKind};
use crate::core::error::{FirewallError, Result};

// ===========================================================================
// Natural Key & Records
// ===========================================================================

/// The tuple correlating a live rule with its metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub kind: RuleKind,
    pub port: String,
    pub protocol: String,
    pub address: String,
    pub strategy: String,
}

impl NaturalKey {
    pub fn of_info(kind: RuleKind, info: &FireInfo) -> Self {
        Self {
            kind,
            port: info.port.clone(),
            protocol: info.protocol.clone(),
            address: info.address.clone(),
            strategy: info.strategy.clone(),
        }
    }
}

/// A pure annotation row; it has no enforcement effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionRecord {
    #[serde(flatten)]
    pub key: NaturalKey,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl DescriptionRecord {
    pub fn new(key: NaturalKey, description: impl Into<String>) -> Self {
        Self {
            key,
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}

// ===========================================================================
// Store Boundary
// ===========================================================================

/// Abstract CRUD over the metadata side-table, keyed by natural key. The
/// engine never expresses storage specifics through this seam.
pub trait DescriptionStore: Send + Sync {
    fn find(&self, key: &NaturalKey) -> Result<Option<DescriptionRecord>>;
    fn upsert(&self, record: DescriptionRecord) -> Result<()>;
    fn delete(&self, key: &NaturalKey) -> Result<()>;
    fn list_all(&self) -> Result<Vec<DescriptionRecord>>;
}

/// In-memory store; the default when no persistence is wired in, and the
/// fixture for service tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<NaturalKey, DescriptionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<NaturalKey, DescriptionRecord>>> {
        self.records
            .lock()
            .map_err(|_| FirewallError::Store("description store lock poisoned".into()))
    }
}

impl DescriptionStore for MemoryStore {
    fn find(&self, key: &NaturalKey) -> Result<Option<DescriptionRecord>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn upsert(&self, record: DescriptionRecord) -> Result<()> {
        self.lock()?.insert(record.key.clone(), record);
        Ok(())
    }

    fn delete(&self, key: &NaturalKey) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<DescriptionRecord>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

/// JSON-file-backed store so annotations survive restarts when no external
/// database is available. Writes go through a temp file and rename.
pub struct FileStore {
    path: PathBuf,
    records: Mutex<HashMap<NaturalKey, DescriptionRecord>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut records = HashMap::new();
        if path.exists() {
            let data = fs::read_to_string(&path)
                .map_err(|e| FirewallError::Store(format!("read {}: {e}", path.display())))?;
            if !data.trim().is_empty() {
                let list: Vec<DescriptionRecord> = serde_json::from_str(&data)
                    .map_err(|e| FirewallError::Store(format!("parse {}: {e}", path.display())))?;
                for record in list {
                    records.insert(record.key.clone(), record);
                }
            }
        }
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn persist(&self, records: &HashMap<NaturalKey, DescriptionRecord>) -> Result<()> {
        let mut list: Vec<&DescriptionRecord> = records.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let data = serde_json::to_string_pretty(&list)
            .map_err(|e| FirewallError::Store(format!("serialize store: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data)
            .map_err(|e| FirewallError::Store(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| FirewallError::Store(format!("rename {}: {e}", self.path.display())))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<NaturalKey, DescriptionRecord>>> {
        self.records
            .lock()
            .map_err(|_| FirewallError::Store("description store lock poisoned".into()))
    }
}

impl DescriptionStore for FileStore {
    fn find(&self, key: &NaturalKey) -> Result<Option<DescriptionRecord>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn upsert(&self, record: DescriptionRecord) -> Result<()> {
        let mut records = self.lock()?;
        records.insert(record.key.clone(), record);
        self.persist(&records)
    }

    fn delete(&self, key: &NaturalKey) -> Result<()> {
        let mut records = self.lock()?;
        if records.remove(key).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<DescriptionRecord>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

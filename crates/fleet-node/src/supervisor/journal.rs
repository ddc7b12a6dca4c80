//! `tunnels.json`: the forwarders this node has started and not yet stopped

use super::SupervisorError;
use chrono::{DateTime, Utc};
use fleet_proto::TunnelSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE: &str = "tunnels.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub spec: TunnelSpec,
    pub pid: u32,
    pub fingerprint: String,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalFile {
    tunnels: BTreeMap<String, JournalEntry>,
}

pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(JOURNAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries of the last run; a missing file is an empty journal
    pub fn load(&self) -> Result<BTreeMap<String, JournalEntry>, SupervisorError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(SupervisorError::Journal(format!(
                    "read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let file: JournalFile = serde_json::from_str(&content).map_err(|e| {
            SupervisorError::Journal(format!("parse {}: {}", self.path.display(), e))
        })?;
        Ok(file.tunnels)
    }

    /// Replace the journal atomically (write temp file, fsync, rename)
    pub fn save(&self, tunnels: &BTreeMap<String, JournalEntry>) -> Result<(), SupervisorError> {
        write_atomic(&self.path, tunnels).map_err(|e| {
            SupervisorError::Journal(format!("write {}: {}", self.path.display(), e))
        })
    }
}

fn write_atomic(path: &Path, tunnels: &BTreeMap<String, JournalEntry>) -> std::io::Result<()> {
    #[derive(Serialize)]
    struct JournalRef<'a> {
        tunnels: &'a BTreeMap<String, JournalEntry>,
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_vec_pretty(&JournalRef { tunnels })?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::executor::RollbackPoint;
use super::plan::{RepairAction, RepairOperation};
use crate::errors::{MeshError, Result};
use crate::journal::JsonLinesFile;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub fingerprint: String,
    pub action_id: Uuid,
    pub incident_id: Uuid,
    pub operation: RepairOperation,
    pub target: String,
    pub applied_at: DateTime<Utc>,
    pub rollback: RollbackPoint,
    pub rolled_back: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LedgerRecord {
    Applied { entry: LedgerEntry },
    RolledBack { incident_id: Uuid, fingerprint: String },
}

/// Per-incident record of applied actions. An action whose fingerprint is
/// already here is never applied a second time.
///
/// A ledger opened on a file outlives the process, so an incident task
/// replayed after a restart is verified instead of repaired again.
#[derive(Debug, Default)]
pub struct ActionLedger {
    entries: Mutex<HashMap<Uuid, Vec<LedgerEntry>>>,
    file: Option<JsonLinesFile>,
}

impl ActionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the ledger at `path`. Incidents whose last action is older
    /// than `retention` are dropped and the file is rewritten compactly.
    pub fn open(path: impl AsRef<Path>, retention: Duration) -> Result<Self> {
        let file = JsonLinesFile::open(path)?;
        let mut entries: HashMap<Uuid, Vec<LedgerEntry>> = HashMap::new();
        for record in file.load::<LedgerRecord>()? {
            match record {
                LedgerRecord::Applied { entry } => {
                    let applied = entries.entry(entry.incident_id).or_default();
                    if !applied.iter().any(|known| known.fingerprint == entry.fingerprint) {
                        applied.push(entry);
                    }
                }
                LedgerRecord::RolledBack {
                    incident_id,
                    fingerprint,
                } => {
                    if let Some(entry) = find_mut(&mut entries, &incident_id, &fingerprint) {
                        entry.rolled_back = true;
                    }
                }
            }
        }

        let retention = chrono::Duration::from_std(retention).map_err(|err| {
            MeshError::InvalidOperation(format!("ledger retention out of range: {err}"))
        })?;
        let loaded = entries.len();
        if let Some(cutoff) = Utc::now().checked_sub_signed(retention) {
            entries.retain(|_, applied| {
                applied.iter().any(|entry| entry.applied_at >= cutoff)
            });
        }
        let live: Vec<LedgerRecord> = entries
            .values()
            .flatten()
            .map(|entry| LedgerRecord::Applied {
                entry: entry.clone(),
            })
            .collect();
        file.rewrite(&live)?;
        info!(
            path = %file.path().display(),
            incidents = entries.len(),
            pruned = loaded - entries.len(),
            "action ledger loaded"
        );
        Ok(Self {
            entries: Mutex::new(entries),
            file: Some(file),
        })
    }

    pub fn lookup(&self, action: &RepairAction) -> Option<LedgerEntry> {
        self.entries
            .lock()
            .get(&action.incident_id)?
            .iter()
            .find(|entry| entry.fingerprint == action.fingerprint)
            .cloned()
    }

    /// Returns false when the action was already recorded. The entry is
    /// kept in memory even when writing it to the file fails.
    pub fn record(&self, action: &RepairAction, rollback: RollbackPoint) -> Result<bool> {
        let mut entries = self.entries.lock();
        let applied = entries.entry(action.incident_id).or_default();
        if applied
            .iter()
            .any(|entry| entry.fingerprint == action.fingerprint)
        {
            return Ok(false);
        }
        let entry = LedgerEntry {
            fingerprint: action.fingerprint.clone(),
            action_id: action.id,
            incident_id: action.incident_id,
            operation: action.operation,
            target: action.target.clone(),
            applied_at: action.applied_at.unwrap_or_else(Utc::now),
            rollback,
            rolled_back: false,
        };
        applied.push(entry.clone());
        if let Some(file) = &self.file {
            file.append(&LedgerRecord::Applied { entry })?;
        }
        Ok(true)
    }

    pub fn mark_rolled_back(&self, action: &RepairAction) -> Result<()> {
        let mut entries = self.entries.lock();
        let Some(entry) = find_mut(&mut entries, &action.incident_id, &action.fingerprint) else {
            return Ok(());
        };
        entry.rolled_back = true;
        if let Some(file) = &self.file {
            file.append(&LedgerRecord::RolledBack {
                incident_id: action.incident_id,
                fingerprint: action.fingerprint.clone(),
            })?;
        }
        Ok(())
    }

    pub fn entries(&self, incident_id: &Uuid) -> Vec<LedgerEntry> {
        self.entries
            .lock()
            .get(incident_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Applied actions for the incident that are still in effect.
    pub fn applied_count(&self, incident_id: &Uuid) -> usize {
        self.entries
            .lock()
            .get(incident_id)
            .map(|applied| applied.iter().filter(|entry| !entry.rolled_back).count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn find_mut<'a>(
    entries: &'a mut HashMap<Uuid, Vec<LedgerEntry>>,
    incident_id: &Uuid,
    fingerprint: &str,
) -> Option<&'a mut LedgerEntry> {
    entries
        .get_mut(incident_id)?
        .iter_mut()
        .find(|entry| entry.fingerprint == fingerprint)
}

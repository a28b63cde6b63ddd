use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::errors::Result;
use crate::task::Task;

/// One durable fact about the fabric. Replaying the records in order rebuilds
/// every queue; `Enqueued` overwrites earlier records for the same message.
/// `Delivered` marks a message handed to a consumer, so a crash before its
/// acknowledgement still counts as an attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    Declared {
        queue: String,
    },
    Enqueued {
        message_id: Uuid,
        queue: String,
        seq: u64,
        task: Task,
    },
    Delivered {
        message_id: Uuid,
    },
    Removed {
        message_id: Uuid,
    },
}

pub trait Journal: Send + Sync {
    /// Must not return before the record is durable.
    fn append(&self, record: &JournalRecord) -> Result<()>;

    fn load(&self) -> Result<Vec<JournalRecord>>;

    /// Replaces the whole journal with the given live records.
    fn compact(&self, live: &[JournalRecord]) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Journal for MemoryJournal {
    fn append(&self, record: &JournalRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<JournalRecord>> {
        Ok(self.records.lock().clone())
    }

    fn compact(&self, live: &[JournalRecord]) -> Result<()> {
        *self.records.lock() = live.to_vec();
        Ok(())
    }
}

/// Append-only file of JSON lines. Each append is flushed with `sync_data`;
/// a torn last line left by a crash is skipped on load.
#[derive(Debug)]
pub struct JsonLinesFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = open_append(&path)?;
        if ends_mid_record(&path)? {
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let _guard = self.file.lock();
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => records.push(record),
                // A torn final write is expected after a crash.
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    "skipping unreadable record: {err}"
                ),
            }
        }
        Ok(records)
    }

    /// Atomically replaces the file with `live`.
    pub fn rewrite<T: Serialize>(&self, live: &[T]) -> Result<()> {
        let mut file = self.file.lock();
        let tmp = self.path.with_extension("compact");
        {
            let mut out = File::create(&tmp)?;
            for record in live {
                let mut line = serde_json::to_vec(record)?;
                line.push(b'\n');
                out.write_all(&line)?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        *file = open_append(&self.path)?;
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn ends_mid_record(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Fabric journal kept in a [`JsonLinesFile`].
pub struct FileJournal {
    file: JsonLinesFile,
}

impl FileJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: JsonLinesFile::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Journal for FileJournal {
    fn append(&self, record: &JournalRecord) -> Result<()> {
        self.file.append(record)
    }

    fn load(&self) -> Result<Vec<JournalRecord>> {
        self.file.load()
    }

    fn compact(&self, live: &[JournalRecord]) -> Result<()> {
        self.file.rewrite(live)
    }
}

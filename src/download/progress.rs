//!
//! # Progress store
//! Exchange point between worker processes (one writer per record) and the
//! session manager (single reader). The file implementation keeps one small
//! text file per worker holding `"<total> <downloaded>"`.
//!

use std::fs;
use std::io;
use std::path::PathBuf;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::download::strategy::Strategy;

const RECORD_PREFIX: &str = "progress_";
const RECORD_SUFFIX: &str = ".txt";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub total: u64,
    pub downloaded: u64,
}

impl Counters {
    pub fn new(total: u64, downloaded: u64) -> Self {
        Self { total, downloaded }
    }

    /// Combine two observations of the same worker; counters never go backwards.
    pub fn merge_max(self, other: Counters) -> Counters {
        Counters {
            total: self.total.max(other.total),
            downloaded: self.downloaded.max(other.downloaded),
        }
    }

    pub fn encode(&self) -> String {
        format!("{} {}", self.total, self.downloaded)
    }

    pub fn parse(text: &str) -> Option<Counters> {
        let mut parts = text.split_whitespace();
        let total = parts.next()?.parse().ok()?;
        let downloaded = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Counters { total, downloaded })
    }
}

impl std::ops::Add for Counters {
    type Output = Counters;

    fn add(self, rhs: Counters) -> Counters {
        Counters {
            total: self.total + rhs.total,
            downloaded: self.downloaded + rhs.downloaded,
        }
    }
}

impl std::iter::Sum for Counters {
    fn sum<I: Iterator<Item = Counters>>(iter: I) -> Counters {
        iter.fold(Counters::default(), |acc, c| acc + c)
    }
}

/// Identity of a progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub strategy: Strategy,
    pub pid: u32,
}

impl WorkerKey {
    pub fn new(strategy: Strategy, pid: u32) -> Self {
        Self { strategy, pid }
    }
}

pub trait ProgressStore: Send + Sync {
    /// `None` when the record is missing or unreadable.
    fn read(&self, key: &WorkerKey) -> Option<Counters>;

    fn write(&self, key: &WorkerKey, counters: Counters) -> io::Result<()>;

    /// Delete every record; returns how many were removed.
    fn clear(&self) -> io::Result<usize>;
}

pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, key: &WorkerKey) -> PathBuf {
        self.dir
            .join(format!("{RECORD_PREFIX}{}_{}{RECORD_SUFFIX}", key.strategy, key.pid))
    }

    fn is_record_file(name: &str) -> bool {
        name.starts_with(RECORD_PREFIX)
            && (name.ends_with(RECORD_SUFFIX) || name.ends_with(TEMP_SUFFIX))
    }
}

impl ProgressStore for FileProgressStore {
    fn read(&self, key: &WorkerKey) -> Option<Counters> {
        let path = self.record_path(key);
        match fs::read_to_string(&path) {
            Ok(text) => {
                let counters = Counters::parse(&text);
                if counters.is_none() {
                    debug!("Unparseable progress record {:?}: {:?}", path, text);
                }
                counters
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!("Failed to read progress record {:?}: {}", path, err);
                None
            }
        }
    }

    fn write(&self, key: &WorkerKey, counters: Counters) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let target = self.record_path(key);
        // The reader must never observe a half-written record.
        let mut tmp = target.clone().into_os_string();
        tmp.push(TEMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, counters.encode())?;
        fs::rename(&tmp, &target)
    }

    fn clear(&self) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !Self::is_record_file(name) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }

        Ok(removed)
    }
}

//! Record store for sites and streams
//!
//! One JSON document per record, replaced atomically on every save.

use std::io;
use std::path::{Path, PathBuf};

use hubfly_model::{Site, Stream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::lock::{RecordLock, RecordLockGuard};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt record {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Persistence for site and stream records
///
/// `save` returns only once the complete record is durable. The `modify_*`
/// operations are read-modify-write cycles that never interleave with other
/// writes to the store, from this process or any other.
pub trait RecordStore: Send + Sync {
    /// Hold off every other writer until the guard drops
    ///
    /// Writes made through this store by the holding thread still go ahead.
    fn lock_records(&self) -> Result<RecordLockGuard<'_>, StoreError>;

    fn list_sites(&self) -> Result<Vec<Site>, StoreError>;
    fn get_site(&self, id: &str) -> Result<Site, StoreError>;
    fn save_site(&self, site: &Site) -> Result<(), StoreError>;
    fn delete_site(&self, id: &str) -> Result<(), StoreError>;
    fn modify_site(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Site),
    ) -> Result<Site, StoreError>;

    fn list_streams(&self) -> Result<Vec<Stream>, StoreError>;
    fn get_stream(&self, id: &str) -> Result<Stream, StoreError>;
    fn save_stream(&self, stream: &Stream) -> Result<(), StoreError>;
    fn delete_stream(&self, id: &str) -> Result<(), StoreError>;
    fn modify_stream(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Stream),
    ) -> Result<Stream, StoreError>;

    /// Streams currently assigned to `port`, oldest first
    fn streams_on_port(&self, port: u16) -> Result<Vec<Stream>, StoreError> {
        Ok(self
            .list_streams()?
            .into_iter()
            .filter(|s| s.listen_port == port)
            .collect())
    }
}

/// File-backed store: `<data_dir>/sites/<id>.json`, `<data_dir>/streams/<id>.json`
///
/// Writers serialize on `<data_dir>/.lock`; write volume is low.
pub struct JsonStore {
    sites_dir: PathBuf,
    streams_dir: PathBuf,
    write_lock: RecordLock,
}

impl JsonStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let sites_dir = data_dir.join("sites");
        let streams_dir = data_dir.join("streams");
        for dir in [&sites_dir, &streams_dir] {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            sites_dir,
            streams_dir,
            write_lock: RecordLock::new(data_dir.join(".lock")),
        })
    }
}

fn record_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", id))
}

fn read_record<T: DeserializeOwned>(
    dir: &Path,
    kind: &'static str,
    id: &str,
) -> Result<T, StoreError> {
    let path = record_path(dir, id);
    let content = match std::fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            })
        }
        Err(source) => return Err(StoreError::Io { path, source }),
    };
    serde_json::from_slice(&content).map_err(|source| StoreError::Corrupt { path, source })
}

fn write_record<T: Serialize>(dir: &Path, id: &str, record: &T) -> Result<(), StoreError> {
    let path = record_path(dir, id);
    let tmp = dir.join(format!(".{}.json.tmp", id));
    let content = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Corrupt {
        path: path.clone(),
        source,
    })?;
    std::fs::write(&tmp, content).map_err(|source| StoreError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
}

fn remove_record(dir: &Path, id: &str) -> Result<(), StoreError> {
    let path = record_path(dir, id);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io { path, source }),
    }
}

fn list_records<T: DeserializeOwned>(dir: &Path, kind: &'static str) -> Result<Vec<T>, StoreError> {
    let entries = std::fs::read_dir(dir).map_err(|source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
            continue;
        };
        if id.starts_with('.') {
            continue;
        }
        match read_record(dir, kind, id) {
            Ok(record) => records.push(record),
            // removed between listing and reading
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

impl RecordStore for JsonStore {
    fn lock_records(&self) -> Result<RecordLockGuard<'_>, StoreError> {
        self.write_lock.lock().map_err(|source| StoreError::Io {
            path: self.write_lock.path().to_path_buf(),
            source,
        })
    }

    fn list_sites(&self) -> Result<Vec<Site>, StoreError> {
        let mut sites: Vec<Site> = list_records(&self.sites_dir, "site")?;
        sites.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(sites)
    }

    fn get_site(&self, id: &str) -> Result<Site, StoreError> {
        read_record(&self.sites_dir, "site", id)
    }

    fn save_site(&self, site: &Site) -> Result<(), StoreError> {
        let _guard = self.lock_records()?;
        write_record(&self.sites_dir, &site.id, site)
    }

    fn delete_site(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock_records()?;
        remove_record(&self.sites_dir, id)
    }

    fn modify_site(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Site),
    ) -> Result<Site, StoreError> {
        let _guard = self.lock_records()?;
        let mut site: Site = read_record(&self.sites_dir, "site", id)?;
        f(&mut site);
        write_record(&self.sites_dir, id, &site)?;
        Ok(site)
    }

    fn list_streams(&self) -> Result<Vec<Stream>, StoreError> {
        let mut streams: Vec<Stream> = list_records(&self.streams_dir, "stream")?;
        streams.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(streams)
    }

    fn get_stream(&self, id: &str) -> Result<Stream, StoreError> {
        read_record(&self.streams_dir, "stream", id)
    }

    fn save_stream(&self, stream: &Stream) -> Result<(), StoreError> {
        let _guard = self.lock_records()?;
        write_record(&self.streams_dir, &stream.id, stream)
    }

    fn delete_stream(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock_records()?;
        remove_record(&self.streams_dir, id)
    }

    fn modify_stream(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Stream),
    ) -> Result<Stream, StoreError> {
        let _guard = self.lock_records()?;
        let mut stream: Stream = read_record(&self.streams_dir, "stream", id)?;
        f(&mut stream);
        write_record(&self.streams_dir, id, &stream)?;
        Ok(stream)
    }
}

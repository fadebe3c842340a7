use std::path::PathBuf;
use std::{io, path::Path, sync::Arc};

use rocksdb::{Options, WriteBatch, DB as Rocks};
use tracing::info;

use txrelay_core::RelayProtocolError;

pub use cursor_store::*;
pub use queue_store::*;
pub use relay_db::*;
pub use typed_db::*;

mod cursor_store;
mod queue_store;
mod relay_db;
mod typed_db;

#[derive(Debug, Clone)]
/// A KV Store
pub struct DB(Arc<Rocks>);

impl From<Rocks> for DB {
    fn from(rocks: Rocks) -> Self {
        Self(Arc::new(rocks))
    }
}

/// DB Error type
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    /// Rocks DB Error
    #[error("{0}")]
    RockError(#[from] rocksdb::Error),
    #[error("Failed to open {path}, canonicalized as {canonicalized}: {source}")]
    /// Error opening the database
    OpeningError {
        /// Rocksdb error during opening
        #[source]
        source: rocksdb::Error,
        /// Raw database path provided
        path: PathBuf,
        /// Parsed path used
        canonicalized: PathBuf,
    },
    /// Could not parse the provided database path string
    #[error("Invalid database path supplied {1:?}; {0}")]
    InvalidDbPath(#[source] io::Error, String),
    /// A stored value could not be decoded
    #[error("{0}")]
    ProtocolError(#[from] RelayProtocolError),
    /// Indexes disagree with the records they point at
    #[error("Storage integrity violated: {0}")]
    Integrity(String),
}

/// Rocks DB result type
pub type DbResult<T> = std::result::Result<T, DbError>;

impl DB {
    /// Opens db at `db_path` and creates if missing
    #[tracing::instrument(err)]
    pub fn from_path(db_path: &Path) -> DbResult<DB> {
        let path = {
            let mut path = db_path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .canonicalize()
                .map_err(|e| DbError::InvalidDbPath(e, db_path.to_string_lossy().into()))?;
            if let Some(file_name) = db_path.file_name() {
                path.push(file_name);
            }
            path
        };

        if path.is_dir() {
            info!(path=%path.to_string_lossy(), "Opening existing db")
        } else {
            info!(path=%path.to_string_lossy(), "Creating db")
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);

        Rocks::open(&opts, &path)
            .map_err(|e| DbError::OpeningError {
                source: e,
                path: db_path.into(),
                canonicalized: path,
            })
            .map(Into::into)
    }

    /// Store a value in the DB
    pub fn store(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        Ok(self.0.put(key, value)?)
    }

    /// Retrieve a value from the DB
    pub fn retrieve(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.0.get(key)?)
    }

    /// Apply every write of `batch` atomically
    pub fn write(&self, batch: WriteBatch) -> DbResult<()> {
        Ok(self.0.write(batch)?)
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> DbResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut entries = vec![];
        for item in self.0.prefix_iterator(prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

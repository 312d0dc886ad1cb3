use std::path::{Path, PathBuf};

use crate::error::{GraphError, Result};
use crate::search::SearchMode;
use crate::storage::StoreOptions;

/// Environment variable overriding the default database location
pub const DB_PATH_ENV: &str = "MEMORY_DB_PATH";

/// Special path opening a private in-memory store
pub const IN_MEMORY: &str = ":memory:";

/// Runtime configuration of the knowledge graph store
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub search_mode: SearchMode,
    pub full_text: bool,
}

impl Config {
    /// Resolve the database path (`--db-path` > `MEMORY_DB_PATH` > data dir)
    /// and validate it.
    pub fn load(cli_path: Option<PathBuf>, search_mode: SearchMode, full_text: bool) -> Result<Self> {
        let raw = resolve_db_path(cli_path, std::env::var(DB_PATH_ENV).ok());
        let db_path = validate_db_path(&raw)?;
        Ok(Self {
            db_path,
            search_mode,
            full_text,
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            full_text: self.full_text,
            search_mode: self.search_mode,
            ..StoreOptions::default()
        }
    }
}

/// Whether `path` names a private in-memory store rather than a file
pub fn is_in_memory(path: &Path) -> bool {
    path.as_os_str() == IN_MEMORY
}

/// Default: `<data-local-dir>/mcp-memory/memory.db`
pub fn default_db_path() -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("mcp-memory");
    path.push("memory.db");
    path
}

pub fn resolve_db_path(cli_path: Option<PathBuf>, env_path: Option<String>) -> PathBuf {
    cli_path
        .or_else(|| env_path.filter(|p| !p.trim().is_empty()).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

/// Validate database path to prevent writing arbitrary files.
///
/// Requires a `.db` extension, creates missing parent directories, and
/// returns the absolute, symlink-resolved path.
pub fn validate_db_path(path: &Path) -> Result<PathBuf> {
    if is_in_memory(path) {
        return Ok(path.to_path_buf());
    }

    // Check file extension FIRST (before any filesystem operations)
    match path.extension() {
        Some(ext) if ext == "db" => {}
        Some(_) => {
            return Err(GraphError::Validation(
                "Invalid database file extension (must be .db)".into(),
            ))
        }
        None => {
            return Err(GraphError::Validation(
                "Database path must have .db extension".into(),
            ))
        }
    }

    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }

    // File doesn't exist yet: canonicalize the parent and append the filename
    let filename = path
        .file_name()
        .ok_or_else(|| GraphError::Validation("Invalid path: no filename".into()))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&parent)?;
    Ok(parent.canonicalize()?.join(filename))
}

//! Whole-file JSON persistence
//!
//! State files are read entirely at the start of a run and written entirely
//! at the end. Writes go through [`StagedWrite`]: the content is serialised to
//! a temp file next to the destination and only renamed into place on commit,
//! so a failure part-way through a run never leaves a half-written file.

use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::core::error::{Error, Result};

/// Read a JSON document, returning `None` when the file does not exist yet
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::IoError(e)),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::ParseError(format!("{}: {e}", path.display())))
}

/// A serialised file waiting to be moved into place
pub struct StagedWrite {
    temp: NamedTempFile,
    destination: PathBuf,
}

impl StagedWrite {
    /// Serialise `value` as pretty JSON into a temp file beside `destination`
    pub fn json<T: Serialize + ?Sized>(destination: &Path, value: &T) -> Result<Self> {
        let dir = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut temp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(temp.as_file_mut(), value)?;
        temp.as_file_mut().write_all(b"\n")?;
        temp.as_file_mut().sync_all()?;

        Ok(Self {
            temp,
            destination: destination.to_path_buf(),
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Atomically replace the destination with the staged content
    pub fn commit(self) -> Result<()> {
        debug!("Writing {}", self.destination.display());
        self.temp
            .persist(&self.destination)
            .map_err(|e| Error::IoError(e.error))?;
        Ok(())
    }
}

/// Commit a set of staged writes in the given order, stopping at the first
/// failure. Staging already succeeded for all of them, so only the renames
/// remain.
pub fn commit_all(writes: Vec<StagedWrite>) -> Result<()> {
    for write in writes {
        write.commit()?;
    }
    Ok(())
}

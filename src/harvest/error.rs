// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Permission or transient I/O failure while inspecting a candidate path.
    /// The Prospector retries on its next scan.
    #[error("File not accessible: {path}: {source}")]
    NotAccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file vanished or changed between discovery and open.
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O failure mid-read. Closes the harvester for that file instance.
    #[error("Read error on {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Registry commits kept failing past the configured threshold.
    #[error("Registry commits failing for {elapsed:?}: {reason}")]
    RegistryCommit { elapsed: Duration, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Spool closed")]
    SpoolClosed,
}

impl Error {
    pub(crate) fn not_accessible(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::NotAccessible {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Open {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Read {
            path: path.into(),
            source,
        }
    }

    /// True when the underlying cause is the file no longer existing.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotAccessible { source, .. }
            | Error::Open { source, .. }
            | Error::Read { source, .. }
            | Error::Io(source) => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

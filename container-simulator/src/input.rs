//! Workload input
//!
//! Reads workloads written by the generator, either from a single CSV file or
//! from every `.csv` file in a directory in name order.

use crate::models::Request;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Error types for workload parsing
#[derive(Debug)]
pub enum WorkloadError {
    Io(io::Error),
    Csv(csv::Error),
}

impl From<io::Error> for WorkloadError {
    fn from(err: io::Error) -> Self {
        WorkloadError::Io(err)
    }
}

impl From<csv::Error> for WorkloadError {
    fn from(err: csv::Error) -> Self {
        WorkloadError::Csv(err)
    }
}

impl std::fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadError::Io(err) => write!(f, "failed to read workload: {err}"),
            WorkloadError::Csv(err) => write!(f, "malformed workload: {err}"),
        }
    }
}

impl std::error::Error for WorkloadError {}

/// Reader for workload files
pub struct WorkloadReader {
    input: PathBuf,
}

impl WorkloadReader {
    /// Create a reader for a file or a directory of files
    pub fn new<P: AsRef<Path>>(input: P) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
        }
    }

    /// Workload files to read, sorted by name
    pub fn files(&self) -> io::Result<Vec<PathBuf>> {
        if self.input.is_file() {
            return Ok(vec![self.input.clone()]);
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.input)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Read every request from every workload file
    pub fn read_all(&self) -> Result<Vec<Request>, WorkloadError> {
        let mut requests = Vec::new();
        for path in self.files()? {
            let mut reader = csv::Reader::from_path(&path)?;
            for row in reader.deserialize() {
                requests.push(row?);
            }
        }
        Ok(requests)
    }
}

//! Stream positions and checkpoints.
//!
//! A checkpoint is the `(file, position)` pair up to which every captured
//! change has been durably written to the audit store. It is persisted in the
//! same transaction as the batch it closes (see [`crate::queue`]) and read
//! once per startup to resume the stream.
//!
//! # Example
//!
//! ```rust
//! use audit_capture::checkpoint::Checkpoint;
//!
//! let checkpoint = Checkpoint::new("mysql-bin.000012", 4_096);
//! assert!(checkpoint.covers("mysql-bin.000012", 1_024));
//! assert!(!checkpoint.covers("mysql-bin.000013", 4));
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Represents a position in the replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stream file name, e.g. `mysql-bin.000012`.
    pub file: String,
    /// Offset within `file`.
    pub position: u64,
}

impl Checkpoint {
    /// Creates a checkpoint for the given file and offset.
    ///
    /// # Example
    ///
    /// ```rust
    /// use audit_capture::checkpoint::Checkpoint;
    ///
    /// let checkpoint = Checkpoint::new("mysql-bin.000001", 154);
    /// assert_eq!(checkpoint.file, "mysql-bin.000001");
    /// assert_eq!(checkpoint.position, 154);
    /// ```
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        Self {
            file: file.into(),
            position,
        }
    }

    /// Whether an event ending at `(file, position)` is already logged.
    ///
    /// ```rust
    /// use audit_capture::checkpoint::Checkpoint;
    ///
    /// let checkpoint = Checkpoint::new("mysql-bin.999999", 500);
    /// assert!(!checkpoint.covers("mysql-bin.1000000", 4));
    /// ```
    pub fn covers(&self, file: &str, position: u64) -> bool {
        if file == self.file {
            return position <= self.position;
        }
        compare_files(file, &self.file) == Ordering::Less
    }
}

/// Orders stream file names by their sequence suffix.
///
/// The suffix is zero-padded to six digits but widens past `999999`, so
/// longer suffixes sort later. Names without a numeric suffix compare
/// lexically.
fn compare_files(a: &str, b: &str) -> Ordering {
    match (split_sequence(a), split_sequence(b)) {
        (Some((base_a, seq_a)), Some((base_b, seq_b))) if base_a == base_b => seq_a
            .len()
            .cmp(&seq_b.len())
            .then_with(|| seq_a.cmp(seq_b)),
        _ => a.cmp(b),
    }
}

fn split_sequence(file: &str) -> Option<(&str, &str)> {
    let (base, sequence) = file.rsplit_once('.')?;
    if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((base, sequence.trim_start_matches('0')))
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.position)
    }
}

//! Key-value database trait and types.
//!
//! This module defines the storage interface the record caches persist through.
//! Keys are byte strings laid out as `rec/{record}/{table}/{id}` so a prefix
//! scan enumerates one table of one record.

use std::fmt;

use async_trait::async_trait;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during key-value database operations.
#[derive(Debug)]
pub enum KeyValueDbError {
    /// An I/O error occurred.
    Io(std::io::Error),
    /// Database error (e.g., from LMDB).
    Database(String),
}

impl fmt::Display for KeyValueDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValueDbError::Io(e) => write!(f, "I/O error: {}", e),
            KeyValueDbError::Database(msg) => write!(f, "database error: {}", msg),
        }
    }
}

impl std::error::Error for KeyValueDbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeyValueDbError::Io(e) => Some(e),
            KeyValueDbError::Database(_) => None,
        }
    }
}

impl From<std::io::Error> for KeyValueDbError {
    fn from(e: std::io::Error) -> Self {
        KeyValueDbError::Io(e)
    }
}

/// Result type for key-value database operations.
pub type Result<T> = std::result::Result<T, KeyValueDbError>;

// =============================================================================
// KeyValueEntry
// =============================================================================

/// A key and its value, as returned by a prefix scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValueEntry {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    /// The key with `prefix` removed, as UTF-8.
    pub fn key_suffix(&self, prefix: &[u8]) -> Option<&str> {
        self.key
            .strip_prefix(prefix)
            .and_then(|s| std::str::from_utf8(s).ok())
    }
}

// =============================================================================
// KeyValueDb Trait
// =============================================================================

/// A key-value database interface.
///
/// Provides basic key-value operations plus transaction support for atomic updates.
#[async_trait]
pub trait KeyValueDb: Send + Sync {
    /// Check if a key exists in the database.
    async fn exists(&self, key: &[u8]) -> Result<bool>;

    /// Get the value for a key, returning `None` if not found.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// List all entries whose key starts with `prefix`, sorted by key.
    async fn list_entries(&self, prefix: &[u8]) -> Result<Vec<KeyValueEntry>>;

    /// Start a transaction.
    ///
    /// Writes are buffered until `commit`, which applies all of them or none.
    /// The commit scheduler relies on this to remove a pending operation and
    /// store the confirmed thing in one step.
    async fn transaction(&self) -> Result<Box<dyn KeyValueDbTransaction + Send>>;
}

// =============================================================================
// KeyValueDbTransaction Trait
// =============================================================================

/// A transaction on a key-value database.
#[async_trait]
pub trait KeyValueDbTransaction: Send {
    /// Get the value for a key within this transaction's view.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Set a key-value pair (buffered until commit).
    fn set(&mut self, key: Vec<u8>, val: Vec<u8>);

    /// Delete a key (buffered until commit).
    fn del(&mut self, key: Vec<u8>);

    /// Commit all buffered writes atomically.
    async fn commit(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// Write Operation Enum
// =============================================================================

/// A pending write operation.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Set a key to a value.
    Set { key: Vec<u8>, value: Vec<u8> },
    /// Delete a key.
    Del { key: Vec<u8> },
}

impl WriteOp {
    /// Get the key for this operation.
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Set { key, .. } | WriteOp::Del { key } => key,
        }
    }
}

/// Find the most recent buffered write for `key`.
pub(crate) fn find_pending<'a>(pending: &'a [WriteOp], key: &[u8]) -> Option<&'a WriteOp> {
    pending.iter().rev().find(|op| op.key() == key)
}

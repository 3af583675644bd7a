//! CLI subcommand implementations.

pub mod key_value_cache;
pub mod records;
pub mod things;

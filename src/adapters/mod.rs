//! Adapters over external engines.

pub mod sqlite;

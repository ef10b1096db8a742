//! Database access for offset series and discrimination records

pub mod init;

pub use init::{init_database, init_memory_database};

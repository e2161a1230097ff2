pub mod db;
mod files;
pub mod models;
mod tables;

pub use db::{Database, DatabaseError};
pub use files::{RegistryStats, DEFAULT_LIST_LIMIT, MAX_ID_ATTEMPTS};
pub use tables::*;

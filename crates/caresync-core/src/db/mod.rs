//! Database layer for CareSync

mod connection;
mod migrations;

pub use connection::Database;

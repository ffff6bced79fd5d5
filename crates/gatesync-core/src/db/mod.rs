//! Database layer for gatesync

mod connection;
mod migrations;
mod repository;

pub use connection::Database;
pub use repository::{LogRepository, UserRepository};

pub(crate) use repository::{insert_log_row, insert_user_row, max_owned_id, update_user_row};

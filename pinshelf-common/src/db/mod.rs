//! Database schema, sessions, stores and queries

pub mod image_tags;
pub mod images;
pub mod init;
pub mod models;
pub mod session;
pub mod tags;

pub use init::{init_database, init_schema};
pub use models::*;
pub use session::{DbSession, SessionMode};

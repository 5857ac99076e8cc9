pub mod api;
pub mod cursor;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod identity;
pub mod message_store;
pub mod models;
pub mod seed;
pub mod sync;
pub mod thread_store;
mod migrations;

pub use db::{open_store, MessageDb};
pub use error::CoreError;

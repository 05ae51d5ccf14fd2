pub mod background;
pub mod buffer;
pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod index;
pub mod recovery;
pub mod server;
pub mod session;
pub mod storage;
pub mod transaction;
pub mod utils;

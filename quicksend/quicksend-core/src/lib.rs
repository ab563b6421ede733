pub mod accounts;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod files;
pub mod groups;
pub mod metadata;
pub mod storage;
pub mod telemetry;
pub mod texts;

pub use error::{Error, Result};

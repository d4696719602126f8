//! instance-init library
//!
//! Boot-time instance configuration: discover where this machine runs,
//! fetch its identity and user-data, and apply that user-data through
//! content handlers exactly as often as each action allows.
//!
//! # Building blocks
//!
//! - [`state`]: on-disk layout, semaphores and frequency-gated execution
//! - [`datasources`]: datasource discovery and the datasource cache
//! - [`userdata`]: payload decoding and the dispatch engine
//! - [`handlers`]: the handler contract and built-in handlers
//! - [`stages`]: the init run composed from the above

pub mod config;
pub mod datasources;
pub mod handlers;
pub mod stages;
pub mod state;
pub mod userdata;

mod error;

pub use error::InitError;
pub use stages::InitContext;
pub use stages::init::{InitOutcome, run as run_init};

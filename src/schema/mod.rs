//! Schema module - Configuration, record and run types for program search.

mod config;
mod program;
mod run;

pub use config::*;
pub use program::*;
pub use run::*;

//! Evolve Search - Iterative search over program variants.
//!
//! The crate repeatedly samples a program from a population, asks an
//! external generator for a modified variant, scores the variant through a
//! pluggable harness and keeps the population within a capacity bound.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Configuration, program records and run reporting types
//! - `evolution`: Archive, evaluation pipeline, generation, patching and the
//!   search controller
//!
//! # Example
//!
//! ```rust,no_run
//! use evolve_search::{
//!     evolution::ProgramArchive,
//!     schema::{ArchiveConfig, Scores},
//! };
//!
//! let mut archive = ProgramArchive::in_memory(&ArchiveConfig::default()).unwrap();
//! archive
//!     .add("def solve(): return 1", Scores::from([("fitness", 0.4)]), None, None)
//!     .unwrap();
//!
//! let (parent, inspirations) = archive.sample().unwrap();
//! println!("Parent {} with {} inspirations", parent.id, inspirations.len());
//! ```

pub mod evolution;
pub mod schema;

// Re-export commonly used types
pub use evolution::{EvaluationPipeline, ProgramArchive, SearchController};
pub use schema::{ProgramRecord, Scores, SearchConfig};

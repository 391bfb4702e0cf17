//! Core domain types and traits for the Shipyard pipeline engine.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Pipeline stages and statuses
//! - Build variants and their recipes
//! - The build executor contract
//! - Notification and status reporting contracts

pub mod build;
pub mod error;
pub mod executor;
pub mod id;
pub mod notify;
pub mod stage;

pub use build::{BuildRecipe, BuildVariant, RecipeTable};
pub use error::{Error, Result};
pub use id::ResourceId;
pub use stage::{PipelineStatus, Stage};

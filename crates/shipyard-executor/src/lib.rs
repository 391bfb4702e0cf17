//! Collaborator backends for Shipyard pipelines.
//!
//! The engine reaches its collaborators through the traits in
//! `shipyard_core`. This crate provides:
//! - [`HttpExecutor`]: a remote build executor
//! - [`WebhookNotifier`] and [`HttpStatusReporter`]: outbound callbacks
//! - [`LogNotifier`] and [`LogStatusReporter`]: tracing-only fallbacks

pub mod http;
pub mod log;
pub mod webhook;

pub use http::HttpExecutor;
pub use log::{LogNotifier, LogStatusReporter};
pub use webhook::{HttpStatusReporter, WebhookNotifier};

pub use shipyard_core::executor::{BuildExecutor, StageOutput, StageRequest};
pub use shipyard_core::notify::{Notifier, StatusReporter};

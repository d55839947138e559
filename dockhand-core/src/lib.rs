//! dockhand-core: dev-environment orchestration for compose projects.
//!
//! Parses a compose manifest and its build files into a normalized service
//! model, diffs that model against a persisted snapshot, rewrites the
//! manifest so dependency directories live in named volumes, populates
//! those volumes inside disposable helper containers, and brings the real
//! services up with file watchers attached.
//!
//! The [`pipeline::UpPipeline`] ties the pieces together; the
//! [`runtime::ContainerRuntime`] trait is the seam to the container
//! runtime, with a Docker CLI implementation and a test mock.

pub mod buildfile;
pub mod diff;
pub mod error;
pub mod generate;
pub mod manifest;
pub mod paths;
pub mod pipeline;
pub mod populate;
pub mod progress;
pub mod retry;
pub mod runtime;
pub mod store;

pub use error::{DockhandError, Result};
pub use manifest::ProjectModel;
pub use pipeline::{UpOptions, UpPipeline};
pub use progress::ProgressReporter;

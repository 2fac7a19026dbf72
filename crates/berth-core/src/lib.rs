//! berth-core: shared types for the berth deployment tool.
//!
//! Holds everything the engine and the drivers agree on: the error
//! taxonomy, the remote URL model, hook job descriptors, relative-path
//! normalization, and the site configuration schema with its INI-style
//! parser.

pub mod config;
pub mod error;
pub mod job;
pub mod paths;
pub mod remote;

pub use config::SiteConfig;
pub use error::{DeployError, DeployResult};
pub use job::Job;
pub use remote::{RemoteUrl, Scheme};

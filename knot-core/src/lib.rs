pub mod cache;
pub mod config;
pub mod console;
pub mod error;
pub mod fetcher;
pub mod ident;
pub mod lifecycle;
pub mod linker;
pub mod lockfile;
pub mod project;
pub mod registry;
pub mod resolve;
pub mod resolver;
pub mod state;

#[cfg(test)]
mod pipeline_test;

pub use cache::Cache;
pub use config::{ChecksumPolicy, KnotConfig};
pub use error::KnotError;
pub use ident::{Descriptor, Ident, LinkType, Locator, Package};
pub use project::{Project, Workspace};

pub type Result<T> = std::result::Result<T, KnotError>;

//! Model management domain — public API.
//!
//! Descriptors come from the registry, live state sits in the catalog, and
//! the lifecycle manager is the only thing that changes it.

pub mod catalog;
pub mod lifecycle;
pub mod registry;
pub mod transfer;

pub use catalog::{CatalogEvent, ModelCatalog, ModelState, ModelStatePatch, ModelStatus};
pub use lifecycle::ModelLifecycleManager;
pub use registry::{builtin_descriptors, find_builtin, ModelDescriptor};
pub use transfer::{Fetcher, HttpFetcher, Transfer, TransferProgress, TransferRequest};

//! repo-lister library
//!
//! Tag listing and image transfer between container registries, with
//! credentials taken from Kubernetes pull secrets.

pub mod archive;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod image;
pub mod logging;
pub mod reference;
pub mod registry;
pub mod tags;
pub mod transfer;

pub use error::{Error, Result};
pub use reference::ImageReference;
pub use registry::{RegistryApi, RegistryClient};
pub use tags::TagResolver;
pub use transfer::Transferer;

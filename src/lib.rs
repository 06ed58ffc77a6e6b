pub mod config;
pub mod cosign;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod reference;
pub mod registry;
pub mod report;
pub mod repos;
pub mod resolve;
pub mod sign;
pub mod signer;
pub mod sigstore;
pub mod snapshot;
pub mod verify;


pub use error::{PipelineError, Result};

/// Architecture tag given to the locally computed digest of a whole
/// manifest list.  Entries carrying it are never signed individually.
pub const MULTIARCH: &str = "multiarch";

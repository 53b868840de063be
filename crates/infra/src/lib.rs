//! Infrastructure layer: job registry, execution contexts, store collaborators,
//! the provisioning and rendering jobs, configuration.

pub mod config;
pub mod jobs;
pub mod provisioning;
pub mod rendering;
pub mod store;

pub use config::{ConfigError, JobIdMode, ServerConfig};
pub use provisioning::{ProvisioningError, ProvisioningRequest, ProvisioningService, ProvisioningStatus};
pub use rendering::{EncodedDocument, RenderedDocument, RenderingService};

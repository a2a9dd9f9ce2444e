//! Deployment over the realtime channel.

mod files;
mod manifest;
mod orchestrator;

pub use files::{DirectorySource, FileSource};
pub use manifest::{hash_content, DeployResult, InstallResult, Manifest, ManifestEntry};
pub use orchestrator::{
    deploy_topic, DeployOptions, DeployRequest, Deployer, DEPLOY_EVENT, INSTALL_EVENT,
    MANIFEST_EVENT, UPLOAD_EVENT,
};

//! Detection and classification: deployment method and stack layers.

pub mod cache;
pub mod deployment;
pub mod layers;

pub use cache::DetectionCache;
pub use deployment::{DeploymentDetector, DeploymentInfo, DeploymentMethod};
pub use layers::{DetectionMethod, Layer, LayerDetector, LayeredIssue, ResourceRef};

//! External Collaborators
//!
//! The gateway depends on three services it does not own: the local
//! inference runtime, the cloud ML API and the deployment manager. Each is
//! a trait here, with a concrete implementation good enough to run the
//! daemon against real endpoints.
//!
//! # Usage
//!
//! ```ignore
//! use gateway_core::backend::{CloudClient, HttpCloudClient};
//!
//! let cloud = HttpCloudClient::from_config(&config.cloud)?;
//! let metadata = cloud.get_detector_metadata("det_2abc").await?;
//! ```

mod deployments;
mod http;
mod traits;

pub use deployments::PendingDeployments;
pub use http::{HttpCloudClient, HttpEdgeInference, API_TOKEN_HEADER};
pub use traits::{
    BoundingBox, CloudClient, CloudError, DeploymentRecorder, DetectorMetadata, DetectorMode,
    EdgeInference, ImageQuery, InferenceError, InferenceOutput, QueryResult, ResultSource, Roi,
};

//! Build output.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::api::{ProvisioningApi, ServerImage};
use crate::error::Result;

/// Identifier of the builder that produced an artifact.
pub const BUILDER_ID: &str = "ncloud.server.image";

/// The server image a successful build produced.
///
/// A build whose OS type selected no steps still succeeds and yields an
/// artifact without an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub region: String,
    pub server_image: Option<ServerImage>,
}

impl Artifact {
    pub fn new(region: impl Into<String>, server_image: Option<ServerImage>) -> Self {
        Self {
            region: region.into(),
            server_image,
        }
    }

    pub fn builder_id(&self) -> &'static str {
        BUILDER_ID
    }

    /// The image number, or an empty string when no image was produced.
    pub fn id(&self) -> String {
        self.server_image
            .as_ref()
            .map(|image| image.image_no.clone())
            .unwrap_or_default()
    }

    pub fn server_image(&self) -> Option<&ServerImage> {
        self.server_image.as_ref()
    }

    /// Named attributes for post-processing: `"region"` and `"image_name"`.
    pub fn state(&self, name: &str) -> Option<Value> {
        match name {
            "region" => Some(Value::String(self.region.clone())),
            "image_name" => self
                .server_image
                .as_ref()
                .map(|image| Value::String(image.name.clone())),
            _ => None,
        }
    }

    /// Delete the produced image.
    pub fn destroy(&self, api: &dyn ProvisioningApi) -> Result<()> {
        if let Some(image) = &self.server_image {
            info!("Deleting server image {} ({})", image.name, image.image_no);
            api.delete_server_image(&image.image_no)?;
        }
        Ok(())
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server_image {
            Some(image) => write!(
                f,
                "Server image '{}' created (image no {}) in region {}",
                image.name, image.image_no, self.region
            ),
            None => write!(f, "No server image was created"),
        }
    }
}

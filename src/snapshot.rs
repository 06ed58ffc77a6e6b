//! Release snapshot parsing.
//!
//! A snapshot is the JSON document describing one released application:
//! its name plus the digest-pinned container image of every component.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One deployed component.  Snapshots in the wild are sparse; absent
/// fields read back as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Component {
    pub name: String,
    #[serde(rename = "containerImage")]
    pub container_image: String,
    pub repository: String,
}

/// A released application snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub application: String,
    pub components: Vec<Component>,
}

impl Snapshot {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// The component pull addresses, in document order.
    pub fn container_images(&self) -> impl Iterator<Item = &str> {
        self.components
            .iter()
            .map(|component| component.container_image.as_str())
    }
}

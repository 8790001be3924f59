//! Read-only inspection of an ingested layer.

use anyhow::Result;
use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use fn_error_context::context;
use serde::Serialize;

use crate::digest::LayerDigest;
use crate::layout;

/// A path that a fully ingested layer should have, but which is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingPath {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LayerStatus {
    Ok,
    Error { errors: Vec<MissingPath> },
}

impl LayerStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Check that every expected path of a layer exists in `repo`. Reported
/// paths are joined to `display_root`.
#[context("Checking status of layer {digest}")]
pub fn layer_status(
    repo: &Dir,
    display_root: &Utf8Path,
    digest: &LayerDigest,
) -> Result<LayerStatus> {
    let mut errors = Vec::new();
    for path in layout::expected_layer_paths(digest) {
        if !repo.try_exists(&path)? {
            errors.push(MissingPath {
                path: display_root.join(&path).into_string(),
                error: "No such file or directory".into(),
            });
        }
    }
    if errors.is_empty() {
        Ok(LayerStatus::Ok)
    } else {
        Ok(LayerStatus::Error { errors })
    }
}

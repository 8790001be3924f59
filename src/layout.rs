//! Where layers live inside a repository.
//!
//! Paths returned here are relative to the repository working tree unless
//! noted otherwise:
//!
//! ```text
//! .layers/<hex[..2]>/                  layer parent, carries a catalog marker
//! .layers/<hex[..2]>/<hex>/rootfs/     unpacked layer, carries a catalog marker
//! .layers/<hex[..2]>/<hex>/metadata/origin.json
//! ```

use camino::{Utf8Path, Utf8PathBuf};

use crate::digest::LayerDigest;
use crate::fsop::CATALOG_MARKER;

/// Toplevel directory holding all unpacked layers.
pub const LAYERS_DIR: &str = ".layers";
const ROOTFS: &str = "rootfs";
const METADATA: &str = "metadata";
const ORIGIN: &str = "origin.json";

/// The absolute path of a repository's working tree.
pub fn repository_path(cvmfs_root: &Utf8Path, repository: &str) -> Utf8PathBuf {
    cvmfs_root.join(repository)
}

/// The fan-out directory containing a layer.
pub fn layer_parent_path(digest: &LayerDigest) -> Utf8PathBuf {
    Utf8Path::new(LAYERS_DIR).join(digest.prefix())
}

pub fn layer_path(digest: &LayerDigest) -> Utf8PathBuf {
    layer_parent_path(digest).join(digest.hex())
}

pub fn layer_rootfs_path(digest: &LayerDigest) -> Utf8PathBuf {
    layer_path(digest).join(ROOTFS)
}

pub fn layer_metadata_path(digest: &LayerDigest) -> Utf8PathBuf {
    layer_path(digest).join(METADATA)
}

pub fn layer_origin_path(digest: &LayerDigest) -> Utf8PathBuf {
    layer_metadata_path(digest).join(ORIGIN)
}

/// Every path a completely ingested layer has, in the order they are checked.
pub fn expected_layer_paths(digest: &LayerDigest) -> [Utf8PathBuf; 5] {
    let rootfs = layer_rootfs_path(digest);
    let catalog = rootfs.join(CATALOG_MARKER);
    [
        layer_path(digest),
        rootfs,
        catalog,
        layer_metadata_path(digest),
        layer_origin_path(digest),
    ]
}

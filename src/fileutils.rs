use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

/// Turn a path from an archive into a path relative to the extraction root.
/// Leading `/` and `.` components are dropped; `..` is rejected. Returns `None`
/// for a path naming the root itself.
pub(crate) fn normalize_relative(path: &Path) -> Result<Option<PathBuf>> {
    let mut r = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => r.push(c),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => anyhow::bail!("Invalid path with `..`: {path:?}"),
            Component::Prefix(_) => anyhow::bail!("Invalid path prefix: {path:?}"),
        }
    }
    Ok((!r.as_os_str().is_empty()).then_some(r))
}

/// The parent of a relative path, or `None` if it is a toplevel name.
pub(crate) fn parent_nonempty(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

/// Remove anything that is not a directory at `path`, so it can be replaced.
/// Returns `true` if something was removed.
pub(crate) fn remove_nondir_optional(d: &Dir, path: &Path) -> Result<bool> {
    match d.symlink_metadata_optional(path)? {
        Some(meta) if !meta.is_dir() => {
            d.remove_file(path)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

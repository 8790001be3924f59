//! Extraction of a tar stream into the repository working tree.

use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use fn_error_context::context;
use rustix::fs::{AtFlags, Mode};

use crate::fileutils::{self, parent_nonempty};
use crate::fsop::FsOperation;

/// Only permission bits (including setuid/setgid/sticky) are preserved.
const MODE_MASK: u32 = 0o7777;

type Verifier<R> = Box<dyn FnOnce(R) -> Result<()> + Send>;

/// Counters gathered while unpacking.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnpackStats {
    /// Entries materialized on disk
    pub entries: u64,
    /// Regular file content written
    pub bytes: u64,
    /// Entries of unsupported types (devices, fifos) that were skipped
    pub skipped: u64,
}

/// Extract an (uncompressed) tar stream into a destination directory.
///
/// Regular files, directories, symbolic links and hard links are supported.
/// Device nodes and fifos are skipped; container layers cannot meaningfully
/// carry them into a CVMFS repository. Extraction stops at the first entry
/// which cannot be materialized; entries written before it are left in place.
pub struct IngestTar<R> {
    src: Option<R>,
    dest: Utf8PathBuf,
    verifier: Option<Verifier<R>>,
    stats: UnpackStats,
}

impl<R> std::fmt::Debug for IngestTar<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestTar")
            .field("dest", &self.dest)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<R: Read + Send + 'static> IngestTar<R> {
    /// `dest` is relative to the repository working tree.
    pub fn new(src: R, dest: impl Into<Utf8PathBuf>) -> Self {
        Self {
            src: Some(src),
            dest: dest.into(),
            verifier: None,
            stats: Default::default(),
        }
    }

    /// Once every entry has been unpacked, hand the remaining stream to `f`.
    /// If it returns an error, that error is recorded for this operation and
    /// the destination directory is removed again.
    pub fn with_verifier<F>(mut self, f: F) -> Self
    where
        F: FnOnce(R) -> Result<()> + Send + 'static,
    {
        self.verifier = Some(Box::new(f));
        self
    }

    pub fn dest(&self) -> &Utf8Path {
        &self.dest
    }

    pub fn stats(&self) -> UnpackStats {
        self.stats
    }

    fn unpack(&mut self, root: &Dir) -> Result<()> {
        let src = self
            .src
            .take()
            .ok_or_else(|| anyhow!("Tar stream was already consumed"))?;
        let dest = fileutils::normalize_relative(self.dest.as_std_path())?
            .ok_or_else(|| anyhow!("Refusing to unpack into the repository root"))?;
        root.create_dir_all(&dest)?;
        let destdir = root.open_dir(&dest)?;

        let mut archive = tar::Archive::new(src);
        unpack_entries(&mut archive, &destdir, &mut self.stats)?;
        tracing::debug!("Unpacked into {}: {:?}", self.dest, self.stats);

        if let Some(verifier) = self.verifier.take() {
            if let Err(e) = verifier(archive.into_inner()) {
                drop(destdir);
                root.remove_dir_all(&dest)
                    .with_context(|| format!("Removing {} after failed verification", self.dest))?;
                return Err(e);
            }
        }
        Ok(())
    }
}

impl<R: Read + Send + 'static> FsOperation for IngestTar<R> {
    fn apply(&mut self, root: &Dir) -> Result<()> {
        self.unpack(root)
            .with_context(|| format!("Unpacking tar into {}", self.dest))
    }

    fn describe(&self) -> String {
        format!("unpack tar into {}", self.dest)
    }
}

fn unpack_entries<R: Read>(
    archive: &mut tar::Archive<R>,
    dest: &Dir,
    stats: &mut UnpackStats,
) -> Result<()> {
    // Directory modes are applied last, so that e.g. a read-only directory
    // can still be populated.
    let mut dir_modes = Vec::new();
    for entry in archive.entries()? {
        let entry = entry.context("Reading tar entry")?;
        let path = entry.path()?.into_owned();
        unpack_entry(entry, &path, dest, stats, &mut dir_modes)
            .with_context(|| format!("Unpacking {path:?}"))?;
    }
    apply_dir_modes(dest, &dir_modes)
}

#[context("Applying directory modes")]
fn apply_dir_modes(dest: &Dir, dir_modes: &[(PathBuf, u32)]) -> Result<()> {
    for (path, mode) in dir_modes.iter().rev() {
        rustix::fs::chmodat(dest, path, Mode::from_raw_mode(*mode), AtFlags::empty())
            .with_context(|| format!("Setting mode of {path:?}"))?;
    }
    Ok(())
}

/// Open the parent directory of `path` (which must be normalized) and
/// return it along with the final path component.
fn open_parent<'p>(dest: &Dir, path: &'p Path) -> Result<(Dir, &'p OsStr)> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("Invalid path {path:?}"))?;
    let parent = match parent_nonempty(path) {
        Some(parent) => dest.open_dir(parent)?,
        None => dest.try_clone()?,
    };
    Ok((parent, name))
}

fn link_target<R: Read>(entry: &tar::Entry<R>) -> Result<PathBuf> {
    entry
        .link_name()
        .context("linkname")?
        .map(|t| t.into_owned())
        .ok_or_else(|| anyhow!("Missing link target"))
}

fn unpack_entry<R: Read>(
    mut entry: tar::Entry<R>,
    path: &Path,
    dest: &Dir,
    stats: &mut UnpackStats,
    dir_modes: &mut Vec<(PathBuf, u32)>,
) -> Result<()> {
    let Some(path) = fileutils::normalize_relative(path)? else {
        // The root of the archive itself
        return Ok(());
    };
    let header = entry.header();
    let etype = header.entry_type();
    let mode = header.mode().context("mode")? & MODE_MASK;

    if let Some(parent) = parent_nonempty(&path) {
        dest.create_dir_all(parent)
            .with_context(|| format!("Creating parents for {path:?}"))?;
    }

    match etype {
        tar::EntryType::Regular | tar::EntryType::Continuous => {
            fileutils::remove_nondir_optional(dest, &path)?;
            let mut f = dest.create(&path)?;
            let n = std::io::copy(&mut entry, &mut f)?;
            rustix::fs::fchmod(&f, Mode::from_raw_mode(mode))?;
            stats.bytes += n;
        }
        tar::EntryType::Directory => {
            dest.create_dir_all(&path)?;
            dir_modes.push((path, mode));
        }
        tar::EntryType::Symlink => {
            let target = link_target(&entry)?;
            fileutils::remove_nondir_optional(dest, &path)?;
            let (parent, name) = open_parent(dest, &path)?;
            rustix::fs::symlinkat(&target, &parent, name)
                .with_context(|| format!("symlinking {path:?} to {target:?}"))?;
        }
        tar::EntryType::Link => {
            let target = link_target(&entry)?;
            let target = fileutils::normalize_relative(&target)?
                .ok_or_else(|| anyhow!("Invalid hardlink target {target:?}"))?;
            fileutils::remove_nondir_optional(dest, &path)?;
            dest.hard_link(&target, dest, &path)
                .with_context(|| format!("hardlinking {path:?} to {target:?}"))?;
        }
        // Extension headers which the tar crate did not fold into an entry
        tar::EntryType::XGlobalHeader | tar::EntryType::XHeader => return Ok(()),
        o => {
            tracing::warn!("Skipping unsupported entry {path:?} of type {o:?}");
            stats.skipped += 1;
            return Ok(());
        }
    }
    stats.entries += 1;
    Ok(())
}

//! Filesystem operations: units of work applied to a repository working tree
//! while a transaction is open.
//!
//! A submitter wraps a concrete [`FsOperation`] in an [`Operation`] handle,
//! hands a type-erased clone of it to the scheduler, and keeps its own clone to
//! read the outcome once the batch has completed.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;

use crate::fileutils;

/// The file which makes CVMFS treat its directory as a nested catalog.
pub const CATALOG_MARKER: &str = ".cvmfscatalog";

/// A mutation of the repository working tree.
pub trait FsOperation: Send + 'static {
    /// Apply this operation to `root`, the working tree of the open transaction.
    fn apply(&mut self, root: &Dir) -> Result<()>;

    /// A short human readable description, used in logs.
    fn describe(&self) -> String;
}

/// The lifecycle of an [`Operation`]. Terminal states never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Applied,
    Failed,
}

/// A shared handle to an operation and its outcome.
pub struct Operation<T> {
    op: Mutex<T>,
    outcome: OnceLock<Option<anyhow::Error>>,
}

impl<T: FsOperation> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("state", &self.state())
            .finish()
    }
}

impl<T: FsOperation> Operation<T> {
    pub fn new(op: T) -> Arc<Self> {
        Arc::new(Self {
            op: Mutex::new(op),
            outcome: OnceLock::new(),
        })
    }

    pub fn state(&self) -> OperationState {
        match self.outcome.get() {
            None => OperationState::Pending,
            Some(None) => OperationState::Applied,
            Some(Some(_)) => OperationState::Failed,
        }
    }

    /// The error recorded when this operation was applied, if it failed.
    /// Always `None` while the operation is pending.
    pub fn first_error(&self) -> Option<&anyhow::Error> {
        self.outcome.get().and_then(|e| e.as_ref())
    }

    /// Access the wrapped operation, e.g. to read statistics it recorded.
    /// Blocks while the scheduler is applying it.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        // SAFETY: This just propagates panics, which is OK
        self.op.lock().unwrap()
    }

    /// A type-erased clone of this handle, suitable for submission.
    pub fn scheduled(self: &Arc<Self>) -> Arc<dyn ScheduledOperation> {
        Arc::clone(self) as Arc<dyn ScheduledOperation>
    }
}

/// The view of an operation the scheduler works with.
///
/// Applying and completing are separate steps: an operation applied inside a
/// transaction only reaches a terminal state once that transaction has been
/// published or aborted.
pub trait ScheduledOperation: Send + Sync {
    /// Apply the operation, returning its own result without recording it.
    /// An operation which already reached a terminal state is left untouched.
    fn run(&self, root: &Dir) -> Result<()>;

    /// Record the outcome. Only the first call has an effect.
    fn complete(&self, outcome: Result<()>);

    fn state(&self) -> OperationState;

    fn describe(&self) -> String;
}

impl<T: FsOperation> ScheduledOperation for Operation<T> {
    fn run(&self, root: &Dir) -> Result<()> {
        if self.outcome.get().is_some() {
            tracing::warn!("Not reapplying completed operation: {}", self.describe());
            return Ok(());
        }
        let mut op = self.lock();
        tracing::debug!("Applying: {}", op.describe());
        op.apply(root)
    }

    fn complete(&self, outcome: Result<()>) {
        let _ = self.outcome.set(outcome.err());
    }

    fn state(&self) -> OperationState {
        Operation::state(self)
    }

    fn describe(&self) -> String {
        self.lock().describe()
    }
}

/// Ensure a catalog marker exists in a directory, creating the directory
/// and its parents as needed. An existing marker is not an error.
#[derive(Debug)]
pub struct AddCatalog {
    path: Utf8PathBuf,
    created: bool,
}

impl AddCatalog {
    /// `path` is relative to the repository working tree.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: false,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// True if the marker did not exist and was created by this operation.
    pub fn created(&self) -> bool {
        self.created
    }

    fn ensure_marker(&mut self, root: &Dir) -> Result<()> {
        let d = match fileutils::normalize_relative(self.path.as_std_path())? {
            Some(path) => {
                root.create_dir_all(&path)?;
                root.open_dir(&path)?
            }
            None => root.try_clone()?,
        };
        if d.try_exists(CATALOG_MARKER)? {
            return Ok(());
        }
        d.create(CATALOG_MARKER)?;
        self.created = true;
        Ok(())
    }
}

impl FsOperation for AddCatalog {
    fn apply(&mut self, root: &Dir) -> Result<()> {
        self.ensure_marker(root)
            .with_context(|| format!("Adding catalog marker in {}", self.path))
    }

    fn describe(&self) -> String {
        format!("add catalog {}", self.path)
    }
}

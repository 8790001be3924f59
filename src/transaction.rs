//! Repository transactions.
//!
//! A [`RepositoryBackend`] provides the begin/publish/abort primitives of the
//! repository; [`TransactionDriver`] tracks the lifecycle of one transaction
//! at a time on top of it and applies operations while it is open.

use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use fn_error_context::context;

use crate::fsop::ScheduledOperation;

/// The transaction primitives of a repository.
pub trait RepositoryBackend: Send + 'static {
    /// Open a transaction, returning the writable working tree.
    fn begin(&mut self) -> Result<Dir>;

    /// Commit everything written to the working tree since [`Self::begin`].
    fn publish(&mut self) -> Result<()>;

    /// Discard everything written to the working tree since [`Self::begin`].
    fn abort(&mut self) -> Result<()>;
}

/// Drives `cvmfs_server` for a repository mounted under the CVMFS root.
#[derive(Debug)]
pub struct CvmfsServerBackend {
    repository: String,
    working_tree: Utf8PathBuf,
    cvmfs_server: Utf8PathBuf,
}

impl CvmfsServerBackend {
    pub fn new(repository: &str, cvmfs_root: &Utf8Path, cvmfs_server: &Utf8Path) -> Self {
        Self {
            repository: repository.to_owned(),
            working_tree: cvmfs_root.join(repository),
            cvmfs_server: cvmfs_server.to_owned(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new(&self.cvmfs_server);
        cmd.args(args)
            .arg(&self.repository)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        tracing::debug!("exec: {cmd:?}");
        let st = cmd
            .status()
            .with_context(|| format!("Spawning {}", self.cvmfs_server))?;
        if !st.success() {
            anyhow::bail!("{} {} failed: {st:?}", self.cvmfs_server, args.join(" "));
        }
        Ok(())
    }
}

impl RepositoryBackend for CvmfsServerBackend {
    #[context("Opening transaction on {}", self.repository)]
    fn begin(&mut self) -> Result<Dir> {
        self.run(&["transaction"])?;
        let tree = Dir::open_ambient_dir(&self.working_tree, cap_std::ambient_authority())
            .with_context(|| format!("Opening {}", self.working_tree));
        if tree.is_err() {
            if let Err(e) = self.run(&["abort", "-f"]) {
                tracing::error!("Failed to abort transaction: {e:#}");
            }
        }
        tree
    }

    #[context("Publishing {}", self.repository)]
    fn publish(&mut self) -> Result<()> {
        self.run(&["publish"])
    }

    #[context("Aborting transaction on {}", self.repository)]
    fn abort(&mut self) -> Result<()> {
        self.run(&["abort", "-f"])
    }
}

/// A plain directory without transactional semantics: writes are visible
/// immediately and an abort cannot roll anything back. Intended for
/// development and testing without a CVMFS installation.
#[derive(Debug)]
pub struct DirectoryBackend {
    dir: Dir,
}

impl DirectoryBackend {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    #[context("Opening {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Ok(Self::new(dir))
    }
}

impl RepositoryBackend for DirectoryBackend {
    fn begin(&mut self) -> Result<Dir> {
        self.dir.try_clone().map_err(Into::into)
    }

    fn publish(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        tracing::warn!("Directory backend cannot roll back; changes remain in place");
        Ok(())
    }
}

/// State of the transaction driven by a [`TransactionDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Closed,
    Open,
}

/// An operation applied in the open transaction, with its own result.
type Staged = (Arc<dyn ScheduledOperation>, Result<()>);

/// Owns a backend and enforces that exactly one of publish or abort
/// follows every successful open.
///
/// Operations applied in a transaction are completed when it closes: with
/// their own result once it is published, or as failed if it is aborted.
pub struct TransactionDriver<B> {
    backend: B,
    working_tree: Option<Dir>,
    staged: Vec<Staged>,
    /// Number of transactions published through this driver
    published: u64,
}

impl<B: RepositoryBackend> TransactionDriver<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            working_tree: None,
            staged: Vec::new(),
            published: 0,
        }
    }

    pub fn state(&self) -> TransactionState {
        if self.working_tree.is_some() {
            TransactionState::Open
        } else {
            TransactionState::Closed
        }
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn open(&mut self) -> Result<()> {
        if self.working_tree.is_some() {
            anyhow::bail!("A transaction is already open");
        }
        let tree = self.backend.begin()?;
        tracing::debug!("Opened transaction");
        self.working_tree = Some(tree);
        Ok(())
    }

    /// Apply operations in order. A failing operation records its own error
    /// and does not prevent the remaining operations from being applied.
    pub fn apply(&mut self, ops: &[Arc<dyn ScheduledOperation>]) -> Result<()> {
        let Some(tree) = self.working_tree.as_ref() else {
            anyhow::bail!("No transaction is open");
        };
        for op in ops {
            let r = op.run(tree);
            if let Err(e) = &r {
                tracing::debug!("Operation failed: {e:#}");
            }
            self.staged.push((Arc::clone(op), r));
        }
        Ok(())
    }

    /// Commit the open transaction. The transaction is closed whether or not
    /// this succeeds; on failure the backend is asked to abort.
    pub fn publish(&mut self) -> Result<()> {
        let Some(tree) = self.working_tree.take() else {
            anyhow::bail!("No transaction is open");
        };
        drop(tree);
        if let Err(e) = self.backend.publish() {
            if let Err(abort_err) = self.backend.abort() {
                tracing::error!("Failed to abort after failed publish: {abort_err:#}");
            }
            self.fail_staged(&format!("{e:#}"));
            return Err(e);
        }
        for (op, r) in self.staged.drain(..) {
            op.complete(r);
        }
        self.published += 1;
        tracing::debug!("Published transaction");
        Ok(())
    }

    pub fn abort(&mut self) -> Result<()> {
        let Some(tree) = self.working_tree.take() else {
            anyhow::bail!("No transaction is open");
        };
        drop(tree);
        self.fail_staged("transaction aborted");
        self.backend.abort()
    }

    fn fail_staged(&mut self, reason: &str) {
        for (op, _) in self.staged.drain(..) {
            op.complete(Err(anyhow::anyhow!("Transaction was not published: {reason}")));
        }
    }
}

//! Process configuration, resolved once at startup and passed explicitly to
//! the components that need it.

use std::thread::JoinHandle;

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::layout;
use crate::scheduler::{new_scheduler, LoopStats, SchedulerHandle};
use crate::transaction::{CvmfsServerBackend, DirectoryBackend, RepositoryBackend};

/// Default bound on the operations drained into one transaction.
pub const DEFAULT_MAX_BATCH_OPERATIONS: usize = 64;

/// How repository transactions are opened and published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Run `cvmfs_server transaction|publish|abort`
    CvmfsServer,
    /// Write directly into the repository path, without transactions
    Directory,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the repository, e.g. `unpacked.cern.ch`
    pub repository: String,
    /// Directory under which repositories are mounted
    pub cvmfs_root: Utf8PathBuf,
    pub backend: BackendKind,
    /// The `cvmfs_server` executable; looked up in `PATH` if relative
    pub cvmfs_server: Utf8PathBuf,
    pub max_batch_operations: usize,
    pub verify_digest: bool,
}

impl Config {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            cvmfs_root: "/cvmfs".into(),
            backend: BackendKind::CvmfsServer,
            cvmfs_server: "cvmfs_server".into(),
            max_batch_operations: DEFAULT_MAX_BATCH_OPERATIONS,
            verify_digest: true,
        }
    }

    /// The absolute path of the repository working tree.
    pub fn repository_path(&self) -> Utf8PathBuf {
        layout::repository_path(&self.cvmfs_root, &self.repository)
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.repository.as_str();
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            anyhow::bail!("Invalid repository name: {name:?}");
        }
        if self.max_batch_operations == 0 {
            anyhow::bail!("The maximum operations per transaction must be positive");
        }
        Ok(())
    }

    /// Create the configured backend and run a scheduler for it on its own
    /// thread.
    pub fn start_scheduler(&self) -> Result<(SchedulerHandle, JoinHandle<LoopStats>)> {
        self.validate()?;
        tracing::debug!("Starting scheduler: {self:?}");
        match self.backend {
            BackendKind::CvmfsServer => {
                let backend = CvmfsServerBackend::new(
                    &self.repository,
                    &self.cvmfs_root,
                    &self.cvmfs_server,
                );
                self.spawn(backend)
            }
            BackendKind::Directory => {
                let backend = DirectoryBackend::open(&self.repository_path())?;
                self.spawn(backend)
            }
        }
    }

    fn spawn<B: RepositoryBackend>(
        &self,
        backend: B,
    ) -> Result<(SchedulerHandle, JoinHandle<LoopStats>)> {
        let (handle, worker) = new_scheduler(backend, self.max_batch_operations);
        Ok((handle, worker.spawn()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsop::{AddCatalog, Operation, OperationState};

    #[test]
    fn test_validate() {
        let config = Config::new("unpacked.cern.ch");
        config.validate().unwrap();
        assert_eq!(config.repository_path(), "/cvmfs/unpacked.cern.ch");
        for name in ["", "..", "a/b"] {
            assert!(Config::new(name).validate().is_err(), "{name}");
        }
        let config = Config {
            max_batch_operations: 0,
            ..Config::new("unpacked.cern.ch")
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_directory_scheduler() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_owned())?;
        std::fs::create_dir(root.join("test.local"))?;
        let config = Config {
            cvmfs_root: root.clone(),
            backend: BackendKind::Directory,
            ..Config::new("test.local")
        };

        let (handle, worker) = config.start_scheduler()?;
        let op = Operation::new(AddCatalog::new(".layers/00"));
        handle.submit([op.scheduled()]).await?;
        assert_eq!(op.state(), OperationState::Applied);
        assert!(root.join("test.local/.layers/00/.cvmfscatalog").exists());

        handle.shutdown();
        let stats = worker.join().unwrap();
        assert_eq!(stats.transactions, 1);
        Ok(())
    }

    #[test]
    fn test_missing_repository() {
        let config = Config {
            cvmfs_root: "/nonexistent-cvmfs-root".into(),
            backend: BackendKind::Directory,
            ..Config::new("test.local")
        };
        assert!(config.start_scheduler().is_err());
    }
}

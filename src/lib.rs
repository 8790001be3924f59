use std::ffi::OsString;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use clap::Parser;

mod cli;
pub mod config;
pub mod digest;
mod fileutils;
pub mod fsop;
pub mod hashreader;
pub mod ingest;
pub mod layout;
pub mod scheduler;
pub mod status;
pub mod transaction;
pub mod unpack;

use config::{BackendKind, Config, DEFAULT_MAX_BATCH_OPERATIONS};
use digest::LayerDigest;

/// Options for specifying the repository
#[derive(Debug, Parser)]
pub(crate) struct RepoOpts {
    /// Name of the CVMFS repository, e.g. unpacked.cern.ch
    #[clap(long, value_parser)]
    repo: String,

    /// Directory under which repositories are mounted
    #[clap(long, value_parser, default_value = "/cvmfs")]
    cvmfs_root: Utf8PathBuf,
}

impl RepoOpts {
    pub(crate) fn repository_path(&self) -> Utf8PathBuf {
        layout::repository_path(&self.cvmfs_root, &self.repo)
    }

    pub(crate) fn open(&self) -> Result<Dir> {
        let path = self.repository_path();
        Dir::open_ambient_dir(&path, cap_std::ambient_authority())
            .with_context(|| format!("Opening {path}"))
    }
}

/// Options for ingesting layers.
#[derive(Debug, Parser)]
pub(crate) struct IngestOpts {
    #[clap(flatten)]
    repo_opts: RepoOpts,

    /// How repository transactions are opened and published
    #[clap(long, value_enum, default_value_t = BackendKind::CvmfsServer)]
    backend: BackendKind,

    /// Path to the cvmfs_server executable
    #[clap(long, value_parser, default_value = "cvmfs_server")]
    cvmfs_server: Utf8PathBuf,

    /// Maximum number of operations applied in one transaction
    #[clap(long, default_value_t = DEFAULT_MAX_BATCH_OPERATIONS)]
    max_batch_operations: usize,

    /// Do not check that the compressed layer matches its digest
    #[clap(long)]
    no_verify_digest: bool,

    /// Ingest the layer under this digest instead of the one computed
    /// from its content; requires exactly one layer
    #[clap(long, value_parser)]
    digest: Option<LayerDigest>,

    /// Gzip compressed layer tarballs
    #[clap(required = true)]
    layers: Vec<Utf8PathBuf>,
}

impl IngestOpts {
    pub(crate) fn config(&self) -> Config {
        Config {
            repository: self.repo_opts.repo.clone(),
            cvmfs_root: self.repo_opts.cvmfs_root.clone(),
            backend: self.backend,
            cvmfs_server: self.cvmfs_server.clone(),
            max_batch_operations: self.max_batch_operations,
            verify_digest: !self.no_verify_digest,
        }
    }
}

/// Options for inspecting a layer.
#[derive(Debug, Parser)]
pub(crate) struct StatusOpts {
    #[clap(flatten)]
    repo_opts: RepoOpts,

    /// Output JSON
    #[clap(long)]
    json: bool,

    /// Layer digest
    #[clap(value_parser)]
    digest: LayerDigest,
}

/// Toplevel options
#[derive(Debug, Parser)]
#[clap(name = "cvmfs-ingest")]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Unpack container image layers into a repository
    Ingest(IngestOpts),
    /// Check that a layer was completely ingested
    Status(StatusOpts),
    /// Print the digest and size of files
    Hash {
        /// Files to hash
        #[clap(required = true)]
        paths: Vec<Utf8PathBuf>,
    },
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Ingest(opts) => cli::ingest(opts).await,
        Opt::Status(opts) => cli::status(opts),
        Opt::Hash { paths } => cli::hash(&paths),
    }
}

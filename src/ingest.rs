//! The layer ingestion pipeline.
//!
//! A layer arrives as a gzip compressed tar stream together with the digest
//! it is addressed by. It is unpacked into `.layers/<aa>/<digest>/rootfs` in
//! two scheduler submissions: first the catalog markers, then the extraction.

use std::io::{BufReader, Read};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Context, Result};
use flate2::bufread::MultiGzDecoder;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;

use crate::digest::LayerDigest;
use crate::fsop::{AddCatalog, Operation, OperationState};
use crate::hashreader::HashingReader;
use crate::layout;
use crate::scheduler::SchedulerHandle;
use crate::unpack::IngestTar;

/// The decompressing view of a request body. A body may consist of several
/// concatenated gzip members.
type LayerBody<R> = MultiGzDecoder<BufReader<HashingReader<R>>>;

/// The result of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct IngestedLayer {
    /// The digest in `sha256:<hex>` form
    pub digest: String,
    /// Size of the compressed body
    pub compressed_size: u64,
    pub entries: u64,
    pub bytes: u64,
    pub skipped: u64,
}

/// The reply for one ingestion request, as serialized to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LayerReply {
    Created(IngestedLayer),
    Error { digest: String, message: String },
}

impl LayerReply {
    pub fn new(digest: &LayerDigest, r: &Result<IngestedLayer>) -> Self {
        match r {
            Ok(layer) => Self::Created(layer.clone()),
            Err(e) => Self::Error {
                digest: digest.to_descriptor_digest(),
                message: format!("{e:#}"),
            },
        }
    }

    /// Every failure is reported as a server side fault.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Created(_) => 201,
            Self::Error { .. } => 500,
        }
    }
}

/// Drives layer ingestion through a scheduler.
#[derive(Debug, Clone)]
pub struct LayerIngester {
    scheduler: SchedulerHandle,
    verify_digest: bool,
}

impl LayerIngester {
    /// If `verify_digest` is set, the sha256 of the compressed body must
    /// match the digest a layer is ingested under.
    pub fn new(scheduler: SchedulerHandle, verify_digest: bool) -> Self {
        Self {
            scheduler,
            verify_digest,
        }
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Ingest a gzip compressed tar stream as the layer `digest`.
    ///
    /// A body that is not gzip compressed is rejected before anything is
    /// submitted. The catalog markers of a failed ingestion may remain in
    /// place; ingesting the same layer again is safe.
    pub async fn ingest_layer_filesystem<R>(
        &self,
        digest: &LayerDigest,
        body: R,
    ) -> Result<IngestedLayer>
    where
        R: Read + Send + 'static,
    {
        tracing::info!("Receiving layer {digest}");
        let body = tokio::task::spawn_blocking(move || open_layer_body(body)).await??;

        let parent = Operation::new(AddCatalog::new(layout::layer_parent_path(digest)));
        let rootfs_path = layout::layer_rootfs_path(digest);
        let rootfs = Operation::new(AddCatalog::new(rootfs_path.clone()));
        self.scheduler
            .submit([parent.scheduled(), rootfs.scheduled()])
            .await
            .context("Adding layer catalogs")?;
        for op in [&parent, &rootfs] {
            if let Some(e) = op.first_error() {
                return Err(anyhow!("{e:#}"));
            }
        }

        let body_digest = Arc::new(OnceLock::new());
        let expected = self.verify_digest.then(|| digest.clone());
        let verifier = {
            let body_digest = Arc::clone(&body_digest);
            move |body: LayerBody<R>| -> Result<()> {
                let (found, size) = finish_layer_body(body)?;
                let _ = body_digest.set(size);
                match expected {
                    Some(expected) if expected != found => {
                        anyhow::bail!("Digest mismatch: expected {expected}, found {found}")
                    }
                    _ => Ok(()),
                }
            }
        };
        let extract = Operation::new(IngestTar::new(body, rootfs_path).with_verifier(verifier));
        self.scheduler
            .submit([extract.scheduled()])
            .await
            .context("Unpacking layer")?;
        if let Some(e) = extract.first_error() {
            return Err(anyhow!("{e:#}"));
        }
        if extract.state() != OperationState::Applied {
            anyhow::bail!("Unpacking layer {digest} was not attempted");
        }

        let stats = extract.lock().stats();
        let layer = IngestedLayer {
            digest: digest.to_descriptor_digest(),
            compressed_size: body_digest.get().copied().unwrap_or_default(),
            entries: stats.entries,
            bytes: stats.bytes,
            skipped: stats.skipped,
        };
        tracing::info!(
            "Ingested layer {digest}: {} entries, {} bytes",
            layer.entries,
            layer.bytes
        );
        Ok(layer)
    }

    /// Like [`Self::ingest_layer_filesystem`], for an asynchronous body such
    /// as a request stream.
    pub async fn ingest_layer_filesystem_async<R>(
        &self,
        digest: &LayerDigest,
        body: R,
    ) -> Result<IngestedLayer>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.ingest_layer_filesystem(digest, SyncIoBridge::new(body))
            .await
    }
}

/// Wrap a body for hashing and decompression, reading the gzip header.
fn open_layer_body<R: Read>(body: R) -> Result<LayerBody<R>> {
    let body = BufReader::new(HashingReader::new(body)?);
    let decoder = MultiGzDecoder::new(body);
    if decoder.header().is_none() {
        anyhow::bail!("Layer body is not gzip compressed");
    }
    Ok(decoder)
}

/// Consume what remains of a body after the tar stream ended, returning the
/// digest and size of the whole compressed body.
fn finish_layer_body<R: Read>(mut body: LayerBody<R>) -> Result<(LayerDigest, u64)> {
    // Reading to the end checks the trailer of every gzip member.
    std::io::copy(&mut body, &mut std::io::sink()).context("Reading compressed layer")?;
    // Bytes still buffered here were already hashed.
    let mut body = body.into_inner().into_inner();
    body.drain().context("Reading layer body")?;
    Ok((body.finish_digest()?, body.size()))
}

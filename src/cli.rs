use std::io::Write;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use comfy_table::Cell;
use fn_error_context::context;

use crate::digest::LayerDigest;
use crate::hashreader::HashingReader;
use crate::ingest::{LayerIngester, LayerReply};
use crate::status::{layer_status, LayerStatus};

#[context("Hashing {path}")]
fn hash_file(path: &Utf8Path) -> Result<(LayerDigest, u64)> {
    let f = std::fs::File::open(path)?;
    let mut r = HashingReader::new(f)?;
    r.drain()?;
    Ok((r.finish_digest()?, r.size()))
}

async fn ingest_file(
    ingester: LayerIngester,
    path: Utf8PathBuf,
    digest: Option<LayerDigest>,
) -> Result<LayerReply> {
    let digest = match digest {
        Some(digest) => digest,
        None => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || hash_file(&path))
                .await??
                .0
        }
    };
    let f = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("Opening {path}"))?;
    let r = ingester.ingest_layer_filesystem_async(&digest, f).await;
    if let Err(e) = &r {
        tracing::error!("Ingesting {path}: {e:#}");
    }
    Ok(LayerReply::new(&digest, &r))
}

pub(crate) async fn ingest(opts: crate::IngestOpts) -> Result<()> {
    if opts.digest.is_some() && opts.layers.len() != 1 {
        anyhow::bail!("--digest requires exactly one layer");
    }
    let config = opts.config();
    let (scheduler, worker) = config.start_scheduler()?;
    let ingester = LayerIngester::new(scheduler.clone(), config.verify_digest);
    let start = Instant::now();

    let mut tasks = tokio::task::JoinSet::new();
    for path in opts.layers {
        tasks.spawn(ingest_file(ingester.clone(), path, opts.digest.clone()));
    }
    let mut replies = Vec::new();
    let mut errors = Vec::new();
    while let Some(r) = tasks.join_next().await {
        match r? {
            Ok(reply) => replies.push(reply),
            Err(e) => errors.push(e),
        }
    }

    // Let any open transaction finish before exiting.
    scheduler.shutdown();
    let stats = tokio::task::spawn_blocking(move || worker.join())
        .await?
        .map_err(|_| anyhow!("Operations loop panicked"))?;
    tracing::debug!("Operations loop: {stats:?}");

    let mut stdout = std::io::stdout().lock();
    let mut failed = errors.len();
    let mut ingested_size = 0;
    for reply in replies.iter() {
        match reply {
            LayerReply::Created(layer) => ingested_size += layer.compressed_size,
            LayerReply::Error { .. } => failed += 1,
        }
        serde_json::to_writer(&mut stdout, reply)?;
        writeln!(stdout)?;
    }
    stdout.flush()?;
    tracing::info!(
        "Ingested {} layers ({}) in {} transactions, {}",
        replies.len() + errors.len() - failed,
        indicatif::HumanBytes(ingested_size),
        stats.transactions,
        indicatif::HumanDuration(start.elapsed())
    );
    for e in errors.iter() {
        tracing::error!("{e:#}");
    }
    if failed > 0 {
        anyhow::bail!("Failed to ingest {failed} layers");
    }
    Ok(())
}

pub(crate) fn status(opts: crate::StatusOpts) -> Result<()> {
    let repo = opts.repo_opts.open()?;
    let root = opts.repo_opts.repository_path();
    let status = layer_status(&repo, &root, &opts.digest)?;
    if opts.json {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer(&mut stdout, &status)?;
        writeln!(stdout)?;
    } else {
        match &status {
            LayerStatus::Ok => println!("{}: ok", opts.digest.to_descriptor_digest()),
            LayerStatus::Error { errors } => {
                let mut table = comfy_table::Table::new();
                table.set_header(vec!["PATH", "ERROR"]);
                for e in errors {
                    table.add_row([Cell::new(&e.path), Cell::new(&e.error)]);
                }
                println!("{table}");
            }
        }
    }
    if !status.is_ok() {
        anyhow::bail!("Layer {} is incomplete", opts.digest);
    }
    Ok(())
}

pub(crate) fn hash(paths: &[Utf8PathBuf]) -> Result<()> {
    let mut table = comfy_table::Table::new();
    table.set_header(vec!["DIGEST", "SIZE", "PATH"]);
    for path in paths {
        let (digest, size) = hash_file(path)?;
        table.add_row([
            Cell::new(digest.to_descriptor_digest()),
            Cell::new(indicatif::HumanBytes(size)),
            Cell::new(path),
        ]);
    }
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_file() -> Result<()> {
        let mut tf = tempfile::NamedTempFile::new()?;
        tf.write_all(b"")?;
        let path = Utf8Path::from_path(tf.path()).unwrap();
        let (digest, size) = hash_file(path)?;
        assert_eq!(
            digest.hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(size, 0);

        let e = hash_file(Utf8Path::new("/nonexistent/layer.tar.gz")).unwrap_err();
        assert!(format!("{e:#}").contains("Hashing /nonexistent"));
        Ok(())
    }
}

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use itertools::Itertools;
use path_tools::WithAdditionalExtension;
use serde::Serialize;
use tracing::info;

use crate::em::EmResult;
use crate::util::constants::EPSILON;
use crate::util::em_types::{CompatibilityStore, Transcripts};

fn create_writer(path: &Path) -> anyhow::Result<BufWriter<File>> {
    let write = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("couldn't create output file {}", path.display()))?;
    Ok(BufWriter::new(write))
}

/// Write the proportion vectors: the entry count, then the converged
/// proportions, then the final (corrected) proportions.
pub fn write_theta<W: Write>(
    mut writer: W,
    theta_converged: &[f64],
    theta: &[f64],
) -> anyhow::Result<()> {
    writeln!(writer, "{}", theta.len())?;
    writeln!(writer, "{}", theta_converged.iter().join(" "))?;
    writeln!(writer, "{}", theta.iter().join(" "))?;
    Ok(())
}

/// Per-transcript abundance normalized by effective length: `theta / eel`
/// over the transcripts with a non-zero effective length, renormalized to
/// sum to one. Entry 0 is always 0.
pub fn compute_tau(theta: &[f64], eel: &[f64]) -> anyhow::Result<Vec<f64>> {
    let mut tau = vec![0.0_f64; theta.len()];
    let mut denom = 0.0_f64;
    for i in 1..theta.len() {
        if eel[i] >= EPSILON {
            tau[i] = theta[i] / eel[i];
            denom += tau[i];
        }
    }
    if denom <= 0.0 {
        anyhow::bail!("no transcript received any abundance; cannot compute tau");
    }
    tau.iter_mut().for_each(|t| *t /= denom);
    Ok(tau)
}

/// Write the transcript-level and gene-level expression tables.
pub fn write_expression(
    isoform_path: &Path,
    gene_path: &Path,
    txps: &Transcripts,
    res: &EmResult,
) -> anyhow::Result<()> {
    let tau = compute_tau(&res.theta, &res.eel)?;

    let mut writer = create_writer(isoform_path)?;
    writeln!(
        writer,
        "transcript_id\tgene_id\tlength\teffective_length\texpected_count\ttau\ttpm"
    )?;
    for (tid, t) in txps.iter().enumerate().map(|(i, t)| (i + 1, t)) {
        writeln!(
            writer,
            "{}\t{}\t{}\t{:.2}\t{:.2}\t{}\t{:.2}",
            t.transcript_id,
            t.gene_id,
            t.full_len,
            res.eel[tid],
            res.expected_counts[tid],
            tau[tid],
            tau[tid] * 1e6
        )?;
    }
    writer.flush()?;

    let mut writer = create_writer(gene_path)?;
    writeln!(writer, "gene_id\ttranscript_ids\texpected_count\ttau\ttpm")?;
    for g in 0..txps.num_genes() {
        let range = txps.gene_range(g);
        let gene_id = &txps.get(range.start).gene_id;
        let ids = range.clone().map(|tid| &txps.get(tid).transcript_id).join(",");
        let count: f64 = res.expected_counts[range.clone()].iter().sum();
        let gene_tau: f64 = tau[range].iter().sum();
        writeln!(
            writer,
            "{}\t{}\t{:.2}\t{}\t{:.2}",
            gene_id,
            ids,
            count,
            gene_tau,
            gene_tau * 1e6
        )?;
    }
    writer.flush()?;

    info!(
        "wrote expression estimates to {} and {}.",
        isoform_path.display(),
        gene_path.display()
    );
    Ok(())
}

/// Write the per-fragment responsibilities for an external sampler. The
/// header holds the number of transcripts and of unalignable fragments;
/// then every fragment with at least one non-negligible responsibility
/// gets a line of `id value` pairs (id 0 is noise).
pub fn write_sampler_input<'a, W, I>(
    mut writer: W,
    num_transcripts: usize,
    n0: u64,
    shards: I,
) -> anyhow::Result<usize>
where
    W: Write,
    I: IntoIterator<Item = (&'a CompatibilityStore, &'a [f64])>,
{
    writeln!(writer, "{} {}", num_transcripts, n0)?;
    let mut num_written = 0_usize;
    for (store, noise_probs) in shards {
        for (hits, &noise) in store.iter().zip(noise_probs) {
            let noise_entry = (noise >= EPSILON).then_some((0_u32, noise));
            let entries = noise_entry
                .into_iter()
                .chain(
                    hits.iter()
                        .filter(|h| h.con_prb >= EPSILON)
                        .map(|h| (h.tid, h.con_prb)),
                )
                .map(|(id, v)| format!("{} {}", id, v))
                .join(" ");
            if !entries.is_empty() {
                writeln!(writer, "{}", entries)?;
                num_written += 1;
            }
        }
    }
    Ok(num_written)
}

/// Write the sampler input to `<prefix>.ofg`, or lz4 compressed to
/// `<prefix>.ofg.lz4`. Returns the path written.
pub fn write_sampler_file<'a, I>(
    prefix: &Path,
    compressed: bool,
    num_transcripts: usize,
    n0: u64,
    shards: I,
) -> anyhow::Result<PathBuf>
where
    I: IntoIterator<Item = (&'a CompatibilityStore, &'a [f64])>,
{
    let path = prefix.to_path_buf().with_additional_extension(".ofg");
    let (path, num_written) = if compressed {
        let path = path.with_additional_extension(".lz4");
        let mut encoder = lz4::EncoderBuilder::new()
            .level(4)
            .build(create_writer(&path)?)?;
        let n = write_sampler_input(&mut encoder, num_transcripts, n0, shards)?;
        let (mut out, res) = encoder.finish();
        res?;
        out.flush()?;
        (path, n)
    } else {
        let mut out = create_writer(&path)?;
        let n = write_sampler_input(&mut out, num_transcripts, n0, shards)?;
        out.flush()?;
        (path, n)
    };
    info!(
        "wrote the responsibilities of {} fragments to {}.",
        num_written,
        path.display()
    );
    Ok(path)
}

/// Write a record of the run as pretty-printed json.
pub fn write_meta_info(path: &Path, info: &serde_json::Value) -> anyhow::Result<()> {
    let writer = create_writer(path)?;
    serde_json::ser::to_writer_pretty(writer, info)?;
    Ok(())
}

/// Write the learned model parameters as pretty-printed json.
pub fn write_model<T: Serialize>(path: &Path, model: &T) -> anyhow::Result<()> {
    let mut writer = create_writer(path)?;
    serde_json::ser::to_writer_pretty(&mut writer, model)?;
    writer.flush()?;
    info!("wrote the learned model to {}.", path.display());
    Ok(())
}

/// Write the proportion vectors to `path`.
pub fn write_theta_file(path: &Path, res: &EmResult) -> anyhow::Result<()> {
    let mut writer = create_writer(path)?;
    write_theta(&mut writer, &res.theta_converged, &res.theta)?;
    writer.flush()?;
    Ok(())
}

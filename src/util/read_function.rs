use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::Context;
use csv::ReaderBuilder;
use rustc_hash::FxHashSet;
use tracing::info;

use crate::model::ModelParams;
use crate::util::em_types::{RunCounts, TranscriptInfo, Transcripts};

fn read_to_string<P: AsRef<Path>>(path_in: P) -> anyhow::Result<String> {
    let path = path_in.as_ref();
    let mut s = String::new();
    File::open(path)
        .with_context(|| format!("could not open {}", path.display()))?
        .read_to_string(&mut s)?;
    Ok(s)
}

/// Read the fragment totals (`N0 N1 N2 N_tot`) of a sample.
pub fn read_run_counts<P: AsRef<Path>>(path_in: P) -> anyhow::Result<RunCounts> {
    let path = path_in.as_ref();
    let contents = read_to_string(path)?;
    let vals = contents
        .split_ascii_whitespace()
        .take(4)
        .map(|t| t.parse::<u64>())
        .collect::<Result<Vec<u64>, _>>()
        .with_context(|| format!("malformed fragment counts in {}", path.display()))?;
    if vals.len() != 4 {
        anyhow::bail!(
            "{} must start with four counts (N0 N1 N2 N_tot), found {}",
            path.display(),
            vals.len()
        );
    }
    let counts = RunCounts {
        n0: vals[0],
        n1: vals[1],
        n2: vals[2],
        n_tot: vals[3],
    };
    if counts.n0 + counts.n1 + counts.n2 > counts.n_tot {
        anyhow::bail!(
            "inconsistent fragment counts in {}: N0 + N1 + N2 exceeds N_tot",
            path.display()
        );
    }
    info!(
        "{} fragments in total; {} unalignable, {} alignable, {} filtered.",
        counts.n_tot, counts.n0, counts.n1, counts.n2
    );
    Ok(counts)
}

/// Read the model parameters:
/// `minL maxL probF estRSPD B mate_minL mate_maxL mean sd seedLen`
pub fn read_model_params<P: AsRef<Path>>(path_in: P) -> anyhow::Result<ModelParams> {
    let path = path_in.as_ref();
    let contents = read_to_string(path)?;
    let toks: Vec<&str> = contents.split_ascii_whitespace().collect();
    if toks.len() < 10 {
        anyhow::bail!(
            "{} must hold 10 model parameters, found {}",
            path.display(),
            toks.len()
        );
    }
    let parse_err = || format!("malformed model parameters in {}", path.display());
    let params = ModelParams {
        min_len: toks[0].parse().with_context(parse_err)?,
        max_len: toks[1].parse().with_context(parse_err)?,
        prob_f: toks[2].parse().with_context(parse_err)?,
        estimate_fld: toks[3].parse::<u8>().with_context(parse_err)? != 0,
        num_bins: toks[4].parse().with_context(parse_err)?,
        mate_min_len: toks[5].parse().with_context(parse_err)?,
        mate_max_len: toks[6].parse().with_context(parse_err)?,
        mean: toks[7].parse().with_context(parse_err)?,
        sd: toks[8].parse().with_context(parse_err)?,
        seed_len: toks[9].parse().with_context(parse_err)?,
    };
    Ok(params)
}

/// Read the transcript table of a reference (tab separated, no header):
/// `transcript_id gene_id full_len tot_len`, one line per transcript in id
/// order. The transcripts of every gene must be contiguous.
pub fn read_transcripts<P: AsRef<Path>>(path_in: P) -> anyhow::Result<Transcripts> {
    let path = path_in.as_ref();
    let file = File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .from_reader(file);

    let txps: Vec<TranscriptInfo> = rdr
        .deserialize()
        .collect::<Result<Vec<TranscriptInfo>, csv::Error>>()
        .with_context(|| format!("could not parse the transcript table {}", path.display()))?;
    if txps.is_empty() {
        anyhow::bail!("the transcript table {} is empty", path.display());
    }

    let mut gene_starts = Vec::new();
    let mut seen_genes = FxHashSet::default();
    for (i, t) in txps.iter().enumerate() {
        if t.full_len > t.tot_len {
            anyhow::bail!(
                "transcript {} is longer ({}) than its total length ({})",
                t.transcript_id,
                t.full_len,
                t.tot_len
            );
        }
        if i == 0 || txps[i - 1].gene_id != t.gene_id {
            if !seen_genes.insert(t.gene_id.as_str()) {
                anyhow::bail!(
                    "the transcripts of gene {} are not contiguous in {}",
                    t.gene_id,
                    path.display()
                );
            }
            gene_starts.push(i + 1);
        }
    }
    gene_starts.push(txps.len() + 1);

    info!(
        "parsed reference information for {} transcripts from {} genes.",
        txps.len(),
        gene_starts.len() - 1
    );
    Ok(Transcripts::new(txps, gene_starts))
}

/// Open an alignment stream, transparently decompressing it if needed.
pub fn open_alignments<P: AsRef<Path>>(path_in: P) -> anyhow::Result<Box<dyn BufRead>> {
    let path = path_in.as_ref();
    let (reader, format) = niffler::from_path(path)
        .with_context(|| format!("could not open {}", path.display()))?;
    if !matches!(format, niffler::compression::Format::No) {
        info!("reading {:?} compressed alignments from {}", format, path.display());
    }
    Ok(Box::new(BufReader::new(reader)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("emquant_{}_{}", std::process::id(), name));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn counts_are_parsed_and_checked() {
        let p = temp_file("ok.cnt", "10 80 10 100\n0 0\n");
        let c = read_run_counts(&p).unwrap();
        assert_eq!((c.n0, c.n1, c.n2, c.n_tot), (10, 80, 10, 100));
        std::fs::remove_file(&p).unwrap();

        let p = temp_file("bad.cnt", "10 80 20 100\n");
        assert!(read_run_counts(&p).is_err());
        std::fs::remove_file(&p).unwrap();
    }

    #[test]
    fn model_params_are_parsed() {
        let p = temp_file("m.mparams", "1 1000 0.5 1 20\n1 500 200.0 80.0 25\n");
        let m = read_model_params(&p).unwrap();
        assert_eq!(m.max_len, 1000);
        assert!(m.estimate_fld);
        assert_eq!(m.mate_max_len, 500);
        assert_eq!(m.seed_len, 25);
        std::fs::remove_file(&p).unwrap();
    }

    #[test]
    fn genes_are_grouped_from_the_table() {
        let p = temp_file(
            "ok.ti",
            "t1\tg1\t100\t100\nt2\tg1\t200\t225\nt3\tg2\t300\t300\n",
        );
        let t = read_transcripts(&p).unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.num_genes(), 2);
        assert_eq!(t.gene_range(0), 1..3);
        assert_eq!(t.gene_range(1), 3..4);
        assert_eq!(t.get(2).tot_len, 225);
        std::fs::remove_file(&p).unwrap();

        let p = temp_file("split.ti", "t1\tg1\t1\t1\nt2\tg2\t1\t1\nt3\tg1\t1\t1\n");
        assert!(read_transcripts(&p).is_err());
        std::fs::remove_file(&p).unwrap();
    }
}

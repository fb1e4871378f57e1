use clap::Parser;

use std::{fs::create_dir_all, io, path::Path, sync::Arc, time::Instant};

use num_format::{Locale, ToFormattedString};
use path_tools::WithAdditionalExtension;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt, prelude::*};

mod alignment_parser;
mod effective_length;
mod em;
mod model;
mod prog_opts;
mod shard;
mod util;

use crate::alignment_parser::{HitRecords, partition_fragments, read_header, verify_header};
use crate::em::{EmEngine, EmResult};
use crate::model::alignment_model::AlignmentModel;
use crate::prog_opts::{Args, SamplerOut};
use crate::util::em_types::{EmOptions, RunCounts, ShardSummary};
use crate::util::fragment_reader::{FragmentIndex, IndexedFragmentReader};
use crate::util::read_function::{
    open_alignments, read_model_params, read_run_counts, read_transcripts,
};
use crate::util::write_function::{
    write_expression, write_meta_info, write_model, write_sampler_file, write_theta_file,
};

/// Produce a [serde_json::Value] that encodes the relevant arguments and
/// results of the run that we wish to record to file. Ultimately, this
/// will be written to the corresponding `meta_info.json` file for this run.
fn get_json_info(
    args: &Args,
    counts: &RunCounts,
    opts: &EmOptions,
    res: &EmResult,
    shards: &[ShardSummary],
    elapsed: std::time::Duration,
) -> serde_json::Value {
    json!({
        "read_type": args.read_type,
        "read_type_tag": args.read_type.tag(),
        "reference": &args.reference,
        "sample": &args.sample,
        "alignments": args.alignments_path(),
        "output": &args.output,
        "verbose": &args.verbose,
        "quiet": &args.quiet,
        "sampler_out": &args.sampler_out,
        "seed_from_unique": &args.seed_from_unique,
        "fragment_counts": counts,
        "em_options": opts,
        "em": &res.stats,
        "shards": shards,
        "elapsed": humantime::format_duration(elapsed).to_string(),
    })
}

fn main() -> anyhow::Result<()> {
    let start = Instant::now();
    let args = Args::parse();

    // set up the logging.  Here we will take the
    // logging level from the environment variable if
    // it is set.  Otherwise, we'll set the default
    // from the command line flags.
    let default_level = if args.quiet {
        LevelFilter::WARN
    } else if args.verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    let txps = read_transcripts(args.reference.with_additional_extension(".ti"))?;
    let counts = read_run_counts(args.sample.with_additional_extension(".cnt"))?;
    if counts.n1 == 0 {
        anyhow::bail!("there are no alignable fragments; nothing to quantify");
    }
    let params = read_model_params(args.sample.with_additional_extension(".mparams"))?;

    let aln_path = args.alignments_path();
    let mut reader = open_alignments(&aln_path)?;
    let header = read_header(&mut reader)?;
    verify_header(&header, &counts, args.read_type)?;
    info!(
        "read header from {}: {} fragments with {} hits ({}).",
        aln_path.display(),
        header.num_fragments.to_formatted_string(&Locale::en),
        header.num_hits.to_formatted_string(&Locale::en),
        args.read_type
    );

    let num_threads = (args.threads as u64).min(counts.n1) as usize;
    if num_threads < args.threads as usize {
        info!(
            "only {} alignable fragments; using {} threads.",
            counts.n1, num_threads
        );
    }
    let stores = partition_fragments(
        HitRecords::new(reader),
        &header,
        num_threads,
        txps.len(),
        args.quiet,
    )?;

    let index = Arc::new(FragmentIndex::build(
        args.sample.with_additional_extension(".frag"),
    )?);
    if index.len() as u64 != counts.n1 {
        anyhow::bail!(
            "the fragment file holds {} records, but {} alignable fragments were counted",
            index.len(),
            counts.n1
        );
    }

    let model = AlignmentModel::new(args.read_type, &params, &txps)?;
    let opts = EmOptions::builder()
        .min_rounds(args.min_rounds)
        .max_rounds(args.max_rounds)
        .stop_criteria(args.stop_criteria)
        .build();

    let read_type = args.read_type;
    let mut engine = EmEngine::new(
        model,
        stores,
        || IndexedFragmentReader::new(index.clone(), read_type),
        opts.clone(),
        counts,
        txps.len(),
    )?;
    if args.seed_from_unique {
        engine.estimate_from_unique();
    }

    let stats = engine.run()?;
    let res = engine.finalize(&txps, stats)?;
    info!(
        "final noise proportion {}; learned sequencing error rate {}.",
        engine.theta()[0],
        engine.model().error_rate()
    );

    // if there is a parent directory
    if let Some(p) = args.output.parent() {
        // unless this was a relative path with one component,
        // which we should treat as the file prefix, then grab
        // the non-empty parent and create it.
        if p != Path::new("") {
            create_dir_all(p)?;
        }
    }

    write_theta_file(&args.output.with_additional_extension(".theta"), &res)?;
    write_expression(
        &args.output.with_additional_extension(".isoforms.tsv"),
        &args.output.with_additional_extension(".genes.tsv"),
        &txps,
        &res,
    )?;
    write_model(
        &args.output.with_additional_extension(".model"),
        &engine.model().summary(),
    )?;
    if let Some(out_type) = &args.sampler_out {
        write_sampler_file(
            &args.output,
            matches!(out_type, SamplerOut::Compressed),
            txps.len(),
            counts.n0,
            engine.shards().iter().map(|s| (s.store(), s.noise_probs())),
        )?;
    }

    let elapsed = start.elapsed();
    let info = get_json_info(
        &args,
        &counts,
        &opts,
        &res,
        &engine.shard_summaries(),
        elapsed,
    );
    write_meta_info(&args.output.with_additional_extension(".meta_info.json"), &info)?;

    info!(
        "finished in {}.",
        humantime::format_duration(std::time::Duration::from_secs(elapsed.as_secs()))
    );
    Ok(())
}

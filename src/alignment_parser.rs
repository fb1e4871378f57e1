use std::io::BufRead;

use bio_types::strand::Strand;
use num_format::{Locale, ToFormattedString};
use tracing::{info, trace};

use crate::util::em_types::{CompatibilityStore, Hit, ReadType, RunCounts};

/// The header of an alignment (`.dat`) stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatHeader {
    pub num_fragments: usize,
    pub num_hits: usize,
    pub read_type_tag: u8,
}

pub fn read_header<R: BufRead>(reader: &mut R) -> anyhow::Result<DatHeader> {
    let mut line = String::new();
    while line.trim().is_empty() {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            anyhow::bail!("the alignment stream is empty; expected a header");
        }
    }
    let toks: Vec<&str> = line.split_ascii_whitespace().collect();
    if toks.len() != 3 {
        anyhow::bail!(
            "malformed alignment header {:?}; expected `#fragments #hits read_type`",
            line.trim()
        );
    }
    Ok(DatHeader {
        num_fragments: toks[0].parse()?,
        num_hits: toks[1].parse()?,
        read_type_tag: toks[2].parse()?,
    })
}

/// Make sure the alignment stream describes the run we were configured for.
pub fn verify_header(
    header: &DatHeader,
    counts: &RunCounts,
    read_type: ReadType,
) -> anyhow::Result<()> {
    if header.num_fragments as u64 != counts.n1 {
        anyhow::bail!(
            "Number of alignable fragments does not match! The alignment stream declares {}, but {} were counted.",
            header.num_fragments,
            counts.n1
        );
    }
    let stream_type = ReadType::from_tag(header.read_type_tag)?;
    if stream_type != read_type {
        anyhow::bail!(
            "The alignment stream holds {} fragments, but the run is configured for {} fragments.",
            stream_type,
            read_type
        );
    }
    Ok(())
}

fn parse_strand(s: &str) -> anyhow::Result<Strand> {
    match s {
        "+" => Ok(Strand::Forward),
        "-" => Ok(Strand::Reverse),
        "." => Ok(Strand::Unknown),
        x => anyhow::bail!("Cannot parse {} as a valid strand", x),
    }
}

/// Parse the hits of one fragment:
/// `k (tid strand pos frag_len mismatches){k}`
pub fn parse_hit_line(line: &str) -> anyhow::Result<Vec<Hit>> {
    const FIELDS_PER_HIT: usize = 5;
    let toks: Vec<&str> = line.split_ascii_whitespace().collect();
    let (k, rest) = match toks.split_first() {
        Some((k, rest)) => (k.parse::<usize>()?, rest),
        None => anyhow::bail!("empty alignment record"),
    };
    let num_fields = k
        .checked_mul(FIELDS_PER_HIT)
        .ok_or_else(|| anyhow::anyhow!("malformed alignment record declaring {} hits", k))?;
    if rest.len() != num_fields {
        anyhow::bail!(
            "alignment record declares {} hits but carries {} fields",
            k,
            rest.len()
        );
    }
    rest.chunks(FIELDS_PER_HIT)
        .map(|f| {
            Ok(Hit::new(
                f[0].parse()?,
                parse_strand(f[1])?,
                f[2].parse()?,
                f[3].parse()?,
                f[4].parse()?,
            ))
        })
        .collect()
}

/// Iterates over the per-fragment hit records following the header.
pub struct HitRecords<R: BufRead> {
    reader: R,
    buf: String,
}

impl<R: BufRead> HitRecords<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for HitRecords<R> {
    type Item = anyhow::Result<Vec<Hit>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) if self.buf.trim().is_empty() => continue,
                Ok(_) => return Some(parse_hit_line(&self.buf)),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Split the fragments of an alignment stream into `num_shards`
/// compatibility stores.
///
/// Fragments are assigned in stream order. Shard `k` keeps taking
/// fragments until it holds at least `num_hits / num_shards` hits, or until
/// taking another would leave fewer fragments than the shards still to be
/// filled; the last shard takes whatever remains. Shards are balanced by
/// hit count only and are never rebalanced afterwards. When there are fewer
/// hits than shards the threshold is zero and only the last shard receives
/// fragments.
pub fn partition_fragments<I>(
    records: I,
    header: &DatHeader,
    num_shards: usize,
    num_transcripts: usize,
    quiet: bool,
) -> anyhow::Result<Vec<CompatibilityStore>>
where
    I: Iterator<Item = anyhow::Result<Vec<Hit>>>,
{
    if num_shards == 0 || num_shards > header.num_fragments {
        anyhow::bail!(
            "cannot split {} fragments into {} shards",
            header.num_fragments,
            num_shards
        );
    }
    let mut records = records;
    let hit_thresh = header.num_hits / num_shards;
    let mut frags_left = header.num_fragments;
    let mut total_hits = 0_usize;

    let pb = if quiet {
        indicatif::ProgressBar::hidden()
    } else {
        indicatif::ProgressBar::new_spinner().with_message("Number of fragments loaded")
    };
    pb.set_style(
        indicatif::ProgressStyle::with_template(
            "[{elapsed_precise}] {spinner:4.green/blue} {msg} {human_pos:>12}",
        )?
        .tick_chars("⠁⠁⠉⠙⠚⠒⠂⠂⠒⠲⠴⠤⠄⠄⠤⠠⠠⠤⠦⠖⠒⠐⠐⠒⠓⠋⠉⠈⠈"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr_with_hz(4));

    let mut shards = Vec::with_capacity(num_shards);
    for i in 0..num_shards {
        let shards_left = num_shards - i - 1;
        let is_last = shards_left == 0;
        let mut store = CompatibilityStore::new();

        while frags_left > shards_left && (is_last || store.num_hits() < hit_thresh) {
            let hits = match records.next() {
                Some(r) => r?,
                None => anyhow::bail!(
                    "Cannot read alignments; the stream ended with {} fragments left to load.",
                    frags_left
                ),
            };
            if let Some(h) = hits
                .iter()
                .find(|h| h.tid == 0 || h.tid() > num_transcripts)
            {
                anyhow::bail!(
                    "alignment to transcript {} is out of range; the reference has {} transcripts",
                    h.tid,
                    num_transcripts
                );
            }
            store.push_fragment(hits);
            frags_left -= 1;
            pb.inc(1);
            if frags_left % 1_000_000 == 0 {
                trace!("{} fragments left to load", frags_left);
            }
        }
        total_hits += store.num_hits();
        shards.push(store);
    }
    pb.finish_with_message("Finished loading fragments.");

    if total_hits != header.num_hits {
        anyhow::bail!(
            "Number of hits does not match! The alignment stream declares {}, but {} were read.",
            header.num_hits,
            total_hits
        );
    }
    info!(
        "loaded {} fragments with {} hits into {} shards.",
        header.num_fragments.to_formatted_string(&Locale::en),
        total_hits.to_formatted_string(&Locale::en),
        num_shards
    );
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(hits_per_frag: &[usize]) -> Vec<anyhow::Result<Vec<Hit>>> {
        hits_per_frag
            .iter()
            .map(|&k| Ok((0..k).map(|_| Hit::new(1, Strand::Forward, 0, 10, 0)).collect()))
            .collect()
    }

    fn header_for(hits_per_frag: &[usize]) -> DatHeader {
        DatHeader {
            num_fragments: hits_per_frag.len(),
            num_hits: hits_per_frag.iter().sum(),
            read_type_tag: 0,
        }
    }

    fn layout(shards: &[CompatibilityStore]) -> Vec<(usize, usize)> {
        shards
            .iter()
            .map(|s| (s.num_fragments(), s.num_hits()))
            .collect()
    }

    #[test]
    fn header_and_hit_lines_parse() {
        let mut input = "\n4 7 2\n".as_bytes();
        let h = read_header(&mut input).unwrap();
        assert_eq!(
            h,
            DatHeader {
                num_fragments: 4,
                num_hits: 7,
                read_type_tag: 2
            }
        );
        let hits = parse_hit_line("2 3 + 10 250 1 5 - 0 300 0").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].tid, 5);
        assert_eq!(hits[1].strand, Strand::Reverse);
        assert_eq!(hits[0].frag_len, 250);
        assert!(parse_hit_line("2 3 + 10 250 1").is_err());
        assert_eq!(parse_hit_line("0").unwrap().len(), 0);
        let huge = format!("{} 1 + 0 10 0", usize::MAX);
        assert!(parse_hit_line(&huge).is_err());
    }

    #[test]
    fn header_mismatches_are_fatal() {
        let counts = RunCounts {
            n0: 1,
            n1: 4,
            n2: 0,
            n_tot: 5,
        };
        let h = DatHeader {
            num_fragments: 4,
            num_hits: 7,
            read_type_tag: 2,
        };
        assert!(verify_header(&h, &counts, ReadType::Paired).is_ok());
        assert!(verify_header(&h, &counts, ReadType::Single).is_err());
        let h = DatHeader {
            num_fragments: 3,
            ..h
        };
        assert!(verify_header(&h, &counts, ReadType::Paired).is_err());
    }

    #[test]
    fn shards_are_balanced_by_hits() {
        let frags = [1, 1, 1, 1, 1, 1];
        let shards =
            partition_fragments(records(&frags).into_iter(), &header_for(&frags), 3, 1, true)
                .unwrap();
        assert_eq!(layout(&shards), vec![(2, 2), (2, 2), (2, 2)]);

        // a heavy first fragment fills the first shard on its own
        let frags = [6, 1, 1, 1, 1];
        let shards =
            partition_fragments(records(&frags).into_iter(), &header_for(&frags), 2, 1, true)
                .unwrap();
        assert_eq!(layout(&shards), vec![(1, 6), (4, 4)]);

        // fewer hits than shards gives a zero threshold, so the earlier
        // shards stay empty and the last one takes everything
        let frags = [1, 1, 0];
        let shards =
            partition_fragments(records(&frags).into_iter(), &header_for(&frags), 3, 1, true)
                .unwrap();
        assert_eq!(layout(&shards), vec![(0, 0), (0, 0), (3, 2)]);
    }

    #[test]
    fn earlier_shards_leave_fragments_for_later_ones() {
        // the first shard would absorb all hits, but must leave one
        // fragment for each remaining shard
        let frags = [0, 0, 0, 9];
        let shards =
            partition_fragments(records(&frags).into_iter(), &header_for(&frags), 3, 1, true)
                .unwrap();
        assert_eq!(layout(&shards), vec![(2, 0), (1, 0), (1, 9)]);
    }

    #[test]
    fn short_streams_and_bad_ids_are_fatal() {
        let frags = [1, 1, 1];
        let mut header = header_for(&frags);
        header.num_fragments = 4;
        assert!(
            partition_fragments(records(&frags).into_iter(), &header, 2, 1, true).is_err()
        );

        let header = header_for(&frags);
        assert!(
            partition_fragments(records(&frags).into_iter(), &header, 1, 0, true).is_err()
        );

        let mut header = header_for(&frags);
        header.num_hits = 5;
        assert!(
            partition_fragments(records(&frags).into_iter(), &header, 1, 1, true).is_err()
        );
    }
}

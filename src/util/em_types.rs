use std::fmt;
use std::ops::Range;

use bio_types::strand::Strand;
use serde::{Deserialize, Serialize};
use tabled::builder::Builder;
use tabled::settings::Style;
use typed_builder::TypedBuilder;

use crate::util::constants;

/// The kind of fragment this run quantifies. The tag is recorded in the
/// header of the alignment stream and must match the one the run was
/// configured with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ReadType {
    Single,
    SingleQual,
    Paired,
    PairedQual,
}

impl ReadType {
    pub fn from_tag(tag: u8) -> anyhow::Result<Self> {
        match tag {
            0 => Ok(ReadType::Single),
            1 => Ok(ReadType::SingleQual),
            2 => Ok(ReadType::Paired),
            3 => Ok(ReadType::PairedQual),
            x => anyhow::bail!("Unknown read type {}; expected one of 0, 1, 2 or 3", x),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            ReadType::Single => 0,
            ReadType::SingleQual => 1,
            ReadType::Paired => 2,
            ReadType::PairedQual => 3,
        }
    }

    pub fn is_paired(&self) -> bool {
        matches!(self, ReadType::Paired | ReadType::PairedQual)
    }

    pub fn has_quality(&self) -> bool {
        matches!(self, ReadType::SingleQual | ReadType::PairedQual)
    }
}

impl fmt::Display for ReadType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let desc = match self {
            ReadType::Single => "single-end",
            ReadType::SingleQual => "single-end with quality scores",
            ReadType::Paired => "paired-end",
            ReadType::PairedQual => "paired-end with quality scores",
        };
        write!(f, "{}", desc)
    }
}

/// One recorded compatibility between a fragment and a transcript.
#[derive(Clone, Debug, PartialEq)]
pub struct Hit {
    /// transcript id, in [1, M]
    pub tid: u32,
    pub strand: Strand,
    /// 0-based leftmost position of the fragment on the transcript
    pub pos: u32,
    /// implied fragment length (read length for single-end data)
    pub frag_len: u32,
    pub mismatches: u32,
    /// conditional probability of the fragment given this hit, or, after an
    /// expected-weight pass, the fragment's responsibility for this hit.
    pub con_prb: f64,
}

impl Hit {
    pub fn new(tid: u32, strand: Strand, pos: u32, frag_len: u32, mismatches: u32) -> Self {
        Self {
            tid,
            strand,
            pos,
            frag_len,
            mismatches,
            con_prb: 0.0_f64,
        }
    }

    #[inline(always)]
    pub fn tid(&self) -> usize {
        self.tid as usize
    }
}

/// The sequence-level facts about a fragment that the model needs in
/// order to score it.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    pub name: String,
    pub read_len: u32,
    pub mate_len: Option<u32>,
    /// mean phred quality over all sequenced bases
    pub mean_qual: Option<f32>,
}

impl Fragment {
    /// number of sequenced bases (both mates for paired-end fragments)
    pub fn seq_len(&self) -> u32 {
        self.read_len + self.mate_len.unwrap_or(0)
    }
}

/// Per-transcript information from the reference
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TranscriptInfo {
    pub transcript_id: String,
    pub gene_id: String,
    /// annotated length
    pub full_len: u32,
    /// total length, including any appended tail
    pub tot_len: u32,
}

/// All transcripts of the reference, addressed by id 1..=M, together with
/// the contiguous id ranges forming each gene.
#[derive(Debug, Clone)]
pub struct Transcripts {
    txps: Vec<TranscriptInfo>,
    // gene_starts[g] is the id of the first transcript of gene g; the
    // last entry is M + 1.
    gene_starts: Vec<usize>,
}

impl Transcripts {
    pub fn new(txps: Vec<TranscriptInfo>, gene_starts: Vec<usize>) -> Self {
        Self { txps, gene_starts }
    }

    /// number of transcripts, M
    pub fn len(&self) -> usize {
        self.txps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txps.is_empty()
    }

    pub fn num_genes(&self) -> usize {
        self.gene_starts.len().saturating_sub(1)
    }

    /// transcript with id `tid` (1-based)
    pub fn get(&self, tid: usize) -> &TranscriptInfo {
        &self.txps[tid - 1]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranscriptInfo> {
        self.txps.iter()
    }

    /// transcript id range of gene `g`
    pub fn gene_range(&self, g: usize) -> Range<usize> {
        self.gene_starts[g]..self.gene_starts[g + 1]
    }
}

/// Sparse fragment-by-transcript compatibility records. Fragment `i` owns
/// the hits in `hits[offsets[i]..offsets[i + 1]]`, which may be empty.
#[derive(Debug, Clone)]
pub struct CompatibilityStore {
    hits: Vec<Hit>,
    offsets: Vec<usize>,
}

pub struct CompatibilityStoreIter<'a> {
    pub store: &'a CompatibilityStore,
    pub idx: usize,
}

impl<'a> Iterator for CompatibilityStoreIter<'a> {
    type Item = &'a [Hit];

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx + 1 >= self.store.offsets.len() {
            None
        } else {
            let start = self.store.offsets[self.idx];
            let end = self.store.offsets[self.idx + 1];
            self.idx += 1;
            Some(&self.store.hits[start..end])
        }
    }
}

impl Default for CompatibilityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CompatibilityStore {
    pub fn new() -> Self {
        Self {
            hits: vec![],
            offsets: vec![0],
        }
    }

    pub fn iter(&self) -> CompatibilityStoreIter<'_> {
        CompatibilityStoreIter {
            store: self,
            idx: 0,
        }
    }

    /// append a fragment along with all of its hits
    pub fn push_fragment<I: IntoIterator<Item = Hit>>(&mut self, hits: I) {
        self.hits.extend(hits);
        self.offsets.push(self.hits.len());
    }

    pub fn num_fragments(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn num_hits(&self) -> usize {
        self.hits.len()
    }

    #[inline(always)]
    pub fn offset_at(&self, i: usize) -> usize {
        self.offsets[i]
    }

    #[inline(always)]
    pub fn hit_at(&self, j: usize) -> &Hit {
        &self.hits[j]
    }

    #[inline(always)]
    pub fn hits_for(&self, i: usize) -> &[Hit] {
        &self.hits[self.offsets[i]..self.offsets[i + 1]]
    }

    #[inline(always)]
    pub fn hits_for_mut(&mut self, i: usize) -> &mut [Hit] {
        let (s, e) = (self.offsets[i], self.offsets[i + 1]);
        &mut self.hits[s..e]
    }
}

/// Fragment totals for the run, as counted by the upstream parsing
/// stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunCounts {
    /// fragments that did not align at all (pure noise)
    pub n0: u64,
    /// alignable fragments
    pub n1: u64,
    /// fragments filtered out (e.g. too many alignments)
    pub n2: u64,
    pub n_tot: u64,
}

/// The parameters controlling the EM rounds.
#[derive(TypedBuilder, Debug, Clone, Serialize)]
pub struct EmOptions {
    /// the EM always performs at least this many rounds
    #[builder(default = constants::MIN_ROUND)]
    pub min_rounds: u32,
    /// the EM gives up on convergence after this many rounds
    #[builder(default = constants::MAX_ROUND)]
    pub max_rounds: u32,
    /// entries whose relative change reaches this value are unconverged
    #[builder(default = constants::STOP_CRITERIA)]
    pub stop_criteria: f64,
    #[builder(default = constants::RELEARN_WARMUP_ROUNDS)]
    pub relearn_warmup: u32,
    #[builder(default = constants::RELEARN_PERIOD)]
    pub relearn_period: u32,
}

impl EmOptions {
    /// true if the model should be relearned from the responsibilities
    /// computed in `round` (1-based)
    pub fn relearn_in_round(&self, round: u32) -> bool {
        round <= self.relearn_warmup || (self.relearn_period > 0 && round % self.relearn_period == 0)
    }
}

/// Layout of one shard, reported after partitioning.
#[derive(Debug, Clone, Serialize)]
pub struct ShardSummary {
    pub first_fragment: usize,
    pub num_fragments: usize,
    pub num_hits: usize,
}

pub fn shard_table(shards: &[ShardSummary]) -> tabled::tables::Table {
    let mut data = vec![[
        "shard".to_string(),
        "first fragment".to_string(),
        "fragments".to_string(),
        "hits".to_string(),
    ]];
    for (i, s) in shards.iter().enumerate() {
        data.push([
            format!("{}", i),
            format!("{}", s.first_fragment),
            format!("{}", s.num_fragments),
            format!("{}", s.num_hits),
        ]);
    }
    let mut binding = Builder::from_iter(data).build();
    let table = binding.with(Style::rounded());
    table.clone()
}

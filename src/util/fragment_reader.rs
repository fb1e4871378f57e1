use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use num_format::{Locale, ToFormattedString};
use tracing::info;

use crate::util::em_types::{Fragment, ReadType};

/// A sequential source of fragments that can be positioned at an arbitrary
/// fragment index. Each shard owns one source, positioned at the first
/// fragment of the shard.
pub trait FragmentSource: Send {
    /// position the source so that the next fragment returned is `idx`;
    /// this also becomes the position that `reset` returns to.
    fn locate(&mut self, idx: usize) -> anyhow::Result<()>;

    /// rewind to the fragment given to the last `locate` call
    fn reset(&mut self) -> anyhow::Result<()>;

    fn next_fragment(&mut self) -> anyhow::Result<Fragment>;
}

/// Parse one line of a fragment file:
/// `name read_len [mate_len] [mean_qual]`, where the optional fields are
/// present according to the read type.
pub fn parse_fragment_line(line: &str, read_type: ReadType) -> anyhow::Result<Fragment> {
    let mut toks = line.split_ascii_whitespace();
    let name = toks
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty fragment record"))?
        .to_string();
    let mut next_field = |what: &str| {
        toks.next()
            .ok_or_else(|| anyhow::anyhow!("fragment {} is missing its {}", name, what))
            .map(|s| s.to_string())
    };
    let read_len = next_field("read length")?.parse::<u32>()?;
    let mate_len = if read_type.is_paired() {
        Some(next_field("mate length")?.parse::<u32>()?)
    } else {
        None
    };
    let mean_qual = if read_type.has_quality() {
        Some(next_field("mean quality")?.parse::<f32>()?)
    } else {
        None
    };
    Ok(Fragment {
        name,
        read_len,
        mate_len,
        mean_qual,
    })
}

/// Byte offset of every fragment record in a fragment file. Built once
/// and shared among the readers of all shards.
#[derive(Debug)]
pub struct FragmentIndex {
    path: PathBuf,
    offsets: Vec<u64>,
}

impl FragmentIndex {
    pub fn build<P: AsRef<Path>>(path_in: P) -> anyhow::Result<Self> {
        let path = path_in.as_ref();
        let mut reader = BufReader::new(
            File::open(path).with_context(|| format!("could not open {}", path.display()))?,
        );
        let mut offsets = Vec::new();
        let mut pos = 0_u64;
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = reader.read_line(&mut buf)?;
            if n == 0 {
                break;
            }
            if !buf.trim().is_empty() {
                offsets.push(pos);
            }
            pos += n as u64;
        }
        info!(
            "indexed {} fragment records in {}.",
            offsets.len().to_formatted_string(&Locale::en),
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            offsets,
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Reads fragment records from a file, seeking through a shared index.
pub struct IndexedFragmentReader {
    reader: BufReader<File>,
    index: Arc<FragmentIndex>,
    read_type: ReadType,
    start: usize,
    buf: String,
}

impl IndexedFragmentReader {
    pub fn new(index: Arc<FragmentIndex>, read_type: ReadType) -> anyhow::Result<Self> {
        let f = File::open(&index.path)
            .with_context(|| format!("could not open {}", index.path.display()))?;
        Ok(Self {
            reader: BufReader::new(f),
            index,
            read_type,
            start: 0,
            buf: String::new(),
        })
    }
}

impl FragmentSource for IndexedFragmentReader {
    fn locate(&mut self, idx: usize) -> anyhow::Result<()> {
        // locating one past the last record is allowed (an empty shard)
        let offset = match self.index.offsets.get(idx) {
            Some(&o) => o,
            None if idx == self.index.len() => self.reader.get_ref().metadata()?.len(),
            None => anyhow::bail!(
                "fragment index {} is out of range; the fragment file holds {} records",
                idx,
                self.index.len()
            ),
        };
        self.reader.seek(SeekFrom::Start(offset))?;
        self.start = idx;
        Ok(())
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.locate(self.start)
    }

    fn next_fragment(&mut self) -> anyhow::Result<Fragment> {
        loop {
            self.buf.clear();
            if self.reader.read_line(&mut self.buf)? == 0 {
                anyhow::bail!("could not load a fragment; the fragment file ended early");
            }
            if !self.buf.trim().is_empty() {
                return parse_fragment_line(&self.buf, self.read_type);
            }
        }
    }
}

/// Fragments held in memory, shared by every shard.
#[derive(Debug, Clone)]
pub struct InMemoryFragments {
    frags: Arc<Vec<Fragment>>,
    start: usize,
    pos: usize,
}

impl InMemoryFragments {
    pub fn new(frags: Arc<Vec<Fragment>>) -> Self {
        Self {
            frags,
            start: 0,
            pos: 0,
        }
    }
}

impl FragmentSource for InMemoryFragments {
    fn locate(&mut self, idx: usize) -> anyhow::Result<()> {
        if idx > self.frags.len() {
            anyhow::bail!("fragment index {} is out of range", idx);
        }
        self.start = idx;
        self.pos = idx;
        Ok(())
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.pos = self.start;
        Ok(())
    }

    fn next_fragment(&mut self) -> anyhow::Result<Fragment> {
        let f = self
            .frags
            .get(self.pos)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("could not load fragment {}", self.pos))?;
        self.pos += 1;
        Ok(f)
    }
}

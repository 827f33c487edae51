//! Corpus input: line sources, token resolution, and batch readers.
//!
//! Training pulls batches of parsed sentences through the [`Reader`] trait.
//! [`StreamingReader`] parses the next batch on a background thread while the
//! caller trains on the current one; [`OnceReader`] loads the corpus into
//! memory and replays it every epoch. Both report the epoch boundary the same
//! way: the call after a full pass returns `false` exactly once.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{bail, ensure, Context, Result};
use clap::ValueEnum;
use flate2::read::MultiGzDecoder;

use crate::vocab::IndexMap;
use crate::{Sentence, Sentences, Word, UNK};

/// Longest line the readers will keep, in bytes. Anything beyond this is
/// truncated (or rejected in strict mode).
pub const MAX_LINE_LEN: usize = 1_000_000;

/// How to decode input files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReadMode {
    /// Treat every file as plain text.
    Text,
    /// Treat every file as gzip.
    Gzip,
    /// Treat `*.gz` as gzip, everything else as plain text.
    Auto,
}

/// One open input file. Variants cover the supported encodings; both expose
/// the same bounded line reads and close on drop.
pub enum LineSource {
    Text(BufReader<File>),
    Gzip(BufReader<MultiGzDecoder<File>>),
}

impl LineSource {
    pub fn open(path: &Path, mode: ReadMode) -> Result<LineSource> {
        let gzip = match mode {
            ReadMode::Text => false,
            ReadMode::Gzip => true,
            ReadMode::Auto => path.extension().map_or(false, |ext| ext == "gz"),
        };
        let file = File::open(path)
            .with_context(|| format!("could not open input file {path:?} -- make sure it exists"))?;
        Ok(if gzip {
            LineSource::Gzip(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            LineSource::Text(BufReader::new(file))
        })
    }

    /// Read the next line into `buf` (without its newline). Returns `None` at
    /// end of file, otherwise whether the line was terminated by a newline
    /// within [`MAX_LINE_LEN`] bytes; when it was not, `buf` holds the
    /// truncated prefix and the remainder of the physical line is skipped.
    pub fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<bool>> {
        match self {
            LineSource::Text(r) => read_bounded_line(r, buf),
            LineSource::Gzip(r) => read_bounded_line(r, buf),
        }
    }
}

fn read_bounded_line<R: BufRead>(r: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<bool>> {
    buf.clear();
    let mut truncated = false;
    loop {
        let available = r.fill_buf()?;
        if available.is_empty() {
            return Ok(if buf.is_empty() && !truncated {
                None
            } else {
                Some(false)
            });
        }
        let room = MAX_LINE_LEN - buf.len();
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if pos <= room {
                    buf.extend_from_slice(&available[..pos]);
                } else {
                    buf.extend_from_slice(&available[..room]);
                    truncated = true;
                }
                r.consume(pos + 1);
                return Ok(Some(!truncated));
            }
            None => {
                let n = available.len();
                if n <= room {
                    buf.extend_from_slice(available);
                } else {
                    buf.extend_from_slice(&available[..room]);
                    truncated = true;
                }
                r.consume(n);
            }
        }
    }
}

/// Read every line of `paths` in order and hand each (newline stripped) to
/// `f`. In strict mode a line not terminated by a newline within the length
/// limit is a fatal error.
pub fn read_lines<F>(paths: &[PathBuf], mode: ReadMode, strict: bool, mut f: F) -> Result<()>
where
    F: FnMut(&str) -> Result<()>,
{
    let mut buf = Vec::with_capacity(4096);
    for path in paths {
        let mut source = LineSource::open(path, mode)?;
        while let Some(newline) = source
            .next_line(&mut buf)
            .with_context(|| format!("error reading {path:?}"))?
        {
            if strict && !newline {
                bail!("no end-of-line char: a line in {path:?} may be too long");
            }
            f(&String::from_utf8_lossy(&buf))?;
        }
    }
    Ok(())
}

/// Resolves line tokens against a vocabulary. Shared with the prefetch thread,
/// so it holds the vocabulary behind an `Arc` and never mutates it.
#[derive(Clone)]
pub struct LineParser {
    vocab: Arc<IndexMap>,
    unk: Option<Word>,
}

impl LineParser {
    /// When `discard` is false, unknown tokens map to the UNK sentinel, which
    /// must already be in the vocabulary.
    pub fn new(vocab: Arc<IndexMap>, discard: bool) -> Result<LineParser> {
        let unk = if discard {
            None
        } else {
            Some(
                vocab
                    .get(UNK)
                    .with_context(|| format!("vocabulary has no {UNK} entry"))?,
            )
        };
        Ok(LineParser { vocab, unk })
    }

    pub fn parse(&self, line: &str) -> Sentence {
        line.split(' ')
            .filter(|t| !t.is_empty())
            .filter_map(|t| match self.vocab.get(t) {
                Some(id) => Some(id),
                None => self.unk,
            })
            .collect()
    }
}

/// Batch source for the training loop. `next_batch` fills `out` and returns
/// whether data was produced; after a full pass over the corpus it returns
/// `false` exactly once, then starts over.
pub trait Reader {
    fn next_batch(&mut self, out: &mut Sentences) -> Result<bool>;
}

/// Reader for corpora that fit in memory: parses everything on the first call
/// and then reports the same buffer forever, alternating `true`/`false` so
/// every epoch sees one batch followed by one end-of-pass signal.
pub struct OnceReader {
    parser: LineParser,
    paths: Vec<PathBuf>,
    mode: ReadMode,
    strict: bool,
    loaded: bool,
    /// Flips every call: `true` reports the batch, `false` ends the pass.
    produced: bool,
}

impl OnceReader {
    pub fn new(parser: LineParser, paths: Vec<PathBuf>, mode: ReadMode, strict: bool) -> OnceReader {
        OnceReader {
            parser,
            paths,
            mode,
            strict,
            loaded: false,
            produced: false,
        }
    }
}

impl Reader for OnceReader {
    fn next_batch(&mut self, out: &mut Sentences) -> Result<bool> {
        if !self.loaded {
            read_lines(&self.paths, self.mode, self.strict, |line| {
                out.push(self.parser.parse(line));
                Ok(())
            })?;
            self.loaded = true;
        }
        self.produced = !self.produced;
        Ok(self.produced)
    }
}

struct Prefetch {
    batch: Sentences,
    source: LineSource,
    path_idx: usize,
    /// Whether this batch consumed the end of the last file (wrapping back to
    /// the first one for the next epoch).
    wrapped: bool,
}

/// Reader that overlaps parsing with training: while the caller consumes one
/// batch, a single background thread reads and parses the next. A batch never
/// spans a file boundary.
pub struct StreamingReader {
    parser: LineParser,
    paths: Arc<Vec<PathBuf>>,
    mode: ReadMode,
    strict: bool,
    buffer_size: usize,
    pending: Option<JoinHandle<Result<Prefetch>>>,
    eof_prev: bool,
}

impl StreamingReader {
    pub fn new(
        parser: LineParser,
        paths: Vec<PathBuf>,
        buffer_size: usize,
        mode: ReadMode,
        strict: bool,
    ) -> Result<StreamingReader> {
        ensure!(!paths.is_empty(), "no input files");
        let source = LineSource::open(&paths[0], mode)?;
        let mut reader = StreamingReader {
            parser,
            paths: Arc::new(paths),
            mode,
            strict,
            buffer_size,
            pending: None,
            eof_prev: false,
        };
        reader.spawn_prefetch(source, 0);
        Ok(reader)
    }

    fn spawn_prefetch(&mut self, mut source: LineSource, mut path_idx: usize) {
        let parser = self.parser.clone();
        let paths = Arc::clone(&self.paths);
        let mode = self.mode;
        let strict = self.strict;
        let cap = self.buffer_size;

        self.pending = Some(thread::spawn(move || {
            let mut batch = Sentences::with_capacity(cap);
            let mut wrapped = false;
            let mut buf = Vec::with_capacity(4096);
            while batch.len() < cap {
                let line = source
                    .next_line(&mut buf)
                    .with_context(|| format!("error reading {:?}", paths[path_idx]))?;
                match line {
                    Some(newline) => {
                        if strict && !newline {
                            bail!(
                                "no end-of-line char: a line in {:?} may be too long",
                                paths[path_idx]
                            );
                        }
                        batch.push(parser.parse(&String::from_utf8_lossy(&buf)));
                    }
                    None => {
                        path_idx = (path_idx + 1) % paths.len();
                        if path_idx == 0 {
                            wrapped = true;
                        }
                        source = LineSource::open(&paths[path_idx], mode)?;
                        break;
                    }
                }
            }
            Ok(Prefetch {
                batch,
                source,
                path_idx,
                wrapped,
            })
        }));
    }
}

impl Reader for StreamingReader {
    fn next_batch(&mut self, out: &mut Sentences) -> Result<bool> {
        // A pass that ended in the previous call reports `false` now, without
        // touching the prefetch already running for the next epoch.
        if self.eof_prev {
            self.eof_prev = false;
            return Ok(false);
        }

        let handle = self.pending.take().expect("prefetch thread missing");
        let prefetch = handle.join().expect("prefetch thread panicked")?;
        self.eof_prev = prefetch.wrapped;
        *out = prefetch.batch;
        self.spawn_prefetch(prefetch.source, prefetch.path_idx);
        Ok(true)
    }
}

impl Drop for StreamingReader {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            let _ = handle.join();
        }
    }
}

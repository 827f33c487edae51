use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use clap::Parser;

use meanvec::reader::{LineParser, OnceReader, ReadMode, Reader, StreamingReader};
use meanvec::table::{init_tables, load_pretrained, save_embeddings, Table};
use meanvec::trainer::{Params, Trainer};
use meanvec::vocab::{assemble_vocab, build_vocab, load_vocab, save_vocab, ContinueVocab, IndexMap};
use meanvec::{probs, real, train, GLOBAL_SEED, UNK};

#[derive(Parser)]
#[command(about = "word vector estimation by negative sampling", version)]
struct Options {
    /// Paths to training files (plain text or gzip; one sentence per line)
    #[arg(short, long = "files", value_name = "PATHS", num_args = 1.., required = true)]
    files: Vec<PathBuf>,

    /// Word vector dimension
    #[arg(short, long, default_value_t = 200)]
    dim: usize,

    /// One-sided context size, excluding the center word
    #[arg(short, long = "context-size", default_value_t = 5)]
    context_size: usize,

    /// Number of negative samples for each positive
    #[arg(short, long, default_value_t = 5)]
    negatives: usize,

    /// (Starting) learning rate. 0.025 for skipgram and 0.075 for cbow is
    /// recommended
    #[arg(short, long = "learning-rate", default_value_t = 0.025)]
    learning_rate: real,

    /// Minimum (ending) learning rate when linearly scheduling the learning
    /// rate
    #[arg(short, long = "min-learning-rate", default_value_t = 1e-4)]
    min_learning_rate: real,

    /// Do not use word identities if their raw frequency count is less than
    /// this (see --discard)
    #[arg(short = 'k', long = "min-count", default_value_t = 1)]
    min_count: u64,

    /// If true, discard rare words (see --min-count); else convert them to
    /// the UNK sentinel
    #[arg(short = 'i', long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
    discard: bool,

    /// Use the cbow loss instead of skipgram
    #[arg(short = 'b', long)]
    cbow: bool,

    /// Drop the 1/K normalization from the cbow context gradient (the
    /// classic word2vec behavior, for benchmarking)
    #[arg(short = 'u', long = "use-bad-update")]
    use_bad_update: bool,

    /// Downsample threshold
    #[arg(short = 'o', long = "downsample-threshold", default_value_t = 1e-3)]
    downsample_threshold: real,

    /// Exponent for the negative sampling distribution, in [0, 1]
    #[arg(short = 'x', long = "ns-exponent", default_value_t = 0.75)]
    ns_exponent: real,

    /// Training epochs
    #[arg(short, long, default_value_t = 1)]
    epochs: usize,

    /// Keep only the top n words instead of the whole vocabulary
    #[arg(long = "vocab-size", value_name = "N")]
    vocab_size: Option<usize>,

    /// Load the vocabulary from a file instead of building it from the
    /// corpus; --min-count and --vocab-size must be left at their defaults
    #[arg(short = 'a', long = "vocab-load-path", value_name = "PATH")]
    vocab_load_path: Option<PathBuf>,

    /// Total number of sentences, used for learning-rate scheduling and the
    /// progress bar when the vocabulary is preloaded
    #[arg(short = 'I', long = "total-sentences", default_value_t = 0)]
    total_sentences: u64,

    /// Number of worker threads
    #[arg(short, long, default_value_t = 1)]
    threads: usize,

    /// Buffer size in sentences. Memory footprint is on the order of
    /// buffer-size x average sentence length; a larger buffer shuffles better
    #[arg(short = 'B', long = "buffer-size", default_value_t = 500_000)]
    buffer_size: usize,

    /// Path the embeddings are saved to. Defaults to
    /// embeddings_${CURRENT_DATETIME}.txt. When the vocabulary is built from
    /// the corpus it is stored at the same path with a '.vocab' suffix
    #[arg(short = 'p', long = "embedding-path", value_name = "PATH")]
    embedding_path: Option<PathBuf>,

    /// Continue training from an existing embedding table (see
    /// --continue-vocab)
    #[arg(short = 'r', long = "pretrained-path", value_name = "PATH")]
    pretrained_path: Option<PathBuf>,

    /// Which vocab to use when continuing training (see --pretrained-path):
    /// old = from the pretrained table, new = from the data, union = combined
    #[arg(short = 'v', long = "continue-vocab", value_enum, default_value = "union")]
    continue_vocab: ContinueVocab,

    /// Force reading training files as text or gzip
    #[arg(long = "read-mode", value_enum, default_value = "auto")]
    read_mode: ReadMode,

    /// Shuffle sentences within a batch before allocating them to worker
    /// threads rather than assigning them consecutively
    #[arg(short = 's', long = "shuffle-sentences")]
    shuffle_sentences: bool,

    /// Use the partitioned parallel dispatch. Can be faster for lack of an
    /// atomic counter, but workers with less work wait for the others;
    /// changes the sentence processing order
    #[arg(short = 'L', long)]
    partitioned: bool,

    /// Schedule the learning rate as if training started from this epoch
    /// instead of the 0th
    #[arg(short = 'S', long = "start-lr-schedule-epoch", default_value_t = 0)]
    start_lr_schedule_epoch: usize,

    /// Schedule the learning rate as if training lasted this many epochs
    /// instead of what --epochs says. Zero means start-lr-schedule-epoch +
    /// epochs
    #[arg(short = 'E', long = "max-lr-schedule-epochs", default_value_t = 0)]
    max_lr_schedule_epochs: usize,

    /// Do not display counters and progress bars
    #[arg(short = 'P', long = "no-progress")]
    no_progress: bool,

    /// Fail if any line of a training file is longer than the line limit,
    /// instead of silently truncating it
    #[arg(long = "enforce-max-line-length")]
    enforce_max_line_length: bool,
}

fn validate(opt: &Options) -> Result<usize> {
    ensure!(opt.epochs > 0, "--epochs must be positive");
    ensure!(opt.dim > 0, "--dim must be positive");
    ensure!(opt.context_size >= 1, "--context-size must be at least 1");
    ensure!(opt.threads >= 1, "--threads must be at least 1");
    ensure!(opt.min_count >= 1, "--min-count must be at least 1");
    ensure!(opt.buffer_size > 0, "--buffer-size must be positive");
    ensure!(
        (0.0..=1.0).contains(&opt.ns_exponent),
        "--ns-exponent must be in [0, 1]"
    );
    ensure!(
        opt.max_lr_schedule_epochs == 0 || opt.max_lr_schedule_epochs >= opt.epochs,
        "--max-lr-schedule-epochs must be zero or at least --epochs"
    );
    let max_schedule_epochs = if opt.max_lr_schedule_epochs == 0 {
        opt.start_lr_schedule_epoch + opt.epochs
    } else {
        opt.max_lr_schedule_epochs
    };
    ensure!(
        opt.start_lr_schedule_epoch < max_schedule_epochs,
        "--start-lr-schedule-epoch must be below the schedule horizon"
    );
    if opt.vocab_load_path.is_some() {
        ensure!(
            opt.min_count == 1,
            "--min-count should not be passed when preloading a vocabulary"
        );
        ensure!(
            opt.vocab_size.is_none(),
            "--vocab-size should not be passed when preloading a vocabulary"
        );
    } else {
        ensure!(
            opt.total_sentences == 0,
            "--total-sentences should not be passed when not preloading a vocabulary"
        );
    }
    Ok(max_schedule_epochs)
}

fn run(opt: Options) -> Result<()> {
    let max_schedule_epochs = validate(&opt)?;
    let show_progress = !opt.no_progress;

    let embedding_path = opt.embedding_path.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "embeddings_{}.txt",
            chrono::Local::now().format("%F_%T")
        ))
    });

    let pretrained = match &opt.pretrained_path {
        Some(path) => {
            println!("Reading pretrained embeddings...");
            load_pretrained(path, opt.read_mode, opt.dim, opt.enforce_max_line_length)?
        }
        None => HashMap::new(),
    };

    // Build or load the vocabulary. Loading switches the unknown-word policy
    // on the presence of the UNK sentinel in the first line.
    let mut discard = opt.discard;
    let (ordered, mut freqs, total_sentences) = match &opt.vocab_load_path {
        None => {
            let (freqs, lines) = build_vocab(
                &opt.files,
                opt.read_mode,
                opt.enforce_max_line_length,
                show_progress,
            )?;
            let (ordered, freqs) = assemble_vocab(
                freqs,
                &pretrained,
                opt.continue_vocab,
                discard,
                opt.min_count,
                opt.vocab_size,
            )?;
            let vocab_path = PathBuf::from(format!("{}.vocab", embedding_path.display()));
            println!("Saving vocab file...");
            save_vocab(&vocab_path, &ordered, &freqs)?;
            (ordered, freqs, lines)
        }
        Some(path) => {
            println!("Loading vocab file {path:?}...");
            let (ordered, freqs) = load_vocab(path)?;
            discard = ordered.first().map_or(true, |w| w != UNK);
            (ordered, freqs, opt.total_sentences)
        }
    };

    let mut vocab = IndexMap::default();
    for word in &ordered {
        vocab.insert(word);
    }
    let vocab = Arc::new(vocab);
    println!("Vocab size: {}", vocab.len());

    if total_sentences > 0 {
        println!("Total training sentences: {total_sentences}");
    } else {
        eprintln!(
            "WARN: Total number of sentences is unknown, so learning rate \
             scheduling and the progress bar are disabled. Feed it in via \
             --total-sentences to enable them."
        );
    }

    // The UNK sentinel never counts as a real observation.
    if !discard {
        freqs.insert(UNK.to_string(), 0);
    }
    let counts: Vec<u64> = ordered
        .iter()
        .map(|word| {
            freqs
                .get(word)
                .copied()
                .context("vocabulary word has no count")
        })
        .collect::<Result<_>>()?;
    drop(freqs);
    drop(ordered);
    let total_tokens: u64 = counts.iter().sum();
    ensure!(total_tokens > 0, "training corpus has no in-vocabulary tokens");

    let filter_probs = probs::subsample_probs(&counts, opt.downsample_threshold);
    let neg_probs = probs::negative_sampling_probs(&counts, opt.ns_exponent);

    let table = Table::zeros(vocab.len(), opt.dim);
    let ctx = Table::zeros(vocab.len(), opt.dim);
    init_tables(&table, &ctx, &vocab, &pretrained, GLOBAL_SEED);
    drop(pretrained);

    let params = Params {
        dim: opt.dim,
        ctxs: opt.context_size,
        negatives: opt.negatives,
        threads: opt.threads,
        use_bad_update: opt.use_bad_update,
    };
    let trainer = Trainer::new(params, &table, &ctx, filter_probs);
    let mut states = trainer.worker_states(&neg_probs)?;

    let parser = LineParser::new(Arc::clone(&vocab), discard)?;
    let read_whole = total_sentences > 0 && opt.buffer_size as u64 > total_sentences;
    if read_whole {
        eprintln!(
            "WARNING: Buffer size is larger than the total number of sentences \
             in the corpus -- will load the entire dataset into memory once \
             instead of streaming."
        );
    }
    let mut reader: Box<dyn Reader> = if read_whole {
        Box::new(OnceReader::new(
            parser,
            opt.files.clone(),
            opt.read_mode,
            opt.enforce_max_line_length,
        ))
    } else {
        Box::new(StreamingReader::new(
            parser,
            opt.files.clone(),
            opt.buffer_size,
            opt.read_mode,
            opt.enforce_max_line_length,
        )?)
    };

    let sched = train::Schedule {
        epochs: opt.epochs,
        init_lr: opt.learning_rate,
        min_lr: opt.min_learning_rate,
        shuffle: opt.shuffle_sentences,
        partitioned: opt.partitioned,
        start_epoch: opt.start_lr_schedule_epoch,
        max_schedule_epochs,
        total_sentences,
        show_progress,
    };

    let start = Instant::now();
    let trained_tokens = train::run(&trainer, &mut states, reader.as_mut(), &sched, opt.cbow)?;
    let seconds = start.elapsed().as_secs_f64();
    println!("Took {}s. (excluding vocab build)", seconds as u64);
    println!(
        "Overall speed was {:.0} toks/s",
        trained_tokens as f64 / seconds.max(f64::MIN_POSITIVE)
    );

    println!("Saving to {}", embedding_path.display());
    save_embeddings(&embedding_path, &vocab, &table)?;

    Ok(())
}

fn main() {
    let options = Options::parse();
    if let Err(err) = run(options) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}

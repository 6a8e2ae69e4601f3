//! Locates and applies diff chunks against drifted source text using fuzzy
//! context matching.
//!
//! `chunkpatch` works on a practical subset of the unified diff format, but
//! with a key difference from the standard `patch` command: it does not trust
//! line numbers. A patch is partitioned into *chunks* (one addition run plus
//! its optional immediately-preceding removal run and a handful of leading
//! context lines), and each chunk is located in the target by searching for
//! its context with a normalized similarity score. This makes it resilient to
//! targets that have drifted since the patch was written, which is the common
//! case for AI-generated diffs, review snippets, and out-of-date pull
//! requests.
//!
//! ## Getting Started
//!
//! The typical workflow is: build chunks from the patch text, evaluate a
//! chunk against a target buffer, and apply the resulting decision.
//!
//! ```rust
//! use chunkpatch::{
//!     apply_decision, build_chunks, locate_and_evaluate, ApplyDecision, ApplyOptions,
//!     ChunkOptions,
//! };
//!
//! // 1. Define the patch content. (Built programmatically here to avoid
//! //    rustdoc parsing issues with fenced blocks.)
//! let patch = [
//!     "+++ b/src/lib.rs",
//!     "@@ -1,3 +1,3 @@",
//!     " fn greet() {",
//!     "-    println!(\"hello\");",
//!     "+    println!(\"hello, chunkpatch!\");",
//!     " }",
//! ]
//! .join("\n");
//!
//! // 2. Build the chunk list.
//! let set = build_chunks(&patch, &ChunkOptions::default());
//! assert_eq!(set.len(), 1);
//! let chunk = &set.chunks()[0];
//! assert_eq!(chunk.context_lines, vec!["fn greet() {"]);
//! assert_eq!(chunk.file_path.as_deref().unwrap().to_str(), Some("src/lib.rs"));
//!
//! // 3. Evaluate the chunk against a target buffer.
//! let target = vec!["fn greet() {", "    println!(\"hello\");", "}"];
//! let options = ApplyOptions::default();
//! let decision = locate_and_evaluate(&target, chunk, &options);
//! assert_eq!(decision, ApplyDecision::Unapplied { start_index: 1 });
//!
//! // 4. Apply it. The input buffer is never mutated; the caller swaps in the
//! //    returned buffer wholesale.
//! let patched = apply_decision(&target, &decision, chunk).unwrap();
//! assert_eq!(
//!     patched,
//!     vec!["fn greet() {", "    println!(\"hello, chunkpatch!\");", "}"]
//! );
//!
//! // 5. Re-evaluating against the patched buffer reports the chunk as done.
//! assert_eq!(
//!     locate_and_evaluate(&patched, chunk, &options),
//!     ApplyDecision::AlreadyApplied
//! );
//! ```
//!
//! ## Key Concepts
//!
//! ### Chunks, not hunks
//!
//! A `@@ ... @@` hunk may contain several independent edits. [`build_chunks`]
//! splits each hunk into [`Chunk`]s: a contiguous run of `+` lines, the
//! contiguous run of `-` lines immediately before it (if any), and up to N
//! (1–3, see [`ChunkOptions`]) preceding non-blank context lines collected by
//! a backward scan that skips blank context. A `-` run with no `+` run after
//! it forms no chunk at all.
//!
//! ### Decisions, not exceptions
//!
//! Evaluating a chunk against a target never fails with an error. The result
//! is an [`ApplyDecision`]: the chunk is ready to apply at a resolved index
//! (`Unapplied`), its added lines are already present and its removed lines
//! are gone (`AlreadyApplied`), or its context cannot be found with enough
//! confidence (`Unresolvable`). Malformed patch text likewise never raises —
//! the worst case is an empty chunk list or an unknown line hint.
//!
//! ### Rebuild, don't patch
//!
//! The chunk list is an immutable value: whenever the patch text changes,
//! call [`build_chunks`] again and replace the whole [`ChunkSet`]. Decisions
//! are ephemeral and must be recomputed after any edit to the target buffer;
//! the core assumes no event loop, so debouncing rapid edits (≈100–150 ms of
//! quiescence) is the caller's job.
//!
//! ## Feature Flags
//!
//! ### `parallel`
//!
//! - **Enabled by default.**
//! - Parallelizes the fuzzy locator's window scan with
//!   [`rayon`](https://crates.io/crates/rayon). Disable with
//!   `default-features = false` for single-threaded targets.
use log::{debug, info, trace, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use similar::udiff::unified_diff;
use similar::TextDiff;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// --- Error Types ---

/// Returned by [`apply_decision`] when the decision does not permit applying.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyError {
    /// The chunk's added lines are already present at the expected location.
    #[error("chunk is already applied to the target")]
    AlreadyApplied,
    /// The chunk's context could not be resolved in the target.
    #[error("chunk context could not be resolved in the target")]
    Unresolvable,
}

/// "Hard" errors from the filesystem-level apply functions.
///
/// These are distinct from per-chunk [`ApplyDecision`]s: a decision describes
/// whether one chunk fits one buffer, while a `PatchError` stops the whole
/// operation for a file.
#[derive(Error, Debug)]
pub enum PatchError {
    /// The chunk's file path resolves outside the target directory. This is a
    /// security measure against malicious patches (e.g. `+++ b/../../etc/passwd`).
    #[error("Path '{0}' resolves outside the target directory. Aborting for security.")]
    PathTraversal(PathBuf),
    /// The target file for a chunk group does not exist.
    #[error("Target file not found for patching: {0}")]
    TargetNotFound(PathBuf),
    /// The user does not have permission to read or write the path.
    #[error("Permission denied for path: {path:?}")]
    PermissionDenied { path: PathBuf },
    /// The target path exists but is a directory.
    #[error("Target path is a directory, not a file: {path:?}")]
    TargetIsDirectory { path: PathBuf },
    /// Any other I/O error while reading or writing a file.
    #[error("I/O error while processing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// --- Data Structures ---

/// The classification of one raw patch line.
///
/// Produced by [`classify_line`]; the variants map one-to-one onto the
/// recognized patch grammar. Header context (which file, which hunk) is
/// tracked by the chunk builder, not the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    /// A `+++ ` new-file header.
    NewFileHeader,
    /// An `@@` hunk header.
    HunkHeader,
    /// An addition line (`+`, but not `+++`).
    Add,
    /// A removal line (`-`, but not `---`).
    Del,
    /// A context line (leading single space). `blank` is true when the
    /// remainder is all whitespace.
    Context { blank: bool },
    /// Anything else. Ends the active hunk during chunk building.
    Other,
}

/// One line of the patch document: its raw text and derived tag.
///
/// Lines live in a flat arena indexed by ordinal (see [`ChunkSet::lines`]);
/// chunks reference them by `(start, end)` spans rather than back-pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// The raw line text, including the leading marker character.
    pub text: String,
    /// The derived classification.
    pub tag: LineTag,
}

/// One applicable unit of a patch.
///
/// A chunk is a contiguous run of added lines, the contiguous run of removed
/// lines immediately before it (possibly empty), and up to N preceding
/// non-blank context lines. `added_lines` is never empty; a removal run with
/// no following addition run does not form a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The path from the most recent `+++ ` header at or before this chunk.
    /// `None` when no header was seen; callers must handle that case.
    pub file_path: Option<PathBuf>,
    /// Up to N non-blank context lines, oldest first, marker stripped.
    pub context_lines: Vec<String>,
    /// The removed lines, marker stripped. May be empty (pure insertion).
    pub removed_lines: Vec<String>,
    /// The added lines, marker stripped. Never empty.
    pub added_lines: Vec<String>,
    /// Inclusive `(start, end)` ordinals into the patch line arena, covering
    /// the chunk's context, removed, and added lines.
    pub source_span: (usize, usize),
    /// The new-file line number at which the addition run is expected to
    /// begin, derived from the nearest hunk header. `None` when the header's
    /// `+<digits>` field was unparsable; treat as unknown.
    pub target_start_hint: Option<usize>,
}

impl Chunk {
    /// The number of leading context lines carried by this chunk.
    pub fn n_context(&self) -> usize {
        self.context_lines.len()
    }
}

/// The result of one full chunk rebuild: the tagged line arena plus the
/// ordered, non-overlapping chunk list.
///
/// A `ChunkSet` is an immutable value. When the patch text changes, rebuild
/// with [`build_chunks`] and replace the whole set; never patch it in place.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkSet {
    lines: Vec<Line>,
    chunks: Vec<Chunk>,
}

impl ChunkSet {
    /// The chunks, in non-decreasing source order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// The tagged line arena, indexed by ordinal.
    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    /// The chunk count.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True when no chunks were found.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Returns the chunk at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }
}

/// The decision for one chunk against one target buffer snapshot.
///
/// Decisions are ephemeral: they are computed on demand and must not be
/// cached across edits to the target buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDecision {
    /// The chunk is ready to apply. `start_index` is the 0-based line index
    /// where the removed lines (or, for a pure insertion, the added lines)
    /// begin in the target.
    Unapplied { start_index: usize },
    /// The chunk's added lines are already present at the expected location
    /// and its removed lines are not found nearby.
    AlreadyApplied,
    /// The chunk's context could not be located with enough confidence, or
    /// its removed lines were not found near the anchor.
    Unresolvable,
}

/// Options for chunk building.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    /// How many non-blank context lines to collect before each chunk.
    /// Clamped to 1..=3.
    pub context_before: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self { context_before: 3 }
    }
}

impl ChunkOptions {
    /// Creates a new builder for `ChunkOptions`.
    ///
    /// # Example
    ///
    /// ```
    /// # use chunkpatch::ChunkOptions;
    /// let options = ChunkOptions::builder().context_before(2).build();
    /// assert_eq!(options.context_before, 2);
    /// ```
    pub fn builder() -> ChunkOptionsBuilder {
        ChunkOptionsBuilder::default()
    }
}

/// A builder for creating `ChunkOptions`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkOptionsBuilder {
    context_before: Option<usize>,
}

impl ChunkOptionsBuilder {
    /// Sets how many non-blank context lines to collect before each chunk
    /// (clamped to 1..=3 at build time).
    pub fn context_before(mut self, context_before: usize) -> Self {
        self.context_before = Some(context_before);
        self
    }

    /// Builds the `ChunkOptions`.
    pub fn build(self) -> ChunkOptions {
        let default = ChunkOptions::default();
        ChunkOptions {
            context_before: self.context_before.unwrap_or(default.context_before),
        }
    }
}

/// Options for locating and applying chunks.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// If `true`, the filesystem functions modify nothing and instead return
    /// a unified diff of the proposed changes in [`FileResult`].
    pub dry_run: bool,
    /// The minimum similarity score (0–100) for the fuzzy locator to accept
    /// a context match. Higher is stricter.
    pub min_score: u8,
    /// How many lines around the context anchor to search for a drifted
    /// removed-lines block.
    pub drift_window: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            min_score: 75,
            drift_window: 30,
        }
    }
}

impl ApplyOptions {
    /// Creates a new builder for `ApplyOptions`.
    ///
    /// # Example
    ///
    /// ```
    /// # use chunkpatch::ApplyOptions;
    /// let options = ApplyOptions::builder()
    ///     .dry_run(true)
    ///     .min_score(90)
    ///     .build();
    ///
    /// assert_eq!(options.dry_run, true);
    /// assert_eq!(options.min_score, 90);
    /// assert_eq!(options.drift_window, 30);
    /// ```
    pub fn builder() -> ApplyOptionsBuilder {
        ApplyOptionsBuilder::default()
    }
}

/// A builder for creating `ApplyOptions`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptionsBuilder {
    dry_run: Option<bool>,
    min_score: Option<u8>,
    drift_window: Option<usize>,
}

impl ApplyOptionsBuilder {
    /// If `true`, the filesystem functions modify nothing and instead return
    /// a unified diff of the proposed changes.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    /// Sets the minimum similarity score (0–100) for accepting a context
    /// match. Higher is stricter.
    pub fn min_score(mut self, min_score: u8) -> Self {
        self.min_score = Some(min_score);
        self
    }

    /// Sets the search window (in lines) around the context anchor for
    /// drifted removed-lines blocks.
    pub fn drift_window(mut self, drift_window: usize) -> Self {
        self.drift_window = Some(drift_window);
        self
    }

    /// Builds the `ApplyOptions`.
    pub fn build(self) -> ApplyOptions {
        let default = ApplyOptions::default();
        ApplyOptions {
            dry_run: self.dry_run.unwrap_or(default.dry_run),
            min_score: self.min_score.unwrap_or(default.min_score),
            drift_window: self.drift_window.unwrap_or(default.drift_window),
        }
    }
}

// --- Line Classifier ---

/// Classifies one raw patch line.
///
/// Pure and order-independent; the chunk builder tracks header context. The
/// rules, in priority order: `+++ ` new-file header, `@@` hunk header, `+`
/// addition (excluding `+++`), `-` removal (excluding `---`), leading-space
/// context (blank or not), anything else `Other`.
///
/// # Example
///
/// ```
/// # use chunkpatch::{classify_line, LineTag};
/// assert_eq!(classify_line("+++ b/src/lib.rs"), LineTag::NewFileHeader);
/// assert_eq!(classify_line("@@ -1,3 +1,3 @@"), LineTag::HunkHeader);
/// assert_eq!(classify_line("+added"), LineTag::Add);
/// assert_eq!(classify_line("-removed"), LineTag::Del);
/// assert_eq!(classify_line(" context"), LineTag::Context { blank: false });
/// assert_eq!(classify_line("   "), LineTag::Context { blank: true });
/// assert_eq!(classify_line("--- a/src/lib.rs"), LineTag::Other);
/// assert_eq!(classify_line("diff --git a/x b/x"), LineTag::Other);
/// ```
pub fn classify_line(line: &str) -> LineTag {
    if line.starts_with("+++ ") {
        LineTag::NewFileHeader
    } else if line.starts_with("@@") {
        LineTag::HunkHeader
    } else if line.starts_with('+') && !line.starts_with("+++") {
        LineTag::Add
    } else if line.starts_with('-') && !line.starts_with("---") {
        LineTag::Del
    } else if let Some(rest) = line.strip_prefix(' ') {
        LineTag::Context {
            blank: rest.trim().is_empty(),
        }
    } else {
        LineTag::Other
    }
}

/// Extracts the target path from a `+++ ` header line.
///
/// The path is the second whitespace-delimited token with a leading `b/`
/// stripped; a missing token yields an empty path.
fn parse_new_file_path(line: &str) -> PathBuf {
    let token = line.split_whitespace().nth(1).unwrap_or("");
    PathBuf::from(token.strip_prefix("b/").unwrap_or(token))
}

/// Extracts the new-file starting line number from an `@@` header line.
///
/// Takes the first `+<digits>` match anywhere in the line. Returns `None`
/// for an unparsable header; the chunk's hint is then unknown, never an
/// abort.
fn parse_hunk_new_start(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'+' {
            let digits_start = i + 1;
            let mut digits_end = digits_start;
            while digits_end < bytes.len() && bytes[digits_end].is_ascii_digit() {
                digits_end += 1;
            }
            if digits_end > digits_start {
                return line[digits_start..digits_end].parse().ok();
            }
        }
        i += 1;
    }
    None
}

// --- Chunk Builder ---

/// The hunk currently being scanned: where its header sits in the arena and
/// the parsed `+<digits>` start (if any).
#[derive(Debug, Clone, Copy)]
struct ActiveHunk {
    header_ordinal: usize,
    new_start: Option<usize>,
}

/// Builds the full chunk list for `patch_text`.
///
/// This is a pure full rebuild: the entire list is recomputed and returned as
/// a fresh [`ChunkSet`] every call, so two calls on the same text yield
/// bit-for-bit identical results and a reader can never observe a partially
/// updated list. Parsing never fails; malformed input produces fewer (or
/// zero) chunks.
///
/// Lines outside an `@@` hunk are skipped. Within a hunk, each contiguous
/// removal run plus its mandatory following addition run forms one chunk,
/// together with up to `options.context_before` preceding non-blank context
/// lines (backward scan, blank context transparently skipped). Any
/// unrecognized line ends the active hunk but not the document scan.
///
/// # Example
///
/// ```
/// # use chunkpatch::{build_chunks, ChunkOptions};
/// let patch = [
///     "+++ b/notes.txt",
///     "@@ -10,4 +12,4 @@",
///     " alpha",
///     " ",
///     "-beta",
///     "+BETA",
/// ]
/// .join("\n");
/// let set = build_chunks(&patch, &ChunkOptions::default());
/// let chunk = &set.chunks()[0];
/// // The blank context line is skipped by the backward scan, not a barrier.
/// assert_eq!(chunk.context_lines, vec!["alpha"]);
/// assert_eq!(chunk.removed_lines, vec!["beta"]);
/// assert_eq!(chunk.added_lines, vec!["BETA"]);
/// assert_eq!(chunk.target_start_hint, Some(14));
/// ```
pub fn build_chunks(patch_text: &str, options: &ChunkOptions) -> ChunkSet {
    let limit = options.context_before.clamp(1, 3);
    let lines: Vec<Line> = patch_text
        .lines()
        .map(|l| Line {
            text: l.to_string(),
            tag: classify_line(l),
        })
        .collect();
    trace!("Classified {} patch line(s).", lines.len());

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current_file: Option<PathBuf> = None;
    let mut active_hunk: Option<ActiveHunk> = None;

    let mut i = 0;
    while i < lines.len() {
        let tag = lines[i].tag;

        if tag == LineTag::NewFileHeader {
            let path = parse_new_file_path(&lines[i].text);
            trace!("New file header at line {}: '{}'", i, path.display());
            current_file = Some(path);
            active_hunk = None;
            i += 1;
            continue;
        }
        if tag == LineTag::HunkHeader {
            let new_start = parse_hunk_new_start(&lines[i].text);
            if new_start.is_none() {
                debug!("Unparsable hunk header at line {}; hint unknown.", i);
            }
            active_hunk = Some(ActiveHunk {
                header_ordinal: i,
                new_start,
            });
            i += 1;
            continue;
        }
        let Some(hunk) = active_hunk else {
            // Outside any hunk; not part of a chunk.
            i += 1;
            continue;
        };

        match tag {
            LineTag::Context { .. } => {
                i += 1;
            }
            LineTag::Add | LineTag::Del => {
                // Maximal removal run (possibly empty), then the mandatory
                // addition run.
                let del_start = i;
                let mut j = i;
                while j < lines.len() && lines[j].tag == LineTag::Del {
                    j += 1;
                }
                let del_end = j;
                let add_start = j;
                while j < lines.len() && lines[j].tag == LineTag::Add {
                    j += 1;
                }
                let add_end = j;

                if add_end == add_start {
                    // A removal run with no addition run after it is not a
                    // chunk. Resume right after it.
                    trace!(
                        "Removal run at lines {}..{} has no addition run; skipping.",
                        del_start,
                        del_end
                    );
                    i = del_end;
                    continue;
                }

                let first_data = if del_end > del_start {
                    del_start
                } else {
                    add_start
                };
                let context_ordinals = collect_preceding_context(&lines, first_data, limit);
                let span_start = context_ordinals.first().copied().unwrap_or(first_data);
                let span_end = add_end - 1;

                // The hint counts lines present in the new file (everything
                // but removals) between the hunk header and the data run.
                let target_start_hint = hunk.new_start.map(|start| {
                    let offset = lines[hunk.header_ordinal + 1..first_data]
                        .iter()
                        .filter(|l| l.tag != LineTag::Del)
                        .count();
                    start + offset
                });

                let chunk = Chunk {
                    file_path: current_file.clone(),
                    context_lines: context_ordinals
                        .iter()
                        .map(|&ord| lines[ord].text[1..].to_string())
                        .collect(),
                    removed_lines: lines[del_start..del_end]
                        .iter()
                        .map(|l| l.text[1..].to_string())
                        .collect(),
                    added_lines: lines[add_start..add_end]
                        .iter()
                        .map(|l| l.text[1..].to_string())
                        .collect(),
                    source_span: (span_start, span_end),
                    target_start_hint,
                };
                debug!(
                    "Chunk {} spans patch lines {}..={} ({} ctx, {} del, {} add).",
                    chunks.len(),
                    span_start,
                    span_end,
                    chunk.context_lines.len(),
                    chunk.removed_lines.len(),
                    chunk.added_lines.len()
                );
                chunks.push(chunk);
                i = add_end;
            }
            _ => {
                // Any other line ends the active hunk, not the scan.
                trace!("Line {} ends the active hunk.", i);
                active_hunk = None;
                i += 1;
            }
        }
    }

    debug!("Built {} chunk(s) from the patch text.", chunks.len());
    ChunkSet { lines, chunks }
}

/// Walks backward from `first_data`, collecting up to `limit` non-blank
/// context ordinals. Blank context lines are skipped without ending the
/// scan; a hunk header or any non-context line ends it. Returned oldest
/// first.
fn collect_preceding_context(lines: &[Line], first_data: usize, limit: usize) -> Vec<usize> {
    let mut collected = Vec::new();
    let mut ord = first_data;
    while collected.len() < limit && ord > 0 {
        ord -= 1;
        match lines[ord].tag {
            LineTag::Context { blank: false } => collected.push(ord),
            LineTag::Context { blank: true } => continue,
            _ => break,
        }
    }
    collected.reverse();
    collected
}

// --- Fuzzy Locator ---

/// A normalized string-similarity metric for the fuzzy locator.
///
/// Implementations must satisfy `score(a, a) == 100` and be monotonic in
/// edit distance; any normalized edit-distance ratio qualifies. The locator
/// is not bound to one implementation — see [`locate_block_with`] and
/// [`locate_and_evaluate_with`].
pub trait SimilarityScorer: Sync {
    /// Scores the similarity of two strings on a 0–100 scale.
    fn score(&self, a: &str, b: &str) -> u8;
}

/// The default scorer, backed by [`similar`]'s character-level diff ratio.
///
/// The ratio is floored when scaling to 0–100, so only identical inputs
/// score exactly 100.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffRatioScorer;

impl SimilarityScorer for DiffRatioScorer {
    fn score(&self, a: &str, b: &str) -> u8 {
        if a == b {
            return 100;
        }
        let ratio = TextDiff::from_chars(a, b).ratio();
        (f64::from(ratio) * 100.0).floor().clamp(0.0, 99.0) as u8
    }
}

/// Scores every window of `query_lines.len()` lines in the target and
/// returns the best `(0-based start, score)`, earliest window on ties.
fn best_window<T, Q, S>(target_lines: &[T], query_lines: &[Q], scorer: &S) -> Option<(usize, u8)>
where
    T: AsRef<str> + Sync,
    Q: AsRef<str>,
    S: SimilarityScorer,
{
    let window_len = query_lines.len();
    if window_len == 0 || target_lines.is_empty() || window_len > target_lines.len() {
        trace!(
            "  Window scan skipped: query {} line(s), target {} line(s).",
            window_len,
            target_lines.len()
        );
        return None;
    }

    let query = query_lines
        .iter()
        .map(|l| l.as_ref())
        .collect::<Vec<_>>()
        .join("\n");

    let score_at = |start: usize| {
        let window = target_lines[start..start + window_len]
            .iter()
            .map(|l| l.as_ref())
            .collect::<Vec<_>>()
            .join("\n");
        (start, scorer.score(&query, &window))
    };

    #[cfg(feature = "parallel")]
    let scored: Vec<(usize, u8)> = (0..=target_lines.len() - window_len)
        .into_par_iter()
        .map(score_at)
        .collect();
    #[cfg(not(feature = "parallel"))]
    let scored: Vec<(usize, u8)> = (0..=target_lines.len() - window_len)
        .map(score_at)
        .collect();

    // Sequential reduction keeps the earliest-window tie-break deterministic.
    let mut best: Option<(usize, u8)> = None;
    for (start, score) in scored {
        let better = match best {
            None => true,
            Some((_, best_score)) => score > best_score,
        };
        if better {
            trace!("    New best window: score {} at index {}.", score, start);
            best = Some((start, score));
        }
    }
    best
}

/// Finds the best-scoring position of `query_lines` in `target_lines`.
///
/// Slides a window of `query_lines.len()` lines over the target, scoring
/// each against the newline-joined query with the default
/// [`DiffRatioScorer`]. Returns the **1-based** start line of the best
/// window if its score is at least `min_score`; ties resolve to the
/// earliest window. An empty query or empty target fails immediately.
///
/// The scan is `O(target × query²)` in the worst case: fine for on-demand
/// interactive use, not for running on every keystroke — debounce upstream.
///
/// # Example
///
/// ```
/// # use chunkpatch::locate_block;
/// let target = vec!["alpha", "beta", "gamma", "delta"];
/// assert_eq!(locate_block(&target, &["beta", "gamma"], 75), Some(2));
/// assert_eq!(locate_block(&target, &["zzzz"], 75), None);
/// assert_eq!(locate_block(&target, &[] as &[&str], 75), None);
/// ```
pub fn locate_block<T, Q>(target_lines: &[T], query_lines: &[Q], min_score: u8) -> Option<usize>
where
    T: AsRef<str> + Sync,
    Q: AsRef<str>,
{
    locate_block_with(target_lines, query_lines, min_score, &DiffRatioScorer)
}

/// [`locate_block`] with a caller-supplied [`SimilarityScorer`].
pub fn locate_block_with<T, Q, S>(
    target_lines: &[T],
    query_lines: &[Q],
    min_score: u8,
    scorer: &S,
) -> Option<usize>
where
    T: AsRef<str> + Sync,
    Q: AsRef<str>,
    S: SimilarityScorer,
{
    let (start, score) = best_window(target_lines, query_lines, scorer)?;
    if score >= min_score {
        debug!(
            "  Located query block at line {} (score {} >= {}).",
            start + 1,
            score,
            min_score
        );
        Some(start + 1)
    } else {
        debug!(
            "  Best window at line {} scored {} (< {}); no match.",
            start + 1,
            score,
            min_score
        );
        None
    }
}

// --- Applicability Evaluator ---

/// True when `block` occurs verbatim at `index` in the target.
fn block_matches_at<T: AsRef<str>>(target_lines: &[T], index: usize, block: &[String]) -> bool {
    if block.is_empty() {
        return false;
    }
    match target_lines.get(index..index + block.len()) {
        Some(window) => window
            .iter()
            .map(|l| l.as_ref())
            .eq(block.iter().map(String::as_str)),
        None => false,
    }
}

/// Searches for an exact occurrence of `block` within `window` lines of
/// `base`, nearest first; on equal distance the lower index wins. Target
/// files drift, but the context anchors the search — bounding it avoids
/// false positives from unrelated identical lines far away.
fn find_block_near<T: AsRef<str>>(
    target_lines: &[T],
    base: usize,
    block: &[String],
    window: usize,
) -> Option<usize> {
    for distance in 0..=window {
        if let Some(below) = base.checked_sub(distance) {
            if block_matches_at(target_lines, below, block) {
                return Some(below);
            }
        }
        if distance > 0 && block_matches_at(target_lines, base + distance, block) {
            return Some(base + distance);
        }
    }
    None
}

/// Evaluates a chunk against a target buffer snapshot.
///
/// Composes the fuzzy locator and the applicability rules:
///
/// 1. No context, or context not located at `options.min_score` →
///    [`ApplyDecision::Unresolvable`].
/// 2. The expected data position is the line right after the matched
///    context (clamped to the buffer).
/// 3. If the added lines are already there verbatim and the removed lines
///    are absent within `options.drift_window` lines →
///    [`ApplyDecision::AlreadyApplied`]. (Heuristic: it can false-positive
///    when the added content coincidentally predates the patch.)
/// 4. Otherwise the removed lines must occur exactly at that position or
///    within the drift window; found → [`ApplyDecision::Unapplied`] at the
///    occurrence, not found → [`ApplyDecision::Unresolvable`].
/// 5. A pure insertion (no removed lines) is `Unapplied` at the expected
///    position.
///
/// The decision is valid only for this exact buffer snapshot; recompute
/// after any edit (debounced by the caller).
pub fn locate_and_evaluate<T: AsRef<str> + Sync>(
    target_lines: &[T],
    chunk: &Chunk,
    options: &ApplyOptions,
) -> ApplyDecision {
    locate_and_evaluate_with(target_lines, chunk, options, &DiffRatioScorer)
}

/// [`locate_and_evaluate`] with a caller-supplied [`SimilarityScorer`].
pub fn locate_and_evaluate_with<T, S>(
    target_lines: &[T],
    chunk: &Chunk,
    options: &ApplyOptions,
    scorer: &S,
) -> ApplyDecision
where
    T: AsRef<str> + Sync,
    S: SimilarityScorer,
{
    if chunk.context_lines.is_empty() {
        debug!("  Chunk has no context lines; unresolvable.");
        return ApplyDecision::Unresolvable;
    }
    let Some((ctx_start, score)) = best_window(target_lines, &chunk.context_lines, scorer) else {
        debug!("  No context window fits the target; unresolvable.");
        return ApplyDecision::Unresolvable;
    };
    if score < options.min_score {
        debug!(
            "  Context match scored {} (< {}); unresolvable.",
            score, options.min_score
        );
        return ApplyDecision::Unresolvable;
    }

    // 0-based index where the removed/added content is expected to begin,
    // clamped to the buffer.
    let base_index = (ctx_start + chunk.context_lines.len()).min(target_lines.len());
    trace!(
        "  Context matched at index {} (score {}); data expected at {}.",
        ctx_start,
        score,
        base_index
    );

    if block_matches_at(target_lines, base_index, &chunk.added_lines) {
        let removed_nearby = !chunk.removed_lines.is_empty()
            && find_block_near(
                target_lines,
                base_index,
                &chunk.removed_lines,
                options.drift_window,
            )
            .is_some();
        if !removed_nearby {
            debug!("  Added lines present and removed lines absent; already applied.");
            return ApplyDecision::AlreadyApplied;
        }
    }

    if chunk.removed_lines.is_empty() {
        // Pure insertion.
        return ApplyDecision::Unapplied {
            start_index: base_index,
        };
    }

    match find_block_near(
        target_lines,
        base_index,
        &chunk.removed_lines,
        options.drift_window,
    ) {
        Some(start_index) => {
            if start_index != base_index {
                debug!(
                    "  Removed lines drifted from {} to {} (within window {}).",
                    base_index, start_index, options.drift_window
                );
            }
            ApplyDecision::Unapplied { start_index }
        }
        None => {
            debug!(
                "  Removed lines not found within {} line(s) of index {}; unresolvable.",
                options.drift_window, base_index
            );
            ApplyDecision::Unresolvable
        }
    }
}

// --- Patch Applicator ---

/// Performs the chunk substitution on a target buffer.
///
/// Pure function: returns a new buffer with `removed_lines.len()` lines
/// replaced by `added_lines` at `start_index` (a pure insertion when
/// `removed_lines` is empty). The input is never mutated; the caller must
/// replace its buffer wholesale with the result. Out-of-range spans are
/// clamped to the buffer bounds, never indexed out of range.
///
/// # Example
///
/// ```
/// # use chunkpatch::apply_chunk;
/// let target = vec!["a", "b", "c"];
/// let patched = apply_chunk(&target, 1, &["b"], &["B", "B2"]);
/// assert_eq!(patched, vec!["a", "B", "B2", "c"]);
/// ```
pub fn apply_chunk<T, R, A>(
    target_lines: &[T],
    start_index: usize,
    removed_lines: &[R],
    added_lines: &[A],
) -> Vec<String>
where
    T: AsRef<str>,
    R: AsRef<str>,
    A: AsRef<str>,
{
    let start = start_index.min(target_lines.len());
    let resume = (start + removed_lines.len()).min(target_lines.len());

    let mut new_lines = Vec::with_capacity(target_lines.len() + added_lines.len());
    new_lines.extend(target_lines[..start].iter().map(|l| l.as_ref().to_string()));
    new_lines.extend(added_lines.iter().map(|l| l.as_ref().to_string()));
    new_lines.extend(target_lines[resume..].iter().map(|l| l.as_ref().to_string()));
    new_lines
}

/// Applies a chunk according to an [`ApplyDecision`].
///
/// Valid only for [`ApplyDecision::Unapplied`]; the other decisions return
/// the corresponding [`ApplyError`]. The decision must have been computed
/// against this exact buffer snapshot.
pub fn apply_decision<T: AsRef<str>>(
    target_lines: &[T],
    decision: &ApplyDecision,
    chunk: &Chunk,
) -> Result<Vec<String>, ApplyError> {
    match decision {
        ApplyDecision::Unapplied { start_index } => Ok(apply_chunk(
            target_lines,
            *start_index,
            &chunk.removed_lines,
            &chunk.added_lines,
        )),
        ApplyDecision::AlreadyApplied => Err(ApplyError::AlreadyApplied),
        ApplyDecision::Unresolvable => Err(ApplyError::Unresolvable),
    }
}

// --- Filesystem Glue ---

/// Per-chunk outcomes for one file-level apply operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// One decision per chunk, in chunk order. `Unapplied` entries were
    /// applied (or would be, in dry-run mode).
    pub chunk_results: Vec<ApplyDecision>,
}

impl ApplyReport {
    /// True when no chunk was unresolvable.
    pub fn all_resolved(&self) -> bool {
        !self
            .chunk_results
            .iter()
            .any(|d| matches!(d, ApplyDecision::Unresolvable))
    }

    /// The 1-based indices of the unresolvable chunks.
    ///
    /// # Example
    ///
    /// ```
    /// # use chunkpatch::{ApplyDecision, ApplyReport};
    /// let report = ApplyReport {
    ///     chunk_results: vec![
    ///         ApplyDecision::Unapplied { start_index: 0 },
    ///         ApplyDecision::Unresolvable,
    ///         ApplyDecision::AlreadyApplied,
    ///     ],
    /// };
    /// assert!(!report.all_resolved());
    /// assert_eq!(report.unresolved(), vec![2]);
    /// ```
    pub fn unresolved(&self) -> Vec<usize> {
        self.chunk_results
            .iter()
            .enumerate()
            .filter_map(|(i, d)| matches!(d, ApplyDecision::Unresolvable).then_some(i + 1))
            .collect()
    }

    /// How many chunks were applied (or would be, in dry-run mode).
    pub fn applied_count(&self) -> usize {
        self.chunk_results
            .iter()
            .filter(|d| matches!(d, ApplyDecision::Unapplied { .. }))
            .count()
    }
}

/// The result of applying a group of chunks to lines in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryResult {
    /// The new buffer after applying every `Unapplied` chunk.
    pub new_lines: Vec<String>,
    /// Per-chunk outcomes.
    pub report: ApplyReport,
}

/// The result of applying a group of chunks to one file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResult {
    /// Per-chunk outcomes.
    pub report: ApplyReport,
    /// The unified diff of the proposed changes; populated only in dry-run
    /// mode.
    pub diff: Option<String>,
}

/// The result of applying a whole [`ChunkSet`] to a directory.
#[derive(Debug)]
pub struct BatchResult {
    /// One entry per target file, in first-seen chunk order.
    pub results: Vec<(PathBuf, Result<FileResult, PatchError>)>,
}

impl BatchResult {
    /// True when no file hit a "hard" error (I/O, traversal). Per-chunk
    /// outcomes still need inspecting via the individual [`FileResult`]s.
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// Every operation that failed with a hard error.
    pub fn hard_failures(&self) -> Vec<(&PathBuf, &PatchError)> {
        self.results
            .iter()
            .filter_map(|(path, r)| r.as_ref().err().map(|e| (path, e)))
            .collect()
    }
}

/// Converts a `std::io::Error` into a more specific `PatchError`.
fn map_io_error(path: PathBuf, e: std::io::Error) -> PatchError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => PatchError::PermissionDenied { path },
        std::io::ErrorKind::IsADirectory => PatchError::TargetIsDirectory { path },
        _ => PatchError::Io { path, source: e },
    }
}

/// Ensures a relative path, joined to a base directory, still resolves
/// inside that directory.
///
/// Guards against traversal in chunk file paths (e.g. `+++ b/../../etc/passwd`)
/// by canonicalizing both sides and checking the prefix. Returns the safe
/// absolute path on success.
pub fn ensure_path_is_safe(base_dir: &Path, relative_path: &Path) -> Result<PathBuf, PatchError> {
    trace!(
        "  Checking path safety for base '{}' and relative path '{}'",
        base_dir.display(),
        relative_path.display()
    );
    let base_path =
        fs::canonicalize(base_dir).map_err(|e| map_io_error(base_dir.to_path_buf(), e))?;
    let target_file_path = base_dir.join(relative_path);
    let parent = target_file_path.parent().unwrap_or(Path::new(""));
    let final_path = fs::canonicalize(parent)
        .map_err(|e| map_io_error(parent.to_path_buf(), e))?
        .join(target_file_path.file_name().unwrap_or_default());
    if !final_path.starts_with(&base_path) {
        return Err(PatchError::PathTraversal(relative_path.to_path_buf()));
    }
    Ok(final_path)
}

/// Applies a group of chunks (typically all chunks for one file) to a buffer
/// of lines in memory.
///
/// Chunks are evaluated in order against the *current* buffer: each
/// `Unapplied` chunk is applied and the buffer replaced wholesale before the
/// next chunk is evaluated, preserving single-writer semantics. The input is
/// never mutated.
pub fn apply_chunks_to_lines<'a, T, I>(
    chunks: I,
    original_lines: &[T],
    options: &ApplyOptions,
) -> InMemoryResult
where
    T: AsRef<str>,
    I: IntoIterator<Item = &'a Chunk>,
{
    let mut current: Vec<String> = original_lines
        .iter()
        .map(|l| l.as_ref().to_string())
        .collect();
    let mut chunk_results = Vec::new();

    for (i, chunk) in chunks.into_iter().enumerate() {
        let decision = locate_and_evaluate(&current, chunk, options);
        match decision {
            ApplyDecision::Unapplied { .. } => {
                // apply_decision cannot fail for Unapplied.
                if let Ok(new_lines) = apply_decision(&current, &decision, chunk) {
                    current = new_lines;
                }
            }
            ApplyDecision::AlreadyApplied => {
                info!("  Chunk {} is already applied; skipping.", i + 1);
            }
            ApplyDecision::Unresolvable => {
                warn!("  Chunk {} could not be resolved in the target.", i + 1);
            }
        }
        chunk_results.push(decision);
    }

    InMemoryResult {
        new_lines: current,
        report: ApplyReport { chunk_results },
    }
}

/// Applies a group of chunks to one file under `target_dir`.
///
/// Handles the filesystem edges — path safety, reading the original, writing
/// the result (or producing a dry-run diff) — and delegates the in-memory
/// work to [`apply_chunks_to_lines`]. The file must already exist; chunk
/// application modifies files, it does not create them.
pub fn apply_chunks_to_file<'a, I>(
    chunks: I,
    relative_path: &Path,
    target_dir: &Path,
    options: &ApplyOptions,
) -> Result<FileResult, PatchError>
where
    I: IntoIterator<Item = &'a Chunk>,
{
    info!("Applying chunks to: {}", relative_path.display());

    let safe_target_path = ensure_path_is_safe(target_dir, relative_path)?;
    trace!("    Path is safe.");

    if safe_target_path.is_dir() {
        return Err(PatchError::TargetIsDirectory {
            path: safe_target_path,
        });
    }
    if !safe_target_path.is_file() {
        return Err(PatchError::TargetNotFound(target_dir.join(relative_path)));
    }

    let original_content = fs::read_to_string(&safe_target_path)
        .map_err(|e| map_io_error(safe_target_path.clone(), e))?;
    let original_lines: Vec<&str> = original_content.lines().collect();
    trace!("  Read {} line(s) from target file.", original_lines.len());

    let result = apply_chunks_to_lines(chunks, &original_lines, options);

    let mut new_content = result.new_lines.join("\n");
    if !new_content.is_empty() && original_content.ends_with('\n') {
        new_content.push('\n');
    }

    let mut diff = None;
    if options.dry_run {
        info!(
            "  DRY RUN: Would write changes to '{}'",
            relative_path.display()
        );
        let diff_text = unified_diff(
            similar::Algorithm::default(),
            &original_content,
            &new_content,
            3,
            Some(("a", "b")),
        );
        diff = Some(diff_text.to_string());
    } else {
        fs::write(&safe_target_path, new_content)
            .map_err(|e| map_io_error(safe_target_path.clone(), e))?;
        if result.report.all_resolved() {
            info!(
                "  Successfully wrote changes to '{}'",
                relative_path.display()
            );
        } else {
            warn!("  Wrote partial changes to '{}'", relative_path.display());
        }
    }

    Ok(FileResult {
        report: result.report,
        diff,
    })
}

/// Applies every chunk of a [`ChunkSet`] to the files under `target_dir`.
///
/// Chunks are grouped by `file_path` in first-seen order; each group is
/// applied with [`apply_chunks_to_file`]. Chunks with no file path (the
/// patch had no `+++ ` header before them) cannot be routed to a file and
/// are skipped with a warning. The batch continues past hard errors.
pub fn apply_chunk_set_to_dir(
    set: &ChunkSet,
    target_dir: &Path,
    options: &ApplyOptions,
) -> BatchResult {
    let mut groups: Vec<(PathBuf, Vec<&Chunk>)> = Vec::new();
    let mut pathless = 0usize;
    for chunk in set.chunks() {
        match &chunk.file_path {
            Some(path) => {
                if let Some((_, group)) = groups.iter_mut().find(|(p, _)| p == path) {
                    group.push(chunk);
                } else {
                    groups.push((path.clone(), vec![chunk]));
                }
            }
            None => pathless += 1,
        }
    }
    if pathless > 0 {
        warn!(
            "Skipping {} chunk(s) with no file header; cannot route them to a file.",
            pathless
        );
    }

    let results = groups
        .into_iter()
        .map(|(path, group)| {
            let result = apply_chunks_to_file(group.iter().copied(), &path, target_dir, options);
            (path, result)
        })
        .collect();

    BatchResult { results }
}

//! Candidate slug generation.
//!
//! Slugs are either fixed-length strings over an ordered alphabet, enumerated
//! exhaustively (optionally restricted to a sub-range or shard) or sampled, or
//! base64 encodings of small integers. Every source can be resumed from the
//! last slug a previous run committed.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

/// Digits first so numeric-prefixed slugs sort before alphabetic ones.
pub const DEFAULT_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyz";
pub const DEFAULT_LENGTH: usize = 5;

/// Weight multiplier for symbols observed at a position in known-active slugs.
const SEEN_SYMBOL_WEIGHT: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlugError {
    #[error("alphabet must not be empty")]
    EmptyAlphabet,

    #[error("alphabet contains duplicate symbol {0:?}")]
    DuplicateSymbol(char),

    #[error("slug length must be at least 1")]
    ZeroLength,

    #[error("slug space {base}^{length} does not fit in 64 bits")]
    TooLarge { base: usize, length: usize },

    #[error("slug {slug:?} must be exactly {expected} characters")]
    WrongLength { slug: String, expected: usize },

    #[error("slug {slug:?} contains {symbol:?}, which is outside the alphabet")]
    UnknownSymbol { slug: String, symbol: char },

    #[error("invalid range {start}..={end} (start > end)")]
    InvalidRange { start: String, end: String },

    #[error("predefined shard must be 1, 2 or 3, got {0}")]
    UnknownShard(u8),

    #[error("shard {index} is outside 1..={count}")]
    ShardOutOfBounds { index: usize, count: usize },

    #[error("invalid sampling weights: {0}")]
    Weights(String),
}

pub type Result<T> = std::result::Result<T, SlugError>;

/// Ordered symbol set that slugs are drawn from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alphabet {
    symbols: Vec<char>,
}

impl Alphabet {
    pub fn new(symbols: &str) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for c in symbols.chars() {
            if !seen.insert(c) {
                return Err(SlugError::DuplicateSymbol(c));
            }
            out.push(c);
        }
        if out.is_empty() {
            return Err(SlugError::EmptyAlphabet);
        }
        Ok(Self { symbols: out })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbols(&self) -> &[char] {
        &self.symbols
    }

    pub fn position(&self, c: char) -> Option<usize> {
        self.symbols.iter().position(|&s| s == c)
    }

    /// `true` when `slug` is exactly `length` symbols of this alphabet.
    pub fn spells(&self, slug: &str, length: usize) -> bool {
        slug.chars().count() == length && slug.chars().all(|c| self.position(c).is_some())
    }

    /// Number of distinct slugs of `length` symbols.
    pub fn space_size(&self, length: usize) -> Result<u64> {
        if length == 0 {
            return Err(SlugError::ZeroLength);
        }
        let exp = u32::try_from(length).map_err(|_| SlugError::TooLarge {
            base: self.len(),
            length,
        })?;
        (self.len() as u64)
            .checked_pow(exp)
            .ok_or(SlugError::TooLarge {
                base: self.len(),
                length,
            })
    }
}

impl Default for Alphabet {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_ALPHABET.chars().collect(),
        }
    }
}

/// Contiguous, inclusive range of fixed-length slugs in lexicographic alphabet order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugRange {
    alphabet: Alphabet,
    length: usize,
    start: u64,
    end: u64,
}

impl SlugRange {
    /// The whole space: every slug of `length` symbols.
    pub fn full(alphabet: Alphabet, length: usize) -> Result<Self> {
        let size = alphabet.space_size(length)?;
        Ok(Self {
            alphabet,
            length,
            start: 0,
            end: size - 1,
        })
    }

    /// Range bounded by two slugs (both inclusive). The length is taken from `start`.
    pub fn between(alphabet: Alphabet, start: &str, end: &str) -> Result<Self> {
        let length = start.chars().count();
        let mut range = Self::full(alphabet, length)?;
        let lo = range.index_of(start)?;
        let hi = range.index_of(end)?;
        if lo > hi {
            return Err(SlugError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        range.start = lo;
        range.end = hi;
        Ok(range)
    }

    /// Classic three-way split of the default 5-character space:
    /// 1 = digit-led slugs up to `99999`, 2 = `a`..`m` prefixes, 3 = `n`..`z` prefixes.
    pub fn predefined(instance: u8) -> Result<Self> {
        let (start, end) = match instance {
            1 => ("00000", "99999"),
            2 => ("aaaaa", "mzzzz"),
            3 => ("naaaa", "zzzzz"),
            other => return Err(SlugError::UnknownShard(other)),
        };
        Self::between(Alphabet::default(), start, end)
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Number of slugs in the range.
    /// Saturates at `u64::MAX` for the full `0..=u64::MAX` range.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn first(&self) -> String {
        self.slug_at(self.start)
    }

    pub fn last(&self) -> String {
        self.slug_at(self.end)
    }

    /// Position of `slug` in the full space (not relative to this range).
    pub fn index_of(&self, slug: &str) -> Result<u64> {
        let chars: Vec<char> = slug.chars().collect();
        if chars.len() != self.length {
            return Err(SlugError::WrongLength {
                slug: slug.to_string(),
                expected: self.length,
            });
        }
        let base = self.alphabet.len() as u64;
        let mut index = 0u64;
        for c in chars {
            let digit = self
                .alphabet
                .position(c)
                .ok_or_else(|| SlugError::UnknownSymbol {
                    slug: slug.to_string(),
                    symbol: c,
                })?;
            // Cannot overflow: the space size was checked at construction.
            index = index * base + digit as u64;
        }
        Ok(index)
    }

    pub fn slug_at(&self, index: u64) -> String {
        let base = self.alphabet.len() as u64;
        let symbols = self.alphabet.symbols();
        let mut out = vec![symbols[0]; self.length];
        let mut n = index;
        for slot in out.iter_mut().rev() {
            *slot = symbols[(n % base) as usize];
            n /= base;
        }
        out.into_iter().collect()
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.index_of(slug)
            .map(|i| i >= self.start && i <= self.end)
            .unwrap_or(false)
    }

    pub fn iter(&self) -> SlugIter {
        SlugIter {
            range: self.clone(),
            next: self.start,
        }
    }

    /// Suffix of the range strictly after `resume`.
    ///
    /// A resume point before the range yields the whole range; one at or past
    /// the end yields nothing.
    pub fn iter_after(&self, resume: Option<&str>) -> Result<SlugIter> {
        let mut iter = self.iter();
        if let Some(slug) = resume {
            let idx = self.index_of(slug)?;
            iter.next = iter.next.max(idx.saturating_add(1));
        }
        Ok(iter)
    }

    /// Partition into `n` contiguous, disjoint shards that together cover the range.
    /// Sizes differ by at most one. `n` is clamped to `1..=len`.
    pub fn split(&self, n: usize) -> Vec<SlugRange> {
        let total = self.len();
        let n = (n.max(1) as u64).min(total);
        let base = total / n;
        let extra = total % n;
        let mut out = Vec::with_capacity(n as usize);
        let mut cursor = self.start;
        for i in 0..n {
            let size = base + u64::from(i < extra);
            out.push(SlugRange {
                alphabet: self.alphabet.clone(),
                length: self.length,
                start: cursor,
                end: cursor + size - 1,
            });
            cursor += size;
        }
        out
    }

    /// The `index`-th (1-based) of `count` shards produced by [`split`](Self::split).
    pub fn shard(&self, index: usize, count: usize) -> Result<SlugRange> {
        if index == 0 || index > count {
            return Err(SlugError::ShardOutOfBounds { index, count });
        }
        self.split(count)
            .into_iter()
            .nth(index - 1)
            .ok_or(SlugError::ShardOutOfBounds { index, count })
    }
}

/// Lazy iterator over a [`SlugRange`].
#[derive(Debug, Clone)]
pub struct SlugIter {
    range: SlugRange,
    next: u64,
}

impl Iterator for SlugIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.next > self.range.end {
            return None;
        }
        let slug = self.range.slug_at(self.next);
        self.next += 1;
        Some(slug)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.range.end + 1).saturating_sub(self.next);
        let n = usize::try_from(remaining).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

/// Base64 of the decimal text of `n`, e.g. `1 -> "MQ=="`.
pub fn encode_numeric(n: u64) -> String {
    STANDARD.encode(n.to_string())
}

/// Inverse of [`encode_numeric`]; `None` for anything that is not a base64 number.
pub fn decode_numeric(slug: &str) -> Option<u64> {
    let bytes = STANDARD.decode(slug).ok()?;
    let text = std::str::from_utf8(&bytes).ok()?;
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Inclusive range of integers presented as base64-encoded slugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Base64Range {
    pub start: u64,
    pub end: u64,
}

impl Base64Range {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(SlugError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter_after(&self, resume: Option<&str>) -> impl Iterator<Item = String> + Send {
        // resuming after u64::MAX leaves nothing
        let from = match resume.and_then(decode_numeric) {
            Some(n) => n.checked_add(1).map(|next| self.start.max(next)),
            None => Some(self.start),
        };
        let end = self.end;
        from.into_iter().flat_map(move |from| (from..=end).map(encode_numeric))
    }
}

/// Uniformly random, distinct slugs that are not in `skip`.
pub fn sample_uniform<R: Rng + ?Sized>(
    rng: &mut R,
    alphabet: &Alphabet,
    length: usize,
    count: usize,
    skip: &HashSet<String>,
) -> Result<Vec<String>> {
    let capacity = alphabet.space_size(length)?;
    let symbols = alphabet.symbols();
    let in_space = |slug: &str| alphabet.spells(slug, length);
    Ok(draw_distinct(count, capacity, skip, in_space, || {
        (0..length)
            .map(|_| symbols[rng.gen_range(0..symbols.len())])
            .collect()
    }))
}

/// Per-position symbol weights learned from known-active slugs.
///
/// Symbols seen at a position get weight `3 * occurrences`, every other symbol
/// keeps weight 1 so the whole space stays reachable.
#[derive(Debug, Clone)]
pub struct PatternModel {
    alphabet: Alphabet,
    weights: Vec<Vec<u32>>,
}

impl PatternModel {
    /// Known slugs of the wrong length or with foreign symbols are ignored.
    pub fn learn<'a, I>(known: I, alphabet: &Alphabet, length: usize) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        alphabet.space_size(length)?;
        let mut counts = vec![vec![0u32; alphabet.len()]; length];
        for slug in known {
            let positions: Option<Vec<usize>> =
                slug.chars().map(|c| alphabet.position(c)).collect();
            match positions {
                Some(p) if p.len() == length => {
                    for (pos, sym) in p.into_iter().enumerate() {
                        counts[pos][sym] += 1;
                    }
                }
                _ => {}
            }
        }
        let weights = counts
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|c| if c > 0 { c * SEEN_SYMBOL_WEIGHT } else { 1 })
                    .collect()
            })
            .collect();
        Ok(Self {
            alphabet: alphabet.clone(),
            weights,
        })
    }

    pub fn length(&self) -> usize {
        self.weights.len()
    }

    pub fn weights_at(&self, position: usize) -> &[u32] {
        &self.weights[position]
    }

    /// Distinct weighted samples not in `skip`.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        count: usize,
        skip: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let dists = self
            .weights
            .iter()
            .map(|w| WeightedIndex::new(w).map_err(|e| SlugError::Weights(e.to_string())))
            .collect::<Result<Vec<_>>>()?;
        let capacity = self.alphabet.space_size(self.length())?;
        let symbols = self.alphabet.symbols();
        let in_space = |slug: &str| self.alphabet.spells(slug, self.length());
        Ok(draw_distinct(count, capacity, skip, in_space, || {
            dists.iter().map(|d| symbols[d.sample(&mut *rng)]).collect()
        }))
    }
}

/// Skipped slugs outside the sampled space (per `in_space`) do not shrink it.
fn draw_distinct<S, F>(
    count: usize,
    capacity: u64,
    skip: &HashSet<String>,
    in_space: S,
    mut draw: F,
) -> Vec<String>
where
    S: Fn(&str) -> bool,
    F: FnMut() -> String,
{
    let skipped = skip.iter().filter(|s| in_space(s.as_str())).count() as u64;
    let available = capacity.saturating_sub(skipped);
    let target = (count as u64).min(available) as usize;
    let max_attempts = target.saturating_mul(50).saturating_add(1_000);

    let mut seen = HashSet::with_capacity(target);
    let mut out = Vec::with_capacity(target);
    let mut attempts = 0usize;
    while out.len() < target && attempts < max_attempts {
        attempts += 1;
        let slug = draw();
        if skip.contains(&slug) || !seen.insert(slug.clone()) {
            continue;
        }
        out.push(slug);
    }
    if out.len() < count {
        warn!(
            requested = count,
            produced = out.len(),
            "sample space exhausted before the requested count"
        );
    }
    out
}

/// Where a scan's candidates come from.
#[derive(Debug, Clone)]
pub enum CandidateSource {
    Range(SlugRange),
    Base64(Base64Range),
    List { label: String, slugs: Vec<String> },
}

impl CandidateSource {
    pub fn describe(&self) -> String {
        match self {
            CandidateSource::Range(r) => format!("range {}..={}", r.first(), r.last()),
            CandidateSource::Base64(b) => format!("base64 {}..={}", b.start, b.end),
            CandidateSource::List { label, slugs } => format!("list {} ({} slugs)", label, slugs.len()),
        }
    }

    /// Filesystem-safe identifier, so checkpoints of different sources never collide.
    pub fn fingerprint(&self) -> String {
        let raw = match self {
            CandidateSource::Range(r) => format!("range-{}-{}", r.first(), r.last()),
            CandidateSource::Base64(b) => format!("base64-{}-{}", b.start, b.end),
            CandidateSource::List { label, .. } => format!("list-{label}"),
        };
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }

    pub fn len(&self) -> u64 {
        match self {
            CandidateSource::Range(r) => r.len(),
            CandidateSource::Base64(b) => b.len(),
            CandidateSource::List { slugs, .. } => slugs.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Candidates strictly after `resume`, in order.
    ///
    /// For lists, a resume slug that is not in the list restarts from the top.
    pub fn candidates_after(
        &self,
        resume: Option<&str>,
    ) -> Result<Box<dyn Iterator<Item = String> + Send>> {
        match self {
            CandidateSource::Range(r) => Ok(Box::new(r.iter_after(resume)?)),
            CandidateSource::Base64(b) => Ok(Box::new(b.iter_after(resume))),
            CandidateSource::List { slugs, .. } => {
                let skip = match resume {
                    Some(last) => match slugs.iter().position(|s| s == last) {
                        Some(pos) => pos + 1,
                        None => {
                            warn!(resume = last, "resume slug not in candidate list; starting over");
                            0
                        }
                    },
                    None => 0,
                };
                Ok(Box::new(slugs.clone().into_iter().skip(skip)))
            }
        }
    }
}

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parse slug-list content into a deduplicated list, keeping first-appearance order.
///
/// Supported formats per line:
/// - one slug: `ad31y`
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
///
/// Slugs may not contain whitespace or `/`, since they are substituted into a URL path.
pub fn parse_slug_list(s: &str) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        if line.contains(char::is_whitespace) || line.contains('/') {
            bail!("line {line_no}: invalid slug: {line}");
        }
        if seen.insert(line.to_string()) {
            out.push(line.to_string());
        }
    }

    Ok(out)
}

/// Load a slug list from a file path. Errors if the file cannot be read or parsed.
pub fn load_slug_list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read slug file: {}", path.as_ref().display()))?;
    parse_slug_list(&content)
}

/// Slugs confirmed active out-of-band. Used when the config does not override them.
pub fn default_known_slugs() -> Vec<String> {
    const DEFAULT: &[&str] = &[
        "ad31y", "mj42f", "os27m", "lp56a", "zb74k", "ym99l", "yh52b", "zd20w", "td32z", "bo19e",
        "bh70s", "ai04u", "bm49t", "qu29u", "tc33l",
    ];
    DEFAULT.iter().map(|s| s.to_string()).collect()
}

/// Fixed set of slugs skipped on every scan. Built once, never mutated.
#[derive(Debug, Clone, Default)]
pub struct KnownSetFilter {
    slugs: HashSet<String>,
}

impl KnownSetFilter {
    pub fn new<I, S>(slugs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slugs: slugs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_known(&self, candidate: &str) -> bool {
        self.slugs.contains(candidate)
    }

    pub fn len(&self) -> usize {
        self.slugs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slugs.is_empty()
    }

    pub fn as_set(&self) -> &HashSet<String> {
        &self.slugs
    }
}

//! Content-based ACTIVE / INACTIVE decision for fetched pages.
//!
//! The heuristic counts configured error and business keywords in the
//! lower-cased page text and title and applies fixed thresholds. A non-2xx
//! HTTP status short-circuits to INACTIVE_ERROR. It sits
//! behind the [`Classifier`] trait so another strategy can replace it without
//! touching the scan loop.

use crate::fetch::FetchError;
use crate::types::{RawResponse, ScanStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Longest business name taken from free page text.
const MAX_EXTRACTED_NAME: usize = 80;

/// Most services reported for one page.
pub const MAX_SERVICES: usize = 5;

static NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"welcome to ([^.!?\n]+)",
        r"([^.!?\n]+) - book now",
        r"book your appointment at ([^.!?\n]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern compiles"))
    .collect()
});

/// A brand recognised by substring, with the display name reported for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brand {
    pub pattern: String,
    pub name: String,
}

impl Brand {
    fn new(pattern: &str, name: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            name: name.to_string(),
        }
    }
}

/// Keyword lists and thresholds for [`KeywordClassifier`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub active_min_hits: u32,
    pub active_min_length: usize,
    pub empty_title_is_error: bool,
    /// A known non-2xx status marks the page INACTIVE_ERROR. Status 0 (browser) is never judged.
    pub http_error_is_inactive: bool,
    pub error_keywords: Vec<String>,
    pub business_keywords: Vec<String>,
    /// Titles that say nothing about the tenant (lower-case).
    pub generic_titles: Vec<String>,
    /// Stripped from the end of page titles before they are used as names.
    pub title_suffixes: Vec<String>,
    pub brands: Vec<Brand>,
    /// Offerings reported for ACTIVE pages, in this order.
    pub service_keywords: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let strings = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            error_keywords: strings(&[
                "401",
                "error",
                "nothing left to do here",
                "go to homepage",
                "unauthorized",
                "access denied",
                "not found",
            ]),
            business_keywords: strings(&[
                "altura health",
                "dripbar",
                "wellness",
                "clinic",
                "medical",
                "health",
                "therapy",
                "treatment",
                "spa",
                "center",
                "institute",
                "practice",
                "weight loss",
                "injection",
                "iv therapy",
                "hydration",
                "vitamin",
                "consultation",
                "appointment",
                "booking",
                "schedule",
                "service",
                "contact",
                "location",
                "address",
                "phone",
                "email",
                "hours",
                "book now",
                "schedule appointment",
                "select service",
                "choose time",
            ]),
            brands: vec![
                Brand::new("altura health", "Altura Health"),
                Brand::new("dripbar", "The DRIPBaR"),
            ],
            generic_titles: strings(&["loading", "error", "vsdhone", "untitled", "react app"]),
            title_suffixes: strings(&[" - Booking", " | Booking", " Booking", " - VSDHOne", " | VSDHOne"]),
            service_keywords: strings(&[
                "weight loss",
                "iv therapy",
                "hydration",
                "vitamin injection",
                "consultation",
                "wellness",
                "treatment",
                "therapy",
            ]),
            active_min_hits: 3,
            active_min_length: 20_000,
            empty_title_is_error: false,
            http_error_is_inactive: true,
        }
    }
}

/// Outcome of classifying one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: ScanStatus,
    pub business_name: String,
    pub business_hits: u32,
    pub error_hits: u32,
    pub services: Vec<String>,
}

impl Verdict {
    /// Verdict for a candidate whose fetch failed.
    pub fn failed(status: ScanStatus) -> Self {
        Self {
            status,
            business_name: String::new(),
            business_hits: 0,
            error_hits: 0,
            services: Vec::new(),
        }
    }
}

/// Strategy that labels fetched content.
pub trait Classifier: Send + Sync {
    fn classify(&self, response: &RawResponse) -> Verdict;

    /// Label a fetch outcome; failed fetches map straight to their terminal status.
    fn assess(&self, outcome: &Result<RawResponse, FetchError>) -> Verdict {
        match outcome {
            Ok(response) => self.classify(response),
            Err(e) => Verdict::failed(e.status()),
        }
    }
}

/// Threshold-tuned keyword heuristic.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    config: ClassifierConfig,
}

impl KeywordClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// `(business_hits, error_hits)`: distinct keywords present in lower-cased `text`.
    pub fn score(&self, text: &str) -> (u32, u32) {
        let count = |keywords: &[String]| {
            keywords
                .iter()
                .filter(|k| !k.is_empty() && text.contains(k.to_lowercase().as_str()))
                .count() as u32
        };
        (
            count(&self.config.business_keywords),
            count(&self.config.error_keywords),
        )
    }

    /// Configured service keywords found in lower-cased `text`, title-cased, at most [`MAX_SERVICES`].
    pub fn services(&self, text: &str) -> Vec<String> {
        self.config
            .service_keywords
            .iter()
            .filter(|k| !k.is_empty() && text.contains(k.to_lowercase().as_str()))
            .take(MAX_SERVICES)
            .map(|k| title_case(k))
            .collect()
    }

    fn rejects_http_status(&self, status_code: u16) -> bool {
        self.config.http_error_is_inactive
            && status_code != 0
            && !(200..300).contains(&status_code)
    }

    fn matched_brand(&self, text: &str) -> Option<&Brand> {
        self.config
            .brands
            .iter()
            .find(|b| !b.pattern.is_empty() && text.contains(b.pattern.to_lowercase().as_str()))
    }

    /// Name by priority: meaningful title, known brand, "welcome to ..." style phrase.
    pub fn business_name(&self, body_text: &str, title: &str) -> String {
        let title = title.trim();
        if self.is_meaningful_title(title) {
            return self.strip_title_suffixes(title);
        }
        let lower = body_text.to_lowercase();
        if let Some(brand) = self.matched_brand(&lower) {
            return brand.name.clone();
        }
        for re in NAME_PATTERNS.iter() {
            if let Some(m) = re.captures(&lower).and_then(|c| c.get(1)) {
                let raw = m.as_str().trim();
                if !raw.is_empty() {
                    let clipped: String = raw.chars().take(MAX_EXTRACTED_NAME).collect();
                    return title_case(clipped.trim());
                }
            }
        }
        String::new()
    }

    fn is_meaningful_title(&self, title: &str) -> bool {
        if title.chars().count() <= 3 {
            return false;
        }
        let lower = title.to_lowercase();
        !self.config.generic_titles.iter().any(|g| *g == lower)
    }

    fn strip_title_suffixes(&self, title: &str) -> String {
        let mut name = title.to_string();
        for suffix in &self.config.title_suffixes {
            let cut = name.len().saturating_sub(suffix.len());
            if name.len() > suffix.len()
                && name.is_char_boundary(cut)
                && name[cut..].eq_ignore_ascii_case(suffix)
            {
                name.truncate(cut);
                name = name.trim().to_string();
            }
        }
        name
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, response: &RawResponse) -> Verdict {
        let title = response.title.trim();
        let text = format!(
            "{}\n{}",
            response.body_text.to_lowercase(),
            title.to_lowercase()
        );
        let (business_hits, error_hits) = self.score(&text);
        let cfg = &self.config;

        let status = if self.rejects_http_status(response.status_code) {
            ScanStatus::InactiveError
        } else if (error_hits > 0 && (business_hits == 0 || title.is_empty()))
            || (cfg.empty_title_is_error && title.is_empty())
        {
            ScanStatus::InactiveError
        } else if business_hits >= cfg.active_min_hits
            || self.matched_brand(&text).is_some()
            || response.content_length > cfg.active_min_length
        {
            ScanStatus::Active
        } else {
            ScanStatus::InactiveUnknown
        };

        let (business_name, services) = if status == ScanStatus::Active {
            (self.business_name(&response.body_text, title), self.services(&text))
        } else {
            (String::new(), Vec::new())
        };

        Verdict {
            status,
            business_name,
            business_hits,
            error_hits,
            services,
        }
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

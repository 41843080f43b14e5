//! Text-stage brand matching
//!
//! OCR text is split into lowercase alphanumeric tokens. An alias matches
//! exactly when a run of adjacent tokens spells it (ignoring case, spaces and
//! punctuation), which scores 1.0. Aliases of at least `min_fuzzy_len`
//! characters also score 1.0 when they appear run into other letters
//! (`MAGGINOODLES`). Otherwise the best fuzzy score comes from
//! normalized Levenshtein similarity over token windows, or from the share of
//! an alias's significant words present anywhere in the text. Fuzzy scores
//! stay below 1.0.

use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;
use tracing::debug;

use super::{sort_candidates, DetectionCandidate, DetectionMethod, Evidence};
use crate::storage::{BrandRecord, BrandTable};

/// Words that never count as evidence on their own
const GENERIC_WORDS: &[&str] = &[
    "product", "products", "india", "consumer", "limited", "ltd", "company", "co", "pvt", "private",
    "corporation", "corp", "industries", "industry", "foods", "food",
];

/// Highest score a non-exact match can reach
const MAX_FUZZY_SCORE: f32 = 0.99;

/// Weight of a full word-coverage match
const WORD_COVERAGE_WEIGHT: f32 = 0.9;

/// Text matching parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextMatchConfig {
    /// Candidates scoring below this are dropped
    pub noise_floor: f32,
    /// Similarity at which fuzzy scores start rising above 0
    pub fuzzy_knee: f32,
    /// Aliases shorter than this (in characters) only match exactly
    pub min_fuzzy_len: usize,
}

impl Default for TextMatchConfig {
    fn default() -> Self {
        Self {
            noise_floor: 0.1,
            fuzzy_knee: 0.5,
            min_fuzzy_len: 4,
        }
    }
}

/// A lowercase alphanumeric run with its byte span in the source text
#[derive(Debug, Clone, PartialEq)]
struct Token {
    text: String,
    start: usize,
    end: usize,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current: Option<Token> = None;

    for (idx, c) in text.char_indices() {
        if c.is_alphanumeric() {
            let token = current.get_or_insert_with(|| Token {
                text: String::new(),
                start: idx,
                end: idx,
            });
            token.text.extend(c.to_lowercase());
            token.end = idx + c.len_utf8();
        } else if let Some(token) = current.take() {
            tokens.push(token);
        }
    }
    tokens.extend(current);

    tokens
}

/// Tokens joined without separators, with the source byte span of every char
struct CompactText {
    text: String,
    spans: Vec<(usize, usize)>,
}

impl CompactText {
    fn new(text: &str, tokens: &[Token]) -> Self {
        let mut compact = String::new();
        let mut spans = Vec::new();
        for token in tokens {
            for (offset, c) in text[token.start..token.end].char_indices() {
                let start = token.start + offset;
                for lower in c.to_lowercase() {
                    compact.push(lower);
                    spans.push((start, start + c.len_utf8()));
                }
            }
        }
        Self { text: compact, spans }
    }

    /// Source byte span of the first occurrence of `needle`
    fn find(&self, needle: &str) -> Option<(usize, usize)> {
        let byte_idx = self.text.find(needle)?;
        let first = self.text[..byte_idx].chars().count();
        let last = first + needle.chars().count().checked_sub(1)?;
        Some((self.spans.get(first)?.0, self.spans.get(last)?.1))
    }
}

fn is_generic(word: &str) -> bool {
    GENERIC_WORDS.contains(&word)
}

/// Best match of one alias against the text
#[derive(Debug, Clone)]
struct AliasMatch {
    score: f32,
    matched: String,
}

/// Matches OCR text against a brand table
#[derive(Debug, Clone, Default)]
pub struct TextMatcher {
    config: TextMatchConfig,
}

impl TextMatcher {
    pub fn new(config: TextMatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TextMatchConfig {
        &self.config
    }

    /// Score every brand against `text`
    ///
    /// Returns candidates above the noise floor in descending confidence,
    /// ties kept in brand-table order. Empty or unmatched text gives an
    /// empty list.
    pub fn detect(&self, text: &str, brands: &BrandTable) -> Vec<DetectionCandidate> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }

        let compact = CompactText::new(text, &tokens);
        let mut candidates: Vec<DetectionCandidate> = brands
            .iter()
            .filter_map(|brand| self.score_brand(text, &tokens, &compact, brand))
            .collect();

        sort_candidates(&mut candidates);

        if let Some(top) = candidates.first() {
            debug!("Text match: {} ({:.2}), {} candidates", top.brand_id, top.confidence, candidates.len());
        }
        candidates
    }

    fn score_brand(
        &self,
        text: &str,
        tokens: &[Token],
        compact: &CompactText,
        brand: &BrandRecord,
    ) -> Option<DetectionCandidate> {
        let mut best_score = 0.0f32;
        let mut best_alias = "";
        let mut matched: Vec<String> = Vec::new();

        for alias in brand.match_names() {
            let Some(alias_match) = self.match_alias(text, tokens, compact, alias) else {
                continue;
            };

            if alias_match.score > best_score {
                best_score = alias_match.score;
                best_alias = alias;
                matched = vec![alias_match.matched];
            } else if alias_match.score == best_score && !matched.contains(&alias_match.matched) {
                matched.push(alias_match.matched);
            }
        }

        if best_score <= 0.0 || best_score < self.config.noise_floor {
            return None;
        }

        Some(DetectionCandidate {
            brand_id: brand.id.clone(),
            display_name: brand.display_name.clone(),
            confidence: best_score,
            evidence: Evidence::Text {
                alias: best_alias.to_string(),
                matched,
            },
            method: DetectionMethod::Text,
        })
    }

    fn match_alias(&self, text: &str, tokens: &[Token], compact: &CompactText, alias: &str) -> Option<AliasMatch> {
        let alias_tokens: Vec<String> = tokenize(alias).into_iter().map(|t| t.text).collect();
        if alias_tokens.is_empty() {
            return None;
        }

        let alias_compact = alias_tokens.concat();
        let mut span = exact_span(tokens, &alias_compact);
        // Short aliases must sit on token boundaries ("ITC" is not in "KITCHEN")
        if span.is_none() && alias_compact.chars().count() >= self.config.min_fuzzy_len {
            span = compact.find(&alias_compact);
        }
        if let Some((start, end)) = span {
            return Some(AliasMatch {
                score: 1.0,
                matched: text[start..end].to_string(),
            });
        }

        let significant: Vec<&str> = alias_tokens
            .iter()
            .map(String::as_str)
            .filter(|w| !is_generic(w))
            .collect();

        let window = self.best_window(text, tokens, &significant);
        let coverage = word_coverage(text, tokens, &significant);

        match (window, coverage) {
            (Some(w), Some(c)) => Some(if c.score > w.score { c } else { w }),
            (w, c) => w.or(c),
        }
    }

    /// Fuzzy match of the significant alias words against windows of
    /// adjacent significant text tokens
    fn best_window(&self, text: &str, tokens: &[Token], significant: &[&str]) -> Option<AliasMatch> {
        let target = significant.concat();
        if target.chars().count() < self.config.min_fuzzy_len {
            return None;
        }

        let candidates: Vec<&Token> = tokens.iter().filter(|t| !is_generic(&t.text)).collect();
        let max_window = significant.len() + 1;
        let mut best: Option<AliasMatch> = None;

        for start in 0..candidates.len() {
            let mut joined = String::new();
            for end in start..candidates.len().min(start + max_window) {
                joined.push_str(&candidates[end].text);

                let similarity = normalized_levenshtein(&joined, &target) as f32;
                let score = self.fuzzy_score(similarity);
                if score > 0.0 && best.as_ref().map_or(true, |b| score > b.score) {
                    best = Some(AliasMatch {
                        score,
                        matched: text[candidates[start].start..candidates[end].end].to_string(),
                    });
                }
            }
        }

        best
    }

    /// Map a similarity in [0, 1] to a confidence below 1.0
    fn fuzzy_score(&self, similarity: f32) -> f32 {
        let knee = self.config.fuzzy_knee;
        if knee >= 1.0 {
            return 0.0;
        }
        ((similarity - knee) / (1.0 - knee)).clamp(0.0, 1.0).min(MAX_FUZZY_SCORE)
    }
}

/// Byte span of adjacent tokens spelling `compact` exactly
fn exact_span(tokens: &[Token], compact: &str) -> Option<(usize, usize)> {
    if compact.is_empty() {
        return None;
    }

    for start in 0..tokens.len() {
        let mut joined = String::new();
        for token in &tokens[start..] {
            joined.push_str(&token.text);
            if joined.len() >= compact.len() {
                if joined == compact {
                    return Some((tokens[start].start, token.end));
                }
                break;
            }
        }
    }

    None
}

/// Share of multi-word alias words found as whole tokens, anywhere in the text
fn word_coverage(text: &str, tokens: &[Token], significant: &[&str]) -> Option<AliasMatch> {
    let words: Vec<&str> = significant
        .iter()
        .copied()
        .filter(|w| w.chars().count() > 2)
        .collect();
    if words.len() < 2 {
        return None;
    }

    let found: Vec<&Token> = words
        .iter()
        .filter_map(|w| tokens.iter().find(|t| t.text == *w))
        .collect();

    let ratio = found.len() as f32 / words.len() as f32;
    if ratio < 0.5 {
        return None;
    }

    let matched = found
        .iter()
        .map(|t| &text[t.start..t.end])
        .collect::<Vec<_>>()
        .join(" ");

    Some(AliasMatch {
        score: (WORD_COVERAGE_WEIGHT * ratio).min(MAX_FUZZY_SCORE),
        matched,
    })
}

//! Summarisation: a local extractive summariser (TF-IDF + TextRank) and an
//! AI variant over chat completions.
//!
//! The local algorithm scores sentences two ways and blends the scores
//! 50/50: term importance (TF-IDF against the document's own sentences)
//! and graph centrality (TextRank over a sentence-similarity graph, 0.85
//! damping, 30 iterations). The opening sentence gets a 1.15 boost; very
//! long and very short sentences are penalised. Selected sentences are
//! emitted in their original order up to the length target.

use secrecy::SecretString;

use super::translate::{chat_completion, EnrichError};
use crate::util::strip_html;

/// Inputs below these bounds are returned verbatim
const MIN_INPUT_CHARS: usize = 200;
const MIN_INPUT_SENTENCES: usize = 3;

const TEXTRANK_DAMPING: f64 = 0.85;
const TEXTRANK_ITERATIONS: usize = 30;
const FIRST_SENTENCE_BOOST: f64 = 1.15;
/// Sentences longer than this many words read poorly in a summary
const LONG_SENTENCE_WORDS: usize = 40;
const LONG_SENTENCE_PENALTY: f64 = 0.8;
/// Fragments this short are usually headings or artifacts
const SHORT_SENTENCE_WORDS: usize = 4;
const SHORT_SENTENCE_PENALTY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryLength {
    Short,
    Medium,
    Long,
}

impl SummaryLength {
    pub fn parse(s: &str) -> Self {
        match s {
            "short" => SummaryLength::Short,
            "long" => SummaryLength::Long,
            _ => SummaryLength::Medium,
        }
    }

    pub fn word_target(&self) -> usize {
        match self {
            SummaryLength::Short => 50,
            SummaryLength::Medium => 100,
            SummaryLength::Long => 150,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SummaryResult {
    pub summary: String,
    pub is_too_short: bool,
}

/// Extractive summary of plain text or HTML.
pub fn summarize_local(text: &str, length: SummaryLength) -> SummaryResult {
    let text = strip_html(text);
    let text = text.trim();

    let sentences = split_sentences(text);
    if text.chars().count() < MIN_INPUT_CHARS || sentences.len() < MIN_INPUT_SENTENCES {
        return SummaryResult {
            summary: text.to_owned(),
            is_too_short: true,
        };
    }

    let tokenized: Vec<Vec<String>> = sentences.iter().map(|s| tokenize(s)).collect();

    let tfidf = normalize(tfidf_scores(&tokenized));
    let textrank = normalize(textrank_scores(&tokenized));

    let mut scores: Vec<f64> = tfidf
        .iter()
        .zip(textrank.iter())
        .map(|(a, b)| 0.5 * a + 0.5 * b)
        .collect();

    scores[0] *= FIRST_SENTENCE_BOOST;
    for (i, tokens) in tokenized.iter().enumerate() {
        if tokens.len() > LONG_SENTENCE_WORDS {
            scores[i] *= LONG_SENTENCE_PENALTY;
        } else if tokens.len() < SHORT_SENTENCE_WORDS {
            scores[i] *= SHORT_SENTENCE_PENALTY;
        }
    }

    // Pick best-scoring sentences up to the word target, then restore
    // document order
    let mut order: Vec<usize> = (0..sentences.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(std::cmp::Ordering::Equal));

    let target = length.word_target();
    let mut picked = Vec::new();
    let mut words = 0;
    for idx in order {
        if words >= target && !picked.is_empty() {
            break;
        }
        words += tokenized[idx].len();
        picked.push(idx);
    }
    picked.sort_unstable();

    let summary = picked
        .into_iter()
        .map(|i| sentences[i].as_str())
        .collect::<Vec<_>>()
        .join(" ");

    SummaryResult {
        summary,
        is_too_short: false,
    }
}

/// AI summary via an OpenAI-compatible endpoint. HTTPS is enforced by the
/// caller's config validation and double-checked here.
pub async fn summarize_ai(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    model: &str,
    text: &str,
    length: SummaryLength,
) -> Result<String, EnrichError> {
    if api_key.is_empty() {
        return Err(EnrichError::MissingCredentials("ai summary"));
    }
    if !endpoint.starts_with("https://") {
        return Err(EnrichError::InsecureEndpoint(endpoint.to_owned()));
    }

    let target = length.word_target();
    let system = format!(
        "You are a summarisation engine. Summarise the user's article in \
         about {target} words. Reply with the summary only."
    );
    let key = SecretString::from(api_key.to_owned());
    let content = chat_completion(client, endpoint, &key, model, &system, text).await?;
    Ok(content.trim().to_owned())
}

// ============================================================================
// Scoring
// ============================================================================

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '。' | '！' | '？') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_owned());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_owned());
    }

    sentences
}

fn tokenize(sentence: &str) -> Vec<String> {
    sentence
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Mean TF-IDF of a sentence's terms, with sentences as the "documents".
fn tfidf_scores(tokenized: &[Vec<String>]) -> Vec<f64> {
    use std::collections::{HashMap, HashSet};

    let n = tokenized.len() as f64;
    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for tokens in tokenized {
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        for term in unique {
            *doc_freq.entry(term).or_insert(0) += 1;
        }
    }

    tokenized
        .iter()
        .map(|tokens| {
            if tokens.is_empty() {
                return 0.0;
            }
            let mut term_counts: HashMap<&str, usize> = HashMap::new();
            for t in tokens {
                *term_counts.entry(t.as_str()).or_insert(0) += 1;
            }
            let len = tokens.len() as f64;
            let sum: f64 = term_counts
                .iter()
                .map(|(term, count)| {
                    let tf = *count as f64 / len;
                    let df = doc_freq.get(term).copied().unwrap_or(0) as f64;
                    let idf = (n / (1.0 + df)).ln().max(0.0);
                    tf * idf
                })
                .sum();
            sum / term_counts.len().max(1) as f64
        })
        .collect()
}

/// Power iteration over the sentence-similarity graph.
fn textrank_scores(tokenized: &[Vec<String>]) -> Vec<f64> {
    use std::collections::HashSet;

    let n = tokenized.len();
    if n == 0 {
        return Vec::new();
    }

    // Similarity: shared terms normalised by the log of both lengths
    let sets: Vec<HashSet<&str>> = tokenized
        .iter()
        .map(|t| t.iter().map(String::as_str).collect())
        .collect();

    let mut sim = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let shared = sets[i].intersection(&sets[j]).count() as f64;
            if shared == 0.0 {
                continue;
            }
            let denom = (tokenized[i].len() as f64).ln() + (tokenized[j].len() as f64).ln();
            let value = if denom > 0.0 { shared / denom } else { 0.0 };
            sim[i][j] = value;
            sim[j][i] = value;
        }
    }

    let out_sums: Vec<f64> = sim.iter().map(|row| row.iter().sum()).collect();

    let mut scores = vec![1.0f64; n];
    for _ in 0..TEXTRANK_ITERATIONS {
        let mut next = vec![0.0f64; n];
        for (i, next_score) in next.iter_mut().enumerate() {
            let incoming: f64 = (0..n)
                .filter(|&j| j != i && out_sums[j] > 0.0)
                .map(|j| sim[j][i] / out_sums[j] * scores[j])
                .sum();
            *next_score = (1.0 - TEXTRANK_DAMPING) + TEXTRANK_DAMPING * incoming;
        }
        scores = next;
    }

    scores
}

fn normalize(scores: Vec<f64>) -> Vec<f64> {
    let max = scores.iter().cloned().fold(f64::MIN, f64::max);
    if max <= 0.0 || !max.is_finite() {
        return vec![0.0; scores.len()];
    }
    scores.into_iter().map(|s| s / max).collect()
}

use scraper::{ElementRef, Html, Selector};

/// Tags that never carry article text
const NOISE_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "form", "iframe",
];
/// Containers considered as article-body candidates, best first
const CANDIDATE_SELECTORS: &[&str] = &["article", "main", "div", "section"];
/// A candidate below this much paragraph text is a teaser, not a body
const MIN_TEXT_LEN: usize = 250;
/// More link text than this fraction marks a navigation block
const MAX_LINK_DENSITY: f64 = 0.5;

/// Extract the readable body of an article page as an HTML fragment.
///
/// Returns `None` when nothing on the page looks like an article body.
pub fn extract_readable(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);

    let mut best: Option<(f64, String)> = None;

    for selector_text in CANDIDATE_SELECTORS {
        let selector = Selector::parse(selector_text).ok()?;
        for candidate in doc.select(&selector) {
            let Some(score) = score_candidate(&candidate) else {
                continue;
            };
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, candidate.inner_html()));
            }
        }
        // An <article>/<main> hit is authoritative; only fall through to
        // generic containers when the semantic tags yielded nothing
        if best.is_some() && matches!(*selector_text, "article" | "main") {
            break;
        }
    }

    best.map(|(_, html)| html)
}

/// Paragraph text volume discounted by link density; `None` for blocks
/// that cannot be an article body.
fn score_candidate(candidate: &ElementRef<'_>) -> Option<f64> {
    if NOISE_TAGS.contains(&candidate.value().name()) {
        return None;
    }

    let p_selector = Selector::parse("p").ok()?;
    let a_selector = Selector::parse("a").ok()?;

    let text_len: usize = candidate
        .select(&p_selector)
        .map(|p| p.text().map(str::len).sum::<usize>())
        .sum();
    if text_len < MIN_TEXT_LEN {
        return None;
    }

    let link_len: usize = candidate
        .select(&a_selector)
        .map(|a| a.text().map(str::len).sum::<usize>())
        .sum();
    let total: usize = candidate.text().map(str::len).sum();
    let link_density = if total > 0 {
        link_len as f64 / total as f64
    } else {
        1.0
    };
    if link_density > MAX_LINK_DENSITY {
        return None;
    }

    Some(text_len as f64 * (1.0 - link_density))
}

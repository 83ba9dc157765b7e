use std::borrow::Cow;

/// Strips ASCII control characters from feed-supplied text.
///
/// Feed XML is attacker-controlled; titles and descriptions can embed
/// terminal escape sequences or other control bytes that would otherwise be
/// persisted and served back out. Tabs and newlines are collapsed to a
/// single space, everything else below 0x20 (and DEL) is dropped.
///
/// Returns `Cow::Borrowed` when the input is already clean.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(|c| c.is_control()) {
        return Cow::Borrowed(s);
    }

    let cleaned: String = s
        .chars()
        .filter_map(|c| {
            if c == '\n' || c == '\t' || c == '\r' {
                Some(' ')
            } else if c.is_control() {
                None
            } else {
                Some(c)
            }
        })
        .collect();

    Cow::Owned(cleaned)
}

/// Truncates to at most `max` characters, appending `…` when text was cut.
///
/// Character-based (not byte-based) so multi-byte text never splits inside
/// a code point. Used for the title fallback chain where an article has no
/// title and the first line of its content stands in.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Removes markup from an HTML fragment, returning the visible text.
///
/// Simple scanner rather than a DOM parse: good enough for deriving a title
/// from a content snippet, where entity fidelity does not matter.
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

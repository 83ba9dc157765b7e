//! Selector-driven extraction for `html+xpath` and `xml+xpath` feeds.
//!
//! The stored configuration is ten XPath expressions (item, title, content,
//! uri, author, timestamp, time-format, thumbnail, categories, uid). XML
//! pages evaluate directly; HTML pages are first normalised to well-formed
//! XML from the parsed DOM, since real-world HTML (unclosed tags, bare
//! attributes) is not valid XML input.

use sxd_xpath::{Context, Factory, Value};
use thiserror::Error;

use crate::storage::{ParsedArticle, SelectorConfig};
use crate::util::{strip_control_chars, strip_html, truncate_chars};

use super::parser::resolve_url;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("no item expression configured")]
    MissingItem,
    #[error("invalid expression `{expr}`: {message}")]
    BadExpression { expr: String, message: String },
    #[error("item expression must select nodes")]
    NotANodeset,
    #[error("document is not well-formed XML: {0}")]
    Xml(String),
}

/// Run the configured expressions over a fetched page.
///
/// `html` switches on the HTML→XML normalisation step. `base_url` resolves
/// relative links and thumbnails.
pub fn extract(
    doc_text: &str,
    html: bool,
    selectors: &SelectorConfig,
    base_url: &str,
) -> Result<Vec<ParsedArticle>, SelectorError> {
    let item_expr = selectors
        .item
        .as_deref()
        .filter(|e| !e.trim().is_empty())
        .ok_or(SelectorError::MissingItem)?;

    let xml_text;
    let doc_text = if html {
        xml_text = html_to_xml(doc_text);
        xml_text.as_str()
    } else {
        doc_text
    };

    let package =
        sxd_document::parser::parse(doc_text).map_err(|e| SelectorError::Xml(e.to_string()))?;
    let document = package.as_document();

    let factory = Factory::new();
    let context = Context::new();

    let item_xpath = build(&factory, item_expr)?;
    let value = item_xpath
        .evaluate(&context, document.root())
        .map_err(|e| SelectorError::BadExpression {
            expr: item_expr.to_owned(),
            message: e.to_string(),
        })?;

    let nodes = match value {
        Value::Nodeset(set) => set.document_order(),
        _ => return Err(SelectorError::NotANodeset),
    };

    let now = chrono::Utc::now().timestamp();
    let mut articles = Vec::with_capacity(nodes.len());

    for node in nodes {
        let eval = |expr: &Option<String>| -> Result<Option<String>, SelectorError> {
            let Some(expr) = expr.as_deref().filter(|e| !e.trim().is_empty()) else {
                return Ok(None);
            };
            let xpath = build(&factory, expr)?;
            let value =
                xpath
                    .evaluate(&context, node)
                    .map_err(|e| SelectorError::BadExpression {
                        expr: expr.to_owned(),
                        message: e.to_string(),
                    })?;
            Ok(value_to_string(value))
        };

        let url = eval(&selectors.link)?
            .map(|href| resolve_url(base_url, href.trim()))
            .filter(|href| !href.is_empty());

        let content = eval(&selectors.content)?;

        let mut title = eval(&selectors.title)?
            .map(|t| strip_control_chars(t.trim()).into_owned())
            .unwrap_or_default();
        if title.is_empty() {
            if let Some(text_source) = content.as_deref() {
                title = truncate_chars(strip_html(text_source).trim(), 100);
            }
        }
        if title.is_empty() {
            title = url.clone().unwrap_or_default();
        }

        let published = eval(&selectors.time)?
            .and_then(|raw| parse_time(&raw, selectors.time_format.as_deref()))
            .unwrap_or(now);

        let image_url = eval(&selectors.thumbnail)?
            .map(|src| resolve_url(base_url, src.trim()))
            .filter(|src| !src.is_empty());

        let uid = eval(&selectors.uid)?
            .map(|u| u.trim().to_owned())
            .filter(|u| !u.is_empty());

        articles.push(ParsedArticle {
            title,
            url,
            image_url,
            audio_url: None,
            published,
            content,
            uid,
        });
    }

    Ok(articles)
}

fn build(factory: &Factory, expr: &str) -> Result<sxd_xpath::XPath, SelectorError> {
    factory
        .build(expr)
        .map_err(|e| SelectorError::BadExpression {
            expr: expr.to_owned(),
            message: e.to_string(),
        })?
        .ok_or_else(|| SelectorError::BadExpression {
            expr: expr.to_owned(),
            message: "empty expression".to_owned(),
        })
}

fn value_to_string(value: Value<'_>) -> Option<String> {
    let s = match value {
        Value::Nodeset(set) => set.document_order().first().map(|n| n.string_value())?,
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Boolean(b) => b.to_string(),
    };
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Parse a raw timestamp, trying the user-supplied layout first and falling
/// back to the common interchange formats.
fn parse_time(raw: &str, format: Option<&str>) -> Option<i64> {
    let raw = raw.trim();

    if let Some(fmt) = format.filter(|f| !f.trim().is_empty()) {
        if let Ok(dt) = chrono::DateTime::parse_from_str(raw, fmt) {
            return Some(dt.timestamp());
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.and_utc().timestamp());
        }
        if let Ok(d) = chrono::NaiveDate::parse_from_str(raw, fmt) {
            return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
        }
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(raw) {
        return Some(dt.timestamp());
    }
    None
}

/// Re-serialise a parsed HTML DOM as well-formed XML.
///
/// Elements self-close when empty, text and attribute values are escaped,
/// comments and doctypes are dropped. Attribute names carrying `:` would
/// need namespace declarations the output does not have, so they are
/// skipped; the selectors people write target ordinary attributes.
pub fn html_to_xml(html: &str) -> String {
    let doc = scraper::Html::parse_document(html);
    let mut out = String::with_capacity(html.len());
    serialize_node(doc.tree.root(), &mut out);
    out
}

fn serialize_node(node: ego_tree::NodeRef<'_, scraper::Node>, out: &mut String) {
    match node.value() {
        scraper::Node::Document | scraper::Node::Fragment => {
            for child in node.children() {
                serialize_node(child, out);
            }
        }
        scraper::Node::Element(el) => {
            let name = el.name();
            if name.contains(':') {
                return;
            }
            out.push('<');
            out.push_str(name);
            for (attr_name, attr_value) in el.attrs() {
                if !is_xml_name(attr_name) {
                    continue;
                }
                out.push(' ');
                out.push_str(attr_name);
                out.push_str("=\"");
                push_escaped(attr_value, out);
                out.push('"');
            }
            if node.children().next().is_some() {
                out.push('>');
                for child in node.children() {
                    serialize_node(child, out);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            } else {
                out.push_str("/>");
            }
        }
        scraper::Node::Text(text) => {
            push_escaped(&text.text, out);
        }
        // Comments, doctypes and processing instructions carry nothing the
        // selectors can target
        _ => {}
    }
}

fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn push_escaped(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

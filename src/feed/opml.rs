//! OPML 2.0 import/export.
//!
//! Nested `<outline>` elements carry the category hierarchy; feed outlines
//! are the ones with an `xmlUrl`. Selector-driven and script feeds travel
//! through custom attributes (`itemXPath`, `scriptPath`, …) so a trawl
//! export re-imports losslessly, while plain readers ignore the extras.

use anyhow::Result;
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeMap;

use crate::storage::{Feed, FeedKind, SelectorConfig};

/// One importable feed entry with its category path resolved from nesting.
#[derive(Debug, Clone, PartialEq)]
pub struct OpmlOutline {
    pub title: String,
    pub xml_url: String,
    pub category: String,
    pub kind: FeedKind,
    pub selectors: SelectorConfig,
    pub script_path: Option<String>,
    pub refresh_interval: i64,
}

/// Parse an OPML document into flat feed entries.
///
/// Container outlines (no `xmlUrl`) contribute their `text`/`title` to the
/// `/`-joined category path of everything nested beneath them.
pub fn parse_opml(content: &str) -> Result<Vec<OpmlOutline>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut outlines = Vec::new();
    let mut category_stack: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Some(outline) = read_outline(&reader, &e, &category_stack)? {
                    outlines.push(outline);
                }
            }
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                match read_outline(&reader, &e, &category_stack)? {
                    Some(outline) => {
                        outlines.push(outline);
                        // Feed outline with children still occupies a stack
                        // slot so the matching End pops cleanly
                        category_stack.push(String::new());
                    }
                    None => {
                        let label = attr_value(&reader, &e, b"text")?
                            .or(attr_value(&reader, &e, b"title")?)
                            .unwrap_or_default();
                        category_stack.push(label);
                    }
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                category_stack.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow::anyhow!("XML parse error: {e}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(outlines)
}

/// Interpret one outline element; `None` for category containers.
fn read_outline(
    reader: &Reader<&[u8]>,
    e: &BytesStart<'_>,
    category_stack: &[String],
) -> Result<Option<OpmlOutline>> {
    let Some(xml_url) = attr_value(reader, e, b"xmlUrl")? else {
        return Ok(None);
    };

    let title = attr_value(reader, e, b"title")?
        .or(attr_value(reader, e, b"text")?)
        .unwrap_or_else(|| xml_url.clone());

    let kind = attr_value(reader, e, b"type")?
        .map(|t| FeedKind::parse(&t))
        .unwrap_or(FeedKind::Rss);

    let selectors = SelectorConfig {
        item: attr_value(reader, e, b"itemXPath")?,
        title: attr_value(reader, e, b"titleXPath")?,
        content: attr_value(reader, e, b"contentXPath")?,
        link: attr_value(reader, e, b"linkXPath")?,
        author: attr_value(reader, e, b"authorXPath")?,
        time: attr_value(reader, e, b"timeXPath")?,
        time_format: attr_value(reader, e, b"timeFormat")?,
        thumbnail: attr_value(reader, e, b"thumbXPath")?,
        categories: attr_value(reader, e, b"categoryXPath")?,
        uid: attr_value(reader, e, b"uidXPath")?,
    };

    let script_path = attr_value(reader, e, b"scriptPath")?;
    let refresh_interval = attr_value(reader, e, b"refreshInterval")?
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    let category = category_stack
        .iter()
        .filter(|c| !c.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/");

    Ok(Some(OpmlOutline {
        title,
        xml_url,
        category,
        kind,
        selectors,
        script_path,
        refresh_interval,
    }))
}

fn attr_value(
    reader: &Reader<&[u8]>,
    e: &BytesStart<'_>,
    name: &[u8],
) -> Result<Option<String>> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name {
            let value = attr.decode_and_unescape_value(reader.decoder())?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Serialise subscriptions as OPML 2.0, nesting outlines per category
/// segment and attaching the extension attributes when they carry data.
pub fn generate_opml(feeds: &[Feed]) -> Result<String> {
    #[derive(Default)]
    struct CatNode<'a> {
        children: BTreeMap<&'a str, CatNode<'a>>,
        feeds: Vec<&'a Feed>,
    }

    let mut root = CatNode::default();
    for feed in feeds {
        let mut node = &mut root;
        if !feed.category.is_empty() {
            for segment in feed.category.split('/') {
                node = node.children.entry(segment).or_default();
            }
        }
        node.feeds.push(feed);
    }

    fn write_node(writer: &mut Writer<Vec<u8>>, node: &CatNode<'_>) -> Result<()> {
        for feed in &node.feeds {
            let mut elem = BytesStart::new("outline");
            elem.push_attribute(("type", feed.kind.as_str()));
            elem.push_attribute(("text", feed.title.as_str()));
            elem.push_attribute(("title", feed.title.as_str()));
            elem.push_attribute(("xmlUrl", feed.url.as_str()));
            if feed.refresh_interval != 0 {
                elem.push_attribute(("refreshInterval", feed.refresh_interval.to_string().as_str()));
            }
            let s = &feed.selectors;
            for (attr, value) in [
                ("itemXPath", &s.item),
                ("titleXPath", &s.title),
                ("contentXPath", &s.content),
                ("linkXPath", &s.link),
                ("authorXPath", &s.author),
                ("timeXPath", &s.time),
                ("timeFormat", &s.time_format),
                ("thumbXPath", &s.thumbnail),
                ("categoryXPath", &s.categories),
                ("uidXPath", &s.uid),
            ] {
                if let Some(value) = value {
                    elem.push_attribute((attr, value.as_str()));
                }
            }
            if let Some(script) = &feed.script_path {
                elem.push_attribute(("scriptPath", script.as_str()));
            }
            writer.write_event(Event::Empty(elem))?;
        }

        for (name, child) in &node.children {
            let mut elem = BytesStart::new("outline");
            elem.push_attribute(("text", *name));
            elem.push_attribute(("title", *name));
            writer.write_event(Event::Start(elem))?;
            write_node(writer, child)?;
            writer.write_event(Event::End(quick_xml::events::BytesEnd::new("outline")))?;
        }

        Ok(())
    }

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer.write_event(Event::Start(opml))?;

    writer.write_event(Event::Start(BytesStart::new("head")))?;
    writer.write_event(Event::Start(BytesStart::new("title")))?;
    writer.write_event(Event::Text(quick_xml::events::BytesText::new(
        "trawl subscriptions",
    )))?;
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("title")))?;
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("head")))?;

    writer.write_event(Event::Start(BytesStart::new("body")))?;
    write_node(&mut writer, &root)?;
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("body")))?;
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("opml")))?;

    Ok(String::from_utf8(writer.into_inner())?)
}

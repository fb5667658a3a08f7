//! Markdown codec.
//!
//! Structure is recognised from list items, so observations and relations may appear anywhere in
//! the body, not only under `## Observations` / `## Relations` headings:
//!
//! ```markdown
//! ---
//! title: Coffee Notes
//! aliases: [beans]
//! ---
//! - [fact] likes coffee #morning (since 2019)
//! - relates_to [[Tea Notes]] (contrast)
//!
//! Free text mentioning [[Espresso]] becomes a `links_to` relation.
//! ```
use once_cell::sync::Lazy;
use pulldown_cmark::{
    Event as MdEvent, HeadingLevel, LinkType, MetadataBlockKind, Options, Parser as MdParser,
    Tag, TagEnd,
};
use regex::Regex;
use serde_yaml::{Mapping, Value as YamlValue};

use super::{
    diagnostic::{line_of, ParseError, ParseErrorKind},
    document::{ParsedDocument, ParsedObservation, ParsedRelation, LINKS_TO},
    DocCodec,
};
use crate::{error::NotebaseError, paths::file_stem};

static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*+]|\d{1,9}[.)])(?:\s+|$)").expect("valid regex"));

static OBSERVATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(?P<category>[^\[\]]+)\]\s+(?P<content>.+)$").expect("valid regex")
});

static RELATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<rtype>[^\[\]()]+?)\s+\[\[(?P<target>[^\[\]]+)\]\](?:\s+\((?P<context>[^()]*)\))?\s*$",
    )
    .expect("valid regex")
});

static TRAILING_CONTEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<content>.*?)\s+\((?P<context>[^()]*)\)\s*$").expect("valid regex"));

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)#(?P<tag>[\p{L}\p{N}_][\p{L}\p{N}_/-]*)").expect("valid regex"));

/// Task-list checkboxes look like categories but are not.
const TASK_MARKERS: [&str; 3] = [" ", "x", "X"];

pub fn notebase_md_options() -> Options {
    let mut md_options = Options::empty();
    md_options.insert(Options::ENABLE_FOOTNOTES);
    md_options.insert(Options::ENABLE_GFM);
    md_options.insert(Options::ENABLE_STRIKETHROUGH);
    md_options.insert(Options::ENABLE_TABLES);
    md_options.insert(Options::ENABLE_TASKLISTS);
    md_options.insert(Options::ENABLE_WIKILINKS);
    md_options.insert(Options::ENABLE_YAML_STYLE_METADATA_BLOCKS);
    md_options
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Observation,
    Relation,
    Plain,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MdCodec;

impl MdCodec {
    pub fn new() -> Self {
        MdCodec
    }
}

impl DocCodec for MdCodec {
    fn parse(&self, path: &str, bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
        let content = std::str::from_utf8(bytes)
            .map_err(|_| ParseError::new(path, ParseErrorKind::InvalidEncoding))?;
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        parse_markdown(path, content)
    }

    fn render(&self, doc: &ParsedDocument) -> Result<String, NotebaseError> {
        doc.to_markdown()
    }
}

#[tracing::instrument(skip_all)]
fn parse_markdown(path: &str, content: &str) -> Result<ParsedDocument, ParseError> {
    let mut doc = ParsedDocument::minimal(file_stem(path));
    let mut frontmatter_title: Option<String> = None;
    let mut meta_text = String::new();
    let mut in_meta = false;
    let mut saw_meta = false;
    let mut h1: Option<String> = None;
    let mut h1_text: Option<String> = None;
    let mut items: Vec<ItemKind> = Vec::new();

    for (event, range) in MdParser::new_ext(content, notebase_md_options()).into_offset_iter() {
        match event {
            MdEvent::Start(Tag::MetadataBlock(MetadataBlockKind::YamlStyle)) => {
                in_meta = true;
                saw_meta = true;
            }
            MdEvent::End(TagEnd::MetadataBlock(_)) => in_meta = false,
            MdEvent::Text(text) if in_meta => meta_text.push_str(&text),
            MdEvent::Start(Tag::Heading {
                level: HeadingLevel::H1,
                ..
            }) if h1.is_none() => h1_text = Some(String::new()),
            MdEvent::End(TagEnd::Heading(HeadingLevel::H1)) => {
                if let Some(text) = h1_text.take() {
                    h1 = Some(text.trim().to_string());
                }
            }
            MdEvent::Text(text) | MdEvent::Code(text) if h1_text.is_some() => {
                if let Some(buf) = h1_text.as_mut() {
                    buf.push_str(&text);
                }
            }
            MdEvent::Start(Tag::Item) => {
                let raw = content.get(range.clone()).unwrap_or_default();
                let line = raw.lines().next().unwrap_or_default();
                let kind = classify_item(line, &mut doc)
                    .map_err(|kind| ParseError::new(path, kind).at_line(line_of(content, range.start)))?;
                items.push(kind);
            }
            MdEvent::End(TagEnd::Item) => {
                items.pop();
            }
            MdEvent::Start(Tag::Link {
                link_type: LinkType::WikiLink { .. },
                dest_url,
                ..
            }) => {
                if items.last() != Some(&ItemKind::Relation) {
                    doc.push_relation(ParsedRelation {
                        relation_type: LINKS_TO.to_string(),
                        target: strip_label(&dest_url).to_string(),
                        context: None,
                    });
                }
            }
            _ => {}
        }
    }

    if !saw_meta && opens_frontmatter(content) {
        return Err(ParseError::new(path, ParseErrorKind::UnterminatedFrontmatter).at_line(1));
    }
    if !meta_text.trim().is_empty() {
        let value = serde_yaml::from_str::<YamlValue>(&meta_text).map_err(|e| {
            ParseError::new(path, ParseErrorKind::InvalidFrontmatter(e.to_string())).at_line(1)
        })?;
        match value {
            YamlValue::Mapping(map) => {
                frontmatter_title = apply_frontmatter(map, &mut doc)
                    .map_err(|kind| ParseError::new(path, kind).at_line(1))?;
            }
            YamlValue::Null => {}
            _ => {
                return Err(
                    ParseError::new(path, ParseErrorKind::FrontmatterNotMapping).at_line(1)
                )
            }
        }
    }

    if let Some(title) = frontmatter_title.or(h1).filter(|t| !t.is_empty()) {
        doc.title = title;
    }
    Ok(doc)
}

/// A first line of `---` with no closing `---`/`...` line after it.
fn opens_frontmatter(content: &str) -> bool {
    let mut lines = content.lines();
    if lines.next().map(str::trim_end) != Some("---") {
        return false;
    }
    !lines.any(|line| matches!(line.trim_end(), "---" | "..."))
}

fn strip_label(target: &str) -> &str {
    target.split('|').next().unwrap_or(target).trim()
}

fn classify_item(line: &str, doc: &mut ParsedDocument) -> Result<ItemKind, ParseErrorKind> {
    let text = match LIST_MARKER.find(line) {
        Some(marker) => &line[marker.end()..],
        None => line,
    }
    .trim();

    if text.matches("[[").count() > text.matches("]]").count() {
        return Err(ParseErrorKind::UnterminatedLink);
    }

    if let Some(caps) = OBSERVATION.captures(text) {
        let category = caps["category"].trim();
        if !TASK_MARKERS.contains(&&caps["category"]) && !category.is_empty() {
            let (content, context) = split_context(caps["content"].trim());
            let tags = TAG
                .captures_iter(&content)
                .map(|c| c["tag"].to_string())
                .collect();
            doc.observations.push(ParsedObservation {
                category: category.to_string(),
                content,
                context,
                tags,
            });
            return Ok(ItemKind::Observation);
        }
    }

    if let Some(caps) = RELATION.captures(text) {
        let relation = ParsedRelation {
            relation_type: caps["rtype"].trim().to_string(),
            target: strip_label(&caps["target"]).to_string(),
            context: caps
                .name("context")
                .map(|c| c.as_str().trim().to_string())
                .filter(|c| !c.is_empty()),
        };
        doc.push_relation(relation);
        return Ok(ItemKind::Relation);
    }

    Ok(ItemKind::Plain)
}

fn split_context(content: &str) -> (String, Option<String>) {
    match TRAILING_CONTEXT.captures(content) {
        Some(caps) if !caps["content"].trim().is_empty() => {
            let context = caps["context"].trim();
            (
                caps["content"].trim().to_string(),
                (!context.is_empty()).then(|| context.to_string()),
            )
        }
        _ => (content.to_string(), None),
    }
}

fn yaml_to_string(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Move reserved keys onto the document, everything else into metadata. Returns the
/// frontmatter title, if one was given.
fn apply_frontmatter(
    map: Mapping,
    doc: &mut ParsedDocument,
) -> Result<Option<String>, ParseErrorKind> {
    let mut title = None;
    for (key, value) in map {
        let key = match yaml_to_string(&key) {
            Some(key) => key,
            None => {
                return Err(ParseErrorKind::InvalidFrontmatter(
                    "frontmatter keys must be scalars".to_string(),
                ))
            }
        };
        match key.as_str() {
            "title" => title = yaml_to_string(&value).map(|t| t.trim().to_string()),
            "type" => {
                if let Some(entity_type) = yaml_to_string(&value).filter(|t| !t.trim().is_empty())
                {
                    doc.entity_type = entity_type.trim().to_string();
                }
            }
            "permalink" => {
                doc.permalink = yaml_to_string(&value)
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty());
            }
            "aliases" => {
                doc.aliases = match &value {
                    YamlValue::Sequence(seq) => seq.iter().filter_map(yaml_to_string).collect(),
                    other => yaml_to_string(other).into_iter().collect(),
                };
            }
            _ => {
                let json = serde_json::to_value(&value)
                    .map_err(|e| ParseErrorKind::InvalidFrontmatter(e.to_string()))?;
                doc.metadata.insert(key, json);
            }
        }
    }
    Ok(title)
}

//! The structured form of one parsed file, independent of the index.
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value as YamlValue};

use crate::{
    error::NotebaseError,
    nodekey::target_key,
    properties::{Metadata, DEFAULT_ENTITY_TYPE},
};

/// Frontmatter keys promoted to [ParsedDocument] fields; everything else lands in `metadata`.
pub const RESERVED_KEYS: [&str; 4] = ["title", "type", "permalink", "aliases"];

/// Relation type given to wiki links that are not written as an explicit relation.
pub const LINKS_TO: &str = "links_to";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedObservation {
    pub category: String,
    /// Observation text as written, tags included
    pub content: String,
    pub context: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRelation {
    pub relation_type: String,
    /// Target text as written, without `[[`/`]]` or any `|label`
    pub target: String,
    pub context: Option<String>,
}

impl ParsedRelation {
    pub fn target_key(&self) -> String {
        target_key(&self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub title: String,
    pub entity_type: String,
    /// Explicit frontmatter permalink, if any
    pub permalink: Option<String>,
    pub aliases: Vec<String>,
    pub metadata: Metadata,
    pub observations: Vec<ParsedObservation>,
    pub relations: Vec<ParsedRelation>,
}

impl ParsedDocument {
    /// Document with a title and nothing else; what a file without structure, or one that failed
    /// to parse, indexes as.
    pub fn minimal(title: &str) -> ParsedDocument {
        ParsedDocument {
            title: title.to_string(),
            entity_type: DEFAULT_ENTITY_TYPE.to_string(),
            permalink: None,
            aliases: Vec::new(),
            metadata: Metadata::new(),
            observations: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Add a relation unless one with the same type and target key is already present.
    pub fn push_relation(&mut self, relation: ParsedRelation) -> bool {
        let key = relation.target_key();
        if key.is_empty()
            || self
                .relations
                .iter()
                .any(|r| r.relation_type == relation.relation_type && r.target_key() == key)
        {
            return false;
        }
        self.relations.push(relation);
        true
    }

    /// Serialize to Markdown. Parsing the output yields an equal document, relation order
    /// included.
    pub fn to_markdown(&self) -> Result<String, NotebaseError> {
        let mut frontmatter = Mapping::new();
        frontmatter.insert("title".into(), self.title.clone().into());
        frontmatter.insert("type".into(), self.entity_type.clone().into());
        if let Some(permalink) = &self.permalink {
            frontmatter.insert("permalink".into(), permalink.clone().into());
        }
        if !self.aliases.is_empty() {
            frontmatter.insert(
                "aliases".into(),
                YamlValue::Sequence(self.aliases.iter().cloned().map(YamlValue::from).collect()),
            );
        }
        for (key, value) in self.metadata.iter() {
            frontmatter.insert(key.clone().into(), serde_yaml::to_value(value)?);
        }

        let mut out = String::from("---\n");
        out.push_str(&serde_yaml::to_string(&frontmatter)?);
        out.push_str("---\n");

        // Relations first: inline links inside observations re-parse as duplicates of them.
        if !self.relations.is_empty() {
            out.push_str("\n## Relations\n\n");
            for rel in self.relations.iter() {
                out.push_str(&format!("- {} [[{}]]", rel.relation_type, rel.target));
                if let Some(context) = &rel.context {
                    out.push_str(&format!(" ({context})"));
                }
                out.push('\n');
            }
        }
        if !self.observations.is_empty() {
            out.push_str("\n## Observations\n\n");
            for obs in self.observations.iter() {
                out.push_str(&format!("- [{}] {}", obs.category, obs.content));
                if let Some(context) = &obs.context {
                    out.push_str(&format!(" ({context})"));
                }
                out.push('\n');
            }
        }
        Ok(out)
    }
}

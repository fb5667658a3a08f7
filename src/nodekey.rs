//! [crate::nodekey] holds the permalink normalization rules and the lookup keys an entity answers
//! to when a relation names it.
//!
//! Every relation target is reduced to a single normalized key with [target_key]. Every entity
//! publishes a small set of [NodeKey]s (its permalink, aliases, title and permalink basename). A
//! relation resolves to an entity when its key is one of the entity's keys; when several entities
//! share a key, [KeyKind] priority decides.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::paths::strip_extension;

/// Fallback permalink when neither path nor title yields any usable character.
pub const UNTITLED: &str = "untitled";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Permalink,
    Alias,
    Title,
    Basename,
}

impl KeyKind {
    /// Lower sorts first when several entities answer to the same key.
    pub fn priority(&self) -> i64 {
        match self {
            KeyKind::Permalink => 0,
            KeyKind::Alias => 1,
            KeyKind::Title => 2,
            KeyKind::Basename => 3,
        }
    }

    pub fn from_priority(priority: i64) -> Option<KeyKind> {
        match priority {
            0 => Some(KeyKind::Permalink),
            1 => Some(KeyKind::Alias),
            2 => Some(KeyKind::Title),
            3 => Some(KeyKind::Basename),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub kind: KeyKind,
    pub key: String,
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.key)
    }
}

/// Normalize one path segment or free-text string into permalink form.
///
/// Unicode is decomposed (NFKD) and combining marks dropped so `Café` and `Cafe` agree. Every run
/// of characters that are not alphanumeric collapses into a single `-`.
pub fn to_permalink_segment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_sep = false;
    for c in text.nfkd().filter(|c| !is_combining_mark(*c)) {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Normalize a `/`-separated string into a permalink, keeping the segment structure.
pub fn to_permalink(text: &str) -> String {
    text.split(['/', '\\'])
        .map(to_permalink_segment)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<String>>()
        .join("/")
}

/// Permalink derived from a project-relative file path: `Notes/My Note.md` → `notes/my-note`.
pub fn permalink_from_path(rel_path: &str) -> String {
    to_permalink(strip_extension(rel_path))
}

/// Pick the permalink candidate for a document: explicit value first, then its path, then its
/// title. Returns `(candidate, explicit)`.
pub fn permalink_candidate(explicit: Option<&str>, rel_path: &str, title: &str) -> (String, bool) {
    if let Some(explicit) = explicit.map(to_permalink).filter(|p| !p.is_empty()) {
        return (explicit, true);
    }
    let from_path = permalink_from_path(rel_path);
    if !from_path.is_empty() {
        return (from_path, false);
    }
    let from_title = to_permalink(title);
    if !from_title.is_empty() {
        return (from_title, false);
    }
    (UNTITLED.to_string(), false)
}

/// Reduce a relation target as written (`[[Some Note]]`, `[[notes/b.md]]`, `[[b|label]]`,
/// `[[b#section]]`) to the key it is looked up by.
pub fn target_key(target: &str) -> String {
    let target = target.split('|').next().unwrap_or(target);
    let target = target.split('#').next().unwrap_or(target).trim();
    let target = if target.to_ascii_lowercase().ends_with(".md") {
        &target[..target.len() - 3]
    } else {
        target
    };
    to_permalink(target)
}

/// Keys an entity answers to, deduplicated and in priority order.
pub fn entity_keys(permalink: &str, title: &str, aliases: &[String]) -> Vec<NodeKey> {
    let mut keys: Vec<NodeKey> = Vec::new();
    let mut push = |kind: KeyKind, key: String| {
        if !key.is_empty() && !keys.iter().any(|k| k.key == key) {
            keys.push(NodeKey { kind, key });
        }
    };
    push(KeyKind::Permalink, permalink.to_string());
    for alias in aliases {
        push(KeyKind::Alias, to_permalink(alias));
    }
    push(KeyKind::Title, to_permalink(title));
    if let Some(basename) = permalink.rsplit('/').next() {
        push(KeyKind::Basename, basename.to_string());
    }
    keys
}

/// Short, stable, path-derived suffix used to break permalink collisions.
pub fn short_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)[..6].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permalink_segment_normalization() {
        assert_eq!(to_permalink_segment("My Note"), "my-note");
        assert_eq!(to_permalink_segment("  Hello,   World!  "), "hello-world");
        assert_eq!(to_permalink_segment("DL-11-feature-a"), "dl-11-feature-a");
        assert_eq!(to_permalink_segment("Café Société"), "cafe-societe");
        assert_eq!(to_permalink_segment("snake_case_name"), "snake-case-name");
        assert_eq!(to_permalink_segment("日本語 ノート"), "日本語-ノート");
        assert_eq!(to_permalink_segment("!!!"), "");
    }

    #[test]
    fn test_permalink_from_path() {
        assert_eq!(permalink_from_path("DL-11-feature-a.md"), "dl-11-feature-a");
        assert_eq!(permalink_from_path("Notes/My Note.md"), "notes/my-note");
        assert_eq!(permalink_from_path("a.md"), "a");
        assert_eq!(permalink_from_path("deep/ /x.md"), "deep/x");
    }

    #[test]
    fn test_permalink_candidate_order() {
        assert_eq!(
            permalink_candidate(Some("Custom/Link"), "notes/a.md", "A"),
            ("custom/link".to_string(), true)
        );
        assert_eq!(
            permalink_candidate(Some("  "), "notes/a.md", "A"),
            ("notes/a".to_string(), false)
        );
        assert_eq!(
            permalink_candidate(None, "!!!.md", "Fallback Title"),
            ("fallback-title".to_string(), false)
        );
        assert_eq!(
            permalink_candidate(None, "!!!.md", "???"),
            (UNTITLED.to_string(), false)
        );
    }

    #[test]
    fn test_target_key() {
        assert_eq!(target_key("b"), "b");
        assert_eq!(target_key("Some Note"), "some-note");
        assert_eq!(target_key("notes/b.md"), "notes/b");
        assert_eq!(target_key("b|Bee"), "b");
        assert_eq!(target_key("b#section"), "b");
    }

    #[test]
    fn test_entity_keys_dedup_and_order() {
        let keys = entity_keys("notes/coffee", "Coffee", &["Beans".to_string()]);
        assert_eq!(
            keys,
            vec![
                NodeKey {
                    kind: KeyKind::Permalink,
                    key: "notes/coffee".to_string()
                },
                NodeKey {
                    kind: KeyKind::Alias,
                    key: "beans".to_string()
                },
                NodeKey {
                    kind: KeyKind::Title,
                    key: "coffee".to_string()
                },
            ]
        );
        let keys = entity_keys("b", "b", &[]);
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_short_hash_is_stable() {
        assert_eq!(short_hash("notes/a.md"), short_hash("notes/a.md"));
        assert_ne!(short_hash("notes/a.md"), short_hash("notes/b.md"));
        assert_eq!(short_hash("x").len(), 6);
    }
}

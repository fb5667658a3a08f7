//! Document parsing.
//!
//! A [`DocCodec`] turns the raw bytes of one file into a [`ParsedDocument`] and back. Codecs are
//! stateless, so the sync coordinator can parse many files of one batch in parallel.
//!
//! ## Built-in Codecs
//!
//! - **Markdown** (`.md`, `.markdown`) - via [`md::MdCodec`]
//!
//! Register custom codecs via [`CodecMap::insert`]:
//!
//! ```rust
//! use notebase_core::{codec::{CODECS, DocCodec, ParseError, ParsedDocument}, NotebaseError};
//!
//! #[derive(Default)]
//! struct PlainTextCodec;
//!
//! impl DocCodec for PlainTextCodec {
//!     fn parse(&self, path: &str, _bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
//!         Ok(ParsedDocument::minimal(path))
//!     }
//!
//!     fn render(&self, doc: &ParsedDocument) -> Result<String, NotebaseError> {
//!         Ok(doc.title.clone())
//!     }
//! }
//! CODECS.insert::<PlainTextCodec>("txt".to_string());
//! assert!(CODECS.get("txt").is_some());
//! ```

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::{path::Path, result::Result, sync::Arc};

use crate::{error::NotebaseError, paths::extension};

pub mod diagnostic;
pub mod document;
pub mod md;

pub use diagnostic::{ParseError, ParseErrorKind};
pub use document::{ParsedDocument, ParsedObservation, ParsedRelation, LINKS_TO};

/// Global codec map with the builtin codecs
pub static CODECS: Lazy<CodecMap> = Lazy::new(CodecMap::create);

pub trait DocCodec: Send + Sync {
    /// Parse the raw bytes of the file at project-relative `path`.
    fn parse(&self, path: &str, bytes: &[u8]) -> Result<ParsedDocument, ParseError>;

    /// Produce source text that parses back to `doc`.
    fn render(&self, doc: &ParsedDocument) -> Result<String, NotebaseError>;
}

// It is better to express the complexity of the registry than hide it. The CodecMap methods are
// used to properly unwrap this structure.
#[allow(clippy::type_complexity)]
pub struct CodecMap(Arc<RwLock<Vec<(String, Arc<dyn DocCodec>)>>>);

impl Clone for CodecMap {
    fn clone(&self) -> Self {
        CodecMap(self.0.clone())
    }
}

impl Default for CodecMap {
    fn default() -> Self {
        CodecMap::create()
    }
}

impl CodecMap {
    pub fn create() -> Self {
        let md: Arc<dyn DocCodec> = Arc::new(md::MdCodec::new());
        CodecMap(Arc::new(RwLock::new(vec![
            ("md".to_string(), md.clone()),
            ("markdown".to_string(), md),
        ])))
    }

    pub fn insert<T: DocCodec + Default + 'static>(&self, extension: String) {
        let mut writer = self.0.write();
        let codec: Arc<dyn DocCodec> = Arc::new(T::default());
        if let Some(entry) = writer.iter_mut().find(|(ext, _)| ext == &extension) {
            entry.1 = codec;
        } else {
            writer.push((extension, codec));
        }
    }

    pub fn get(&self, ext: &str) -> Option<Arc<dyn DocCodec>> {
        self.0
            .read()
            .iter()
            .find(|(codec_ext, _value)| codec_ext.eq_ignore_ascii_case(ext))
            .map(|(_codec_ext, value)| value.clone())
    }

    /// Codec responsible for a project-relative path, chosen by extension.
    pub fn for_path(&self, rel_path: &str) -> Option<Arc<dyn DocCodec>> {
        extension(rel_path).and_then(|ext| self.get(ext))
    }

    pub fn extensions(&self) -> Vec<String> {
        self.0
            .read()
            .iter()
            .map(|(codec_ext, _value)| codec_ext.clone())
            .collect::<Vec<String>>()
    }

    /// Read and parse a file. Parse failures still yield a document: the minimal one, paired
    /// with the error.
    pub fn parse_file(
        &self,
        root: &Path,
        rel_path: &str,
    ) -> Result<(ParsedDocument, Option<ParseError>), NotebaseError> {
        let bytes = std::fs::read(root.join(crate::paths::string_to_os_path(rel_path)))?;
        self.parse_bytes(rel_path, &bytes)
    }

    pub fn parse_bytes(
        &self,
        rel_path: &str,
        bytes: &[u8],
    ) -> Result<(ParsedDocument, Option<ParseError>), NotebaseError> {
        let codec = self.for_path(rel_path).ok_or_else(|| {
            NotebaseError::NotFound(format!("no codec registered for {rel_path}"))
        })?;
        match codec.parse(rel_path, bytes) {
            Ok(doc) => Ok((doc, None)),
            Err(parse_error) => {
                tracing::warn!("{parse_error}; indexing as a minimal entity");
                Ok((
                    ParsedDocument::minimal(crate::paths::file_stem(rel_path)),
                    Some(parse_error),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_lookup() {
        let codecs = CodecMap::create();
        assert!(codecs.for_path("notes/a.md").is_some());
        assert!(codecs.for_path("notes/a.MARKDOWN").is_some());
        assert!(codecs.for_path("notes/a.txt").is_none());
        assert!(codecs.extensions().contains(&"md".to_string()));
    }

    #[test]
    fn test_parse_bytes_degrades_to_minimal() {
        let codecs = CodecMap::create();
        let (doc, err) = codecs
            .parse_bytes("notes/Broken Doc.md", b"- rel [[oops\n")
            .unwrap();
        assert_eq!(doc, ParsedDocument::minimal("Broken Doc"));
        assert!(err.is_some());

        assert!(matches!(
            codecs.parse_bytes("notes/a.txt", b""),
            Err(NotebaseError::NotFound(_))
        ));
    }
}

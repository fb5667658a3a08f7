use std::{
    borrow::Cow,
    path::{Component, Path, PathBuf, MAIN_SEPARATOR_STR},
};

use crate::error::NotebaseError;

/// Project-relative paths are stored with `/` separators regardless of platform.
pub fn os_path_to_string<P: AsRef<Path>>(os_path_ref: P) -> String {
    os_path_ref
        .as_ref()
        .components()
        .filter_map(|c| match c {
            Component::RootDir | Component::CurDir => None,
            _ => Some(c.as_os_str().to_string_lossy()),
        })
        .collect::<Vec<Cow<'_, str>>>()
        .join("/")
}

pub fn string_to_os_path(path_string: &str) -> PathBuf {
    PathBuf::from(path_string.replace('/', MAIN_SEPARATOR_STR))
}

/// Express `path` relative to the project `root` as a `/`-separated string.
pub fn relative_path(root: &Path, path: &Path) -> Result<String, NotebaseError> {
    let rel = path.strip_prefix(root)?;
    Ok(os_path_to_string(rel))
}

/// True when any component of a project-relative path starts with a dot
/// (`.git/config`, `.obsidian/x.md`, `notes/.draft.md`).
pub fn is_hidden(rel_path: &str) -> bool {
    rel_path
        .split('/')
        .any(|segment| segment.starts_with('.') && segment != "." && segment != "..")
}

/// Extension of the final path segment, without the dot.
pub fn extension(rel_path: &str) -> Option<&str> {
    let file_name = file_name(rel_path);
    file_name
        .rfind('.')
        .filter(|idx| *idx > 0)
        .map(|idx| &file_name[idx + 1..])
}

pub fn has_extension(rel_path: &str, extensions: &[String]) -> bool {
    extension(rel_path)
        .map(|ext| extensions.iter().any(|ce| ce.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

pub fn file_name(rel_path: &str) -> &str {
    rel_path.rsplit('/').next().unwrap_or(rel_path)
}

/// Final path segment with its extension removed.
pub fn file_stem(rel_path: &str) -> &str {
    let file_name = file_name(rel_path);
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    }
}

/// Path with the extension of its final segment removed.
pub fn strip_extension(rel_path: &str) -> &str {
    match extension(rel_path) {
        Some(ext) => &rel_path[..rel_path.len() - ext.len() - 1],
        None => rel_path,
    }
}

/// Parent directory of a project-relative path; the project root is `""`.
pub fn directory_of(rel_path: &str) -> &str {
    match rel_path.rfind('/') {
        Some(idx) => &rel_path[..idx],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_path_round_trip() {
        let path = string_to_os_path("notes/sub/a.md");
        assert_eq!(os_path_to_string(&path), "notes/sub/a.md");
    }

    #[test]
    fn test_relative_path() {
        let root = PathBuf::from("/tmp/project");
        let file = root.join("notes").join("a.md");
        assert_eq!(relative_path(&root, &file).unwrap(), "notes/a.md");
        assert!(relative_path(&root, Path::new("/elsewhere/a.md")).is_err());
    }

    #[test]
    fn test_is_hidden() {
        assert!(is_hidden(".git/config"));
        assert!(is_hidden("notes/.draft.md"));
        assert!(is_hidden(".obsidian/workspace.md"));
        assert!(!is_hidden("notes/a.md"));
        assert!(!is_hidden("a.b/c.md"));
    }

    #[test]
    fn test_extension_helpers() {
        let exts = vec!["md".to_string(), "markdown".to_string()];
        assert!(has_extension("notes/a.md", &exts));
        assert!(has_extension("notes/A.MD", &exts));
        assert!(!has_extension("notes/a.txt", &exts));
        assert!(!has_extension("notes/md", &exts));
        assert_eq!(extension(".hidden"), None);
        assert_eq!(file_stem("notes/My Note.md"), "My Note");
        assert_eq!(strip_extension("notes/My Note.md"), "notes/My Note");
        assert_eq!(strip_extension("README"), "README");
        assert_eq!(directory_of("notes/sub/a.md"), "notes/sub");
        assert_eq!(directory_of("a.md"), "");
    }
}

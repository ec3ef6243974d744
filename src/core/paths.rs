//! Shared path and source-location utilities.

use std::env;
use std::path::{Component, Path, PathBuf};

/// Where an artifact source lives, after scheme classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// `http://` or `https://` URL, fetched over the network.
    Remote(String),
    /// `file://` URL, UNC share, drive-letter or absolute path; stream-copied.
    Local(PathBuf),
}

/// Classify a download source. `None` means the scheme is not permitted at all.
#[must_use]
pub fn classify_source(source: &str) -> Option<SourceLocation> {
    let trimmed = source.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(SourceLocation::Remote(trimmed.to_string()));
    }
    if lower.starts_with("file://") {
        let rest = &trimmed["file://".len()..];
        // file:///C:/x and file://host/share are both accepted.
        let local = if is_drive_path(rest.trim_start_matches('/')) {
            rest.trim_start_matches('/').to_string()
        } else if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("//{rest}")
        };
        if local.trim_matches('/').is_empty() {
            return None;
        }
        return Some(SourceLocation::Local(PathBuf::from(local)));
    }
    if trimmed.starts_with(r"\\") || trimmed.starts_with("//") || is_drive_path(trimmed) {
        return Some(SourceLocation::Local(PathBuf::from(trimmed)));
    }
    if trimmed.starts_with('/') && trimmed.len() > 1 {
        return Some(SourceLocation::Local(PathBuf::from(trimmed)));
    }
    None
}

fn is_drive_path(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Last path segment of a URL or path, without query string.
#[must_use]
pub fn source_file_name(source: &str) -> String {
    let without_query = source.split(['?', '#']).next().unwrap_or(source);
    let name = without_query
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name.contains(':') {
        "artifact".to_string()
    } else {
        name.to_string()
    }
}

/// Lower-cased extension of a file name, if any.
#[must_use]
pub fn extension_lower(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// Resolve a path to an absolute, normalized path.
///
/// If `fs::canonicalize` succeeds (path exists), it is used to resolve symlinks
/// and normalize components. Otherwise the path is made absolute relative to
/// CWD and `..`/`.` components are resolved syntactically.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    normalize_syntactic(&absolute)
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_remote_sources() {
        assert_eq!(
            classify_source("HTTPS://Example.com/app.msi"),
            Some(SourceLocation::Remote("HTTPS://Example.com/app.msi".to_string()))
        );
        assert!(matches!(
            classify_source("http://example.com/x"),
            Some(SourceLocation::Remote(_))
        ));
    }

    #[test]
    fn classifies_local_sources() {
        assert_eq!(
            classify_source(r"\\fileserver\apps\tool.exe"),
            Some(SourceLocation::Local(PathBuf::from(r"\\fileserver\apps\tool.exe")))
        );
        assert_eq!(
            classify_source(r"C:\installers\tool.msi"),
            Some(SourceLocation::Local(PathBuf::from(r"C:\installers\tool.msi")))
        );
        assert_eq!(
            classify_source("/srv/installers/tool.tar.gz"),
            Some(SourceLocation::Local(PathBuf::from("/srv/installers/tool.tar.gz")))
        );
        assert_eq!(
            classify_source("file:///srv/tool.exe"),
            Some(SourceLocation::Local(PathBuf::from("/srv/tool.exe")))
        );
        assert_eq!(
            classify_source("file:///C:/tools/tool.exe"),
            Some(SourceLocation::Local(PathBuf::from("C:/tools/tool.exe")))
        );
    }

    #[test]
    fn rejects_unsupported_schemes() {
        assert_eq!(classify_source("ftp://example.com/x"), None);
        assert_eq!(classify_source("javascript:alert(1)"), None);
        assert_eq!(classify_source("relative/path.exe"), None);
        assert_eq!(classify_source(""), None);
        assert_eq!(classify_source("file://"), None);
    }

    #[test]
    fn file_name_strips_query_and_directories() {
        assert_eq!(
            source_file_name("https://cdn.example.com/v2/setup.exe?token=abc"),
            "setup.exe"
        );
        assert_eq!(source_file_name(r"\\srv\share\tool.msi"), "tool.msi");
        assert_eq!(source_file_name("https://example.com/"), "artifact");
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(
            extension_lower(Path::new("Setup.EXE")).as_deref(),
            Some("exe")
        );
        assert_eq!(extension_lower(Path::new("README")), None);
    }

    #[test]
    fn resolves_existing_path_canonically() {
        let cwd = env::current_dir().unwrap();
        let resolved = resolve_absolute_path(Path::new("."));
        assert_eq!(resolved, std::fs::canonicalize(&cwd).unwrap());
    }

    #[test]
    fn handles_parent_at_root() {
        #[cfg(unix)]
        {
            let input = Path::new("/../foo");
            let resolved = normalize_syntactic(input);
            assert_eq!(resolved, Path::new("/foo"));
        }
    }
}

use crate::error::AppError;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

fn disallowed_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("static regex"))
}

/// Reduces an uploaded filename to a safe, flat name: last path component only,
/// whitespace folded to `_`, anything outside `[A-Za-z0-9_.-]` dropped.
pub fn secure_filename(raw: &str) -> Result<String, AppError> {
    let last = raw
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    let folded = last.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = disallowed_chars().replace_all(&folded, "");
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        return Err(AppError::InvalidInput(format!("Filename '{}' is empty after sanitising", raw)));
    }
    debug!(raw = %raw, sanitized = %trimmed, "Sanitized filename");
    Ok(trimmed.to_string())
}

/// Joins a relative path onto `base`; absolute paths are returned unchanged.
pub fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Lexically normalises `..` and `.` components without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut components: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            _ => components.push(component),
        }
    }
    components.iter().collect()
}

/// Canonical form of a working directory if it exists, else its lexical form.
pub fn canonical_or_lexical(path: &Path) -> PathBuf {
    match dunce::canonicalize(path) {
        Ok(canonical) => canonical,
        Err(_) => normalize_lexically(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_directories_and_unsafe_characters() {
        assert_eq!(secure_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(secure_filename("C:\\Users\\me\\juror one.txt").unwrap(), "juror_one.txt");
        assert_eq!(secure_filename("case#1 (final).md").unwrap(), "case1_final.md");
        assert_eq!(secure_filename(".hidden").unwrap(), "hidden");
    }

    #[test]
    fn rejects_names_that_sanitise_to_nothing() {
        assert!(matches!(secure_filename("../.."), Err(AppError::InvalidInput(_))));
        assert!(matches!(secure_filename("   "), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn relative_paths_resolve_against_base() {
        let base = Path::new("/srv/app");
        assert_eq!(resolve_against(base, Path::new("out/a.txt")), PathBuf::from("/srv/app/out/a.txt"));
        assert_eq!(resolve_against(base, Path::new("/tmp/a.txt")), PathBuf::from("/tmp/a.txt"));
        assert_eq!(normalize_lexically(Path::new("/srv/app/./x/../y")), PathBuf::from("/srv/app/y"));
    }
}

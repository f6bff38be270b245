use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Environment variable the external programs read the key from.
pub const CHILD_ENV_VAR: &str = "GOOGLE_API_KEY";
/// Fallback variables, highest priority first.
pub const SOURCE_ENV_VARS: [&str; 2] = ["GOOGLE_API_KEY", "GEMINI_API_KEY"];

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    File,
    Env(&'static str),
}

/// Resolves the API key: first readable non-empty candidate file, then each env var in order.
pub fn resolve_api_key_with<F>(base: &Path, files: &[PathBuf], env: F) -> Option<(ApiKey, CredentialSource)>
where
    F: Fn(&str) -> Option<String>,
{
    for candidate in files {
        let path = if candidate.is_absolute() { candidate.clone() } else { base.join(candidate) };
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim();
                if !trimmed.is_empty() {
                    debug!(path = %path.display(), "API key loaded from file");
                    return Some((ApiKey(trimmed.to_string()), CredentialSource::File));
                }
                warn!(path = %path.display(), "API key file is empty");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to read API key file"),
        }
    }
    for var in SOURCE_ENV_VARS {
        if let Some(value) = env(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            debug!(var, "API key loaded from environment");
            return Some((ApiKey(value), CredentialSource::Env(var)));
        }
    }
    None
}

pub fn resolve_api_key(base: &Path, files: &[PathBuf]) -> Option<ApiKey> {
    let resolved = resolve_api_key_with(base, files, |k| std::env::var(k).ok());
    if resolved.is_none() {
        warn!("No API key found in credential files or environment; external programs may fail");
    }
    resolved.map(|(key, _)| key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_wins_over_environment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("backend")).unwrap();
        std::fs::write(dir.path().join("backend/api_key"), "  from-file\n").unwrap();
        let files = vec![PathBuf::from("api_key"), PathBuf::from("backend/api_key")];
        let (key, source) =
            resolve_api_key_with(dir.path(), &files, |_| Some("from-env".to_string())).unwrap();
        assert_eq!(key.expose(), "from-file");
        assert_eq!(source, CredentialSource::File);
    }

    #[test]
    fn env_vars_are_tried_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![PathBuf::from("api_key")];
        let (key, source) = resolve_api_key_with(dir.path(), &files, |k| match k {
            "GEMINI_API_KEY" => Some("gemini".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(key.expose(), "gemini");
        assert_eq!(source, CredentialSource::Env("GEMINI_API_KEY"));

        let (key, _) = resolve_api_key_with(dir.path(), &files, |k| Some(format!("{}-value", k))).unwrap();
        assert_eq!(key.expose(), "GOOGLE_API_KEY-value");
    }

    #[test]
    fn empty_file_falls_through_and_debug_is_redacted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("api_key"), "   \n").unwrap();
        let files = vec![PathBuf::from("api_key")];
        assert!(resolve_api_key_with(dir.path(), &files, |_| None).is_none());

        let (key, _) = resolve_api_key_with(dir.path(), &files, |_| Some("secret".to_string())).unwrap();
        assert!(!format!("{:?}", key).contains("secret"));
    }
}

use crate::config::Config;
use crate::error::AppError;
use crate::utils::path_utils::secure_filename;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_WEIGHT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Juror,
    Case,
}

impl FromStr for Category {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "juror" | "jurors" => Ok(Category::Juror),
            "case" | "cases" => Ok(Category::Case),
            _ => Err(AppError::InvalidInput(format!("Unknown artifact category: {}", s))),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Juror => f.write_str("juror"),
            Category::Case => f.write_str("case"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Uploaded,
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub name: String,
    pub category: Category,
    pub weight: u32,
    pub origin: Origin,
}

impl Artifact {
    pub fn new(name: impl Into<String>, category: Category, weight: u32) -> Self {
        Self {
            name: name.into(),
            category,
            weight,
            origin: Origin::Uploaded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArtifactMetadata {
    pub category: Category,
    pub weight: u32,
    pub generated: bool,
}

/// Storage seen by the core: the scheduler's input and the generator's output sink.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn list_artifacts(&self, category: Category) -> Result<Vec<Artifact>, AppError>;
    /// Names are unique per category only, so lookups are keyed by both.
    async fn get_metadata(&self, category: Category, name: &str) -> Option<ArtifactMetadata>;
    async fn store_metadata(&self, name: &str, category: Category, weight: u32, generated: bool);
    fn path_for(&self, category: Category, name: &str) -> PathBuf;
    /// Copies a freshly generated file into the juror collection.
    async fn import_generated(&self, source: &Path) -> Result<Artifact, AppError>;
}

// --- Upload schemas ---
#[derive(Debug, Deserialize)]
pub struct UploadFileParams {
    pub filename: String,
    #[serde(default)]
    pub category: Category,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub content: Option<String>,
}
fn default_weight() -> u32 { DEFAULT_WEIGHT }

#[derive(Debug, Deserialize)]
pub struct UploadBatchParams {
    pub files: Vec<UploadFileParams>,
}

#[derive(Debug, Serialize)]
pub struct UploadedFile {
    pub filename: String,
    pub category: Category,
    pub weight: u32,
    pub path: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct UploadBatchResult {
    pub success: bool,
    pub uploaded_files: Vec<UploadedFile>,
    pub upload_root: String,
    pub message: String,
}

#[derive(Debug)]
pub struct FileStore {
    juror_dir: PathBuf,
    case_dir: PathBuf,
    upload_root: PathBuf,
    metadata: TokioRwLock<HashMap<(Category, String), ArtifactMetadata>>,
}

impl FileStore {
    pub fn new(config: Arc<Config>) -> Result<Self, AppError> {
        let juror_dir = config.juror_dir();
        let case_dir = config.case_dir();
        std::fs::create_dir_all(&juror_dir)?;
        std::fs::create_dir_all(&case_dir)?;
        info!(root = %config.upload_root.display(), "Upload directory ready");
        Ok(Self {
            juror_dir,
            case_dir,
            upload_root: config.upload_root.clone(),
            metadata: TokioRwLock::new(HashMap::new()),
        })
    }

    fn dir_for(&self, category: Category) -> &Path {
        match category {
            Category::Juror => &self.juror_dir,
            Category::Case => &self.case_dir,
        }
    }

    /// Replaces the current upload set. Generated artifacts named in the batch survive untouched.
    #[instrument(skip(self, params), fields(files = params.files.len()))]
    pub async fn replace_batch(&self, params: &UploadBatchParams) -> Result<UploadBatchResult, AppError> {
        let mut prepared = Vec::with_capacity(params.files.len());
        for file in &params.files {
            if file.weight == 0 {
                return Err(AppError::InvalidInput(format!(
                    "Weight for '{}' must be a positive integer",
                    file.filename
                )));
            }
            prepared.push((secure_filename(&file.filename)?, file));
        }
        let referenced: HashSet<(Category, &str)> =
            prepared.iter().map(|(name, file)| (file.category, name.as_str())).collect();

        let mut metadata = self.metadata.write().await;
        let mut kept = HashSet::new();
        for category in [Category::Juror, Category::Case] {
            let mut entries = match fs::read_dir(self.dir_for(category)).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(category = %category, error = %e, "Failed to read category directory; nothing to clear");
                    continue;
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let key = (category, entry.file_name().to_string_lossy().into_owned());
                let is_generated = metadata.get(&key).map(|m| m.generated).unwrap_or(false);
                if is_generated && referenced.contains(&(category, key.1.as_str())) {
                    debug!(category = %category, name = %key.1, "Keeping generated artifact referenced by batch");
                    kept.insert(key);
                    continue;
                }
                match fs::remove_file(entry.path()).await {
                    Ok(()) => debug!(path = %entry.path().display(), "Deleted"),
                    // Listed but already gone.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                metadata.remove(&key);
            }
        }

        let mut uploaded_files = Vec::with_capacity(prepared.len());
        for (name, file) in prepared {
            let path = self.dir_for(file.category).join(&name);
            let key = (file.category, name.clone());
            let status = if kept.contains(&key) {
                if let Some(meta) = metadata.get_mut(&key) {
                    meta.weight = file.weight;
                }
                "kept"
            } else {
                let content = file.content.clone().unwrap_or_else(|| {
                    format!("Placeholder for {} (category: {}, weight: {})", name, file.category, file.weight)
                });
                fs::write(&path, content).await?;
                metadata.insert(
                    key,
                    ArtifactMetadata {
                        category: file.category,
                        weight: file.weight,
                        generated: false,
                    },
                );
                "uploaded"
            };
            info!(path = %path.display(), weight = file.weight, status, "Stored artifact");
            uploaded_files.push(UploadedFile {
                filename: name,
                category: file.category,
                weight: file.weight,
                path: path.display().to_string(),
                status,
            });
        }

        Ok(UploadBatchResult {
            success: true,
            message: format!("Cleared existing files and uploaded {} new files", uploaded_files.len()),
            uploaded_files,
            upload_root: self.upload_root.display().to_string(),
        })
    }
}

#[async_trait]
impl ArtifactStore for FileStore {
    #[instrument(skip(self))]
    async fn list_artifacts(&self, category: Category) -> Result<Vec<Artifact>, AppError> {
        let mut entries = match fs::read_dir(self.dir_for(category)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let metadata = self.metadata.read().await;
        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            match entry.file_type().await {
                Ok(ft) if ft.is_file() => {}
                Ok(_) => continue,
                Err(e) => {
                    debug!(name = %name, error = %e, "Skipping entry that vanished during listing");
                    continue;
                }
            }
            let (weight, origin) = match metadata.get(&(category, name.clone())) {
                Some(meta) => (
                    meta.weight,
                    if meta.generated { Origin::Generated } else { Origin::Uploaded },
                ),
                _ => (DEFAULT_WEIGHT, Origin::Uploaded),
            };
            artifacts.push(Artifact {
                name,
                category,
                weight,
                origin,
            });
        }
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }

    async fn get_metadata(&self, category: Category, name: &str) -> Option<ArtifactMetadata> {
        self.metadata.read().await.get(&(category, name.to_string())).copied()
    }

    async fn store_metadata(&self, name: &str, category: Category, weight: u32, generated: bool) {
        self.metadata.write().await.insert(
            (category, name.to_string()),
            ArtifactMetadata {
                category,
                weight,
                generated,
            },
        );
    }

    fn path_for(&self, category: Category, name: &str) -> PathBuf {
        self.dir_for(category).join(name)
    }

    #[instrument(skip(self), fields(source = %source.display()))]
    async fn import_generated(&self, source: &Path) -> Result<Artifact, AppError> {
        let base = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AppError::ArtifactNotFound(source.display().to_string()))?;
        let name = secure_filename(&format!("generated_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), base))?;
        let target = self.path_for(Category::Juror, &name);
        fs::copy(source, &target).await?;
        self.store_metadata(&name, Category::Juror, DEFAULT_WEIGHT, true).await;
        info!(name = %name, target = %target.display(), "Imported generated juror artifact");
        Ok(Artifact {
            name,
            category: Category::Juror,
            weight: DEFAULT_WEIGHT,
            origin: Origin::Generated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::config_for;

    fn upload(name: &str, category: Category, weight: u32) -> UploadFileParams {
        UploadFileParams {
            filename: name.to_string(),
            category,
            weight,
            content: None,
        }
    }

    #[tokio::test]
    async fn batch_upload_lists_with_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(Arc::new(config_for(dir.path(), &[]))).unwrap();
        let result = store
            .replace_batch(&UploadBatchParams {
                files: vec![
                    upload("b.txt", Category::Juror, 50),
                    upload("a.txt", Category::Juror, 100),
                    upload("case one.md", Category::Case, 100),
                ],
            })
            .await
            .unwrap();
        assert_eq!(result.uploaded_files.len(), 3);

        let jurors = store.list_artifacts(Category::Juror).await.unwrap();
        assert_eq!(jurors.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(), vec!["a.txt", "b.txt"]);
        assert_eq!(jurors[1].weight, 50);
        let cases = store.list_artifacts(Category::Case).await.unwrap();
        assert_eq!(cases[0].name, "case_one.md");
        assert!(store.path_for(Category::Case, "case_one.md").exists());
    }

    #[tokio::test]
    async fn new_batch_clears_previous_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(Arc::new(config_for(dir.path(), &[]))).unwrap();
        store
            .replace_batch(&UploadBatchParams { files: vec![upload("old.txt", Category::Juror, 100)] })
            .await
            .unwrap();
        store
            .replace_batch(&UploadBatchParams { files: vec![upload("new.txt", Category::Juror, 100)] })
            .await
            .unwrap();
        let names: Vec<String> = store.list_artifacts(Category::Juror).await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["new.txt".to_string()]);
        assert!(store.get_metadata(Category::Juror, "old.txt").await.is_none());
    }

    #[tokio::test]
    async fn referenced_generated_artifact_survives_new_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(Arc::new(config_for(dir.path(), &[]))).unwrap();
        let source = dir.path().join("persona.txt");
        std::fs::write(&source, "generated persona").unwrap();
        let generated = store.import_generated(&source).await.unwrap();
        assert_eq!(generated.origin, Origin::Generated);

        let result = store
            .replace_batch(&UploadBatchParams { files: vec![upload(&generated.name, Category::Juror, 30)] })
            .await
            .unwrap();
        assert_eq!(result.uploaded_files[0].status, "kept");
        let content = std::fs::read_to_string(store.path_for(Category::Juror, &generated.name)).unwrap();
        assert_eq!(content, "generated persona");
        let meta = store.get_metadata(Category::Juror, &generated.name).await.unwrap();
        assert!(meta.generated);
        assert_eq!(meta.weight, 30);

        store.replace_batch(&UploadBatchParams { files: vec![] }).await.unwrap();
        assert!(store.list_artifacts(Category::Juror).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_name_in_both_categories_keeps_separate_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(Arc::new(config_for(dir.path(), &[]))).unwrap();
        store
            .replace_batch(&UploadBatchParams {
                files: vec![upload("a.txt", Category::Juror, 30), upload("a.txt", Category::Case, 70)],
            })
            .await
            .unwrap();

        let jurors = store.list_artifacts(Category::Juror).await.unwrap();
        let cases = store.list_artifacts(Category::Case).await.unwrap();
        assert_eq!(jurors[0].weight, 30);
        assert_eq!(cases[0].weight, 70);
        assert_eq!(store.get_metadata(Category::Juror, "a.txt").await.unwrap().weight, 30);
        assert_eq!(store.get_metadata(Category::Case, "a.txt").await.unwrap().category, Category::Case);
    }

    #[tokio::test]
    async fn generated_juror_is_not_kept_by_a_same_named_case() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(Arc::new(config_for(dir.path(), &[]))).unwrap();
        let source = dir.path().join("persona.txt");
        std::fs::write(&source, "generated persona").unwrap();
        let generated = store.import_generated(&source).await.unwrap();

        let result = store
            .replace_batch(&UploadBatchParams { files: vec![upload(&generated.name, Category::Case, 40)] })
            .await
            .unwrap();
        assert_eq!(result.uploaded_files[0].status, "uploaded");
        assert!(store.list_artifacts(Category::Juror).await.unwrap().is_empty());
        assert!(store.get_metadata(Category::Juror, &generated.name).await.is_none());
        assert_eq!(store.get_metadata(Category::Case, &generated.name).await.unwrap().weight, 40);
    }

    #[tokio::test]
    async fn zero_weight_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(Arc::new(config_for(dir.path(), &[]))).unwrap();
        let err = store
            .replace_batch(&UploadBatchParams { files: vec![upload("a.txt", Category::Juror, 0)] })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn category_parses_plural_and_case_insensitive() {
        assert_eq!("Jurors".parse::<Category>().unwrap(), Category::Juror);
        assert_eq!("CASE".parse::<Category>().unwrap(), Category::Case);
        assert!("witness".parse::<Category>().is_err());
    }
}

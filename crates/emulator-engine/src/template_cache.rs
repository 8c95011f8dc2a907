use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use mapping_template::Template;

use crate::TemplateLoadError;

/// Parsed mapping templates by file path.
///
/// Owned by whoever builds the resolvers; nothing here is process global, so two emulators in
/// the same process never see each other's templates.
#[derive(Debug, Default)]
pub struct TemplateCache {
    templates: DashMap<PathBuf, Arc<Template>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and parses the file on first use.
    pub async fn get_or_load(&self, path: &Path) -> Result<Arc<Template>, TemplateLoadError> {
        if let Some(template) = self.templates.get(path) {
            return Ok(template.clone());
        }

        tracing::debug!(path = %path.display(), "loading mapping template");

        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TemplateLoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let template = Arc::new(Template::parse(name, &source)?);

        // Two concurrent loads of one path both parse; the first insert wins.
        Ok(self
            .templates
            .entry(path.to_path_buf())
            .or_insert(template)
            .clone())
    }

    pub fn insert(&self, path: impl Into<PathBuf>, template: Template) {
        self.templates.insert(path.into(), Arc::new(template));
    }

    /// Forgets one template, for instance after its file changed.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.templates.remove(path).is_some()
    }

    pub fn clear(&self) {
        self.templates.clear();
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

//! Template catalog
//!
//! Scans `<root>/template/*.tmpl` across the data roots. The first root that
//! provides a name wins. Bodies are parsed on first use and cached.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::Template;
use crate::error::{EngineError, Result};
use crate::storage::Storage;

pub const TEMPLATE_DIR: &str = "template";
pub const TEMPLATE_EXT: &str = ".tmpl";

#[derive(Debug)]
struct CatalogEntry {
    root: PathBuf,
    rel_path: String,
}

/// Read-only catalog of template files
#[derive(Debug, Default)]
pub struct TemplateCatalog {
    entries: BTreeMap<String, CatalogEntry>,
    parsed: HashMap<String, Arc<Template>>,
}

impl TemplateCatalog {
    /// Discover template files under each root
    pub async fn load(storage: &dyn Storage, roots: &[PathBuf]) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut readable = 0usize;

        for (idx, root) in roots.iter().enumerate() {
            let dir = root.join(TEMPLATE_DIR);
            let names = match storage.list_dir(&dir).await {
                Ok(names) => names,
                Err(e) => {
                    debug!("Skipping data root #{}: {}", idx, e);
                    continue;
                }
            };
            readable += 1;

            for file in names {
                let Some(name) = file.strip_suffix(TEMPLATE_EXT) else {
                    continue;
                };
                if super::split_name(name).is_none() {
                    warn!("Ignoring template file with malformed name: {}", file);
                    continue;
                }
                entries.entry(name.to_string()).or_insert_with(|| CatalogEntry {
                    root: root.clone(),
                    rel_path: format!("{}/{}", TEMPLATE_DIR, file),
                });
            }
        }

        if readable == 0 {
            return Err(EngineError::Config(
                "no readable template directory in any data root".to_string(),
            ));
        }

        info!("Loaded template catalog: {} templates from {} roots", entries.len(), readable);
        Ok(Self {
            entries,
            parsed: HashMap::new(),
        })
    }

    /// All template names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get a template, parsing it on first access
    pub async fn get(&mut self, storage: &dyn Storage, name: &str) -> Result<Arc<Template>> {
        if let Some(template) = self.parsed.get(name) {
            return Ok(template.clone());
        }

        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| EngineError::Config(format!("unknown template {}", name)))?;

        let text = storage
            .read_string(&entry.root.join(&entry.rel_path))
            .await
            .map_err(|_| EngineError::Config(format!("{}: cannot read template", entry.rel_path)))?
            .ok_or_else(|| EngineError::Config(format!("{}: template disappeared", entry.rel_path)))?;

        let template = Arc::new(Template::parse(name, &entry.rel_path, &text).map_err(EngineError::Config)?);
        debug!("Parsed template {}", entry.rel_path);
        self.parsed.insert(name.to_string(), template.clone());
        Ok(template)
    }
}

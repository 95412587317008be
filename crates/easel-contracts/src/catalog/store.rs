use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use thiserror::Error;

use super::descriptor::{validate, ModelDescriptor};

const DEFAULT_MODELS_JSON: &str = include_str!("../../resources/default_models.json");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("models directory {path} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read-only model reference data, shared by every batch in a process.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelDescriptor>,
}

/// A loaded catalog plus the per-record problems that were tolerated.
#[derive(Debug)]
pub struct CatalogLoad {
    pub catalog: ModelCatalog,
    pub warnings: Vec<String>,
}

impl ModelCatalog {
    /// Built-in descriptors overlaid with one-JSON-file-per-model
    /// records from `dir`. A single bad file is skipped with a
    /// warning; only an unreadable directory is a hard failure.
    pub fn load(dir: Option<&Path>) -> Result<CatalogLoad, CatalogError> {
        let mut warnings = Vec::new();
        let mut models = builtin_models(&mut warnings);

        if let Some(dir) = dir {
            let entries = std::fs::read_dir(dir).map_err(|source| CatalogError::Unreadable {
                path: dir.to_path_buf(),
                source,
            })?;
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
                .collect();
            paths.sort();

            let mut loaded_here: Vec<String> = Vec::new();
            for path in paths {
                match read_descriptor(&path) {
                    Ok(descriptor) => {
                        if loaded_here.contains(&descriptor.id) {
                            warnings.push(format!(
                                "skipping {}: duplicate model id '{}'",
                                path.display(),
                                descriptor.id
                            ));
                            continue;
                        }
                        loaded_here.push(descriptor.id.clone());
                        // Overlaying a built-in id is intentional override.
                        models.insert(descriptor.id.clone(), descriptor);
                    }
                    Err(reason) => {
                        warnings.push(format!("skipping {}: {reason}", path.display()));
                    }
                }
            }
        }

        Ok(CatalogLoad {
            catalog: Self { models },
            warnings,
        })
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

fn builtin_models(warnings: &mut Vec<String>) -> IndexMap<String, ModelDescriptor> {
    let mut models = IndexMap::new();
    let rows: Vec<ModelDescriptor> = match serde_json::from_str(DEFAULT_MODELS_JSON) {
        Ok(rows) => rows,
        Err(err) => {
            warnings.push(format!("built-in model table failed to parse: {err}"));
            return models;
        }
    };
    for descriptor in rows {
        let report = validate(&descriptor);
        if !report.is_valid() {
            warnings.push(format!(
                "skipping built-in '{}': {}",
                descriptor.id,
                report.errors.join("; ")
            ));
            continue;
        }
        models.insert(descriptor.id.clone(), descriptor);
    }
    models
}

fn read_descriptor(path: &Path) -> Result<ModelDescriptor, String> {
    let raw = std::fs::read_to_string(path).map_err(|err| err.to_string())?;
    let descriptor: ModelDescriptor =
        serde_json::from_str(&raw).map_err(|err| format!("invalid descriptor JSON: {err}"))?;
    let report = validate(&descriptor);
    if !report.is_valid() {
        return Err(report.errors.join("; "));
    }
    Ok(descriptor)
}

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::features::{Feature, FeatureFilter, FeatureModel};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feature error: {0}")]
    Feature(#[from] crate::features::FeatureError),
}

#[derive(Debug, Serialize, Deserialize)]
struct FeatureManifest {
    features: Vec<Feature>,
}

/// Write every feature to `path` as `{ "features": [...] }`. The default
/// path matches the persisted-state layout's `feature-requirements.json`.
pub fn export_features(fm: &FeatureModel, path: &Path) -> Result<usize, ExportError> {
    let features = fm.list(&FeatureFilter::default())?;
    let manifest = FeatureManifest {
        features: features.clone(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&manifest)?)?;
    Ok(features.len())
}

pub fn default_export_path(project_dir: &Path) -> std::path::PathBuf {
    project_dir.join("architecture/feature-requirements.json")
}

/// Re-import a manifest written by `export_features`. Existing features with
/// matching ids are left untouched — this restores a feature set into an
/// empty store, it does not merge into a populated one.
pub fn import_features(fm: &FeatureModel, path: &Path) -> Result<usize, ExportError> {
    let raw = std::fs::read_to_string(path)?;
    let manifest: FeatureManifest = serde_json::from_str(&raw)?;
    let mut imported = 0;
    for feature in manifest.features {
        if fm.get(&feature.id).is_ok() {
            continue;
        }
        fm.restore(&feature)?;
        imported += 1;
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn export_writes_manifest_with_feature_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let fm = FeatureModel::new(&store);
        fm.create("A".into(), "core".into(), vec![], vec![], vec![], vec![], String::new(), 0, String::new())
            .unwrap();
        let out = dir.path().join("out.json");
        let count = export_features(&fm, &out).unwrap();
        assert_eq!(count, 1);
        let raw = std::fs::read_to_string(&out).unwrap();
        let manifest: FeatureManifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(manifest.features.len(), 1);
    }

    #[test]
    fn default_export_path_is_under_architecture_dir() {
        let path = default_export_path(Path::new("/proj"));
        assert_eq!(path, Path::new("/proj/architecture/feature-requirements.json"));
    }

    #[test]
    fn export_then_import_preserves_ids_into_fresh_store() {
        let src_dir = tempfile::tempdir().unwrap();
        let src_store = Store::open(src_dir.path()).unwrap();
        let src_fm = FeatureModel::new(&src_store);
        let a = src_fm
            .create("A".into(), "core".into(), vec![], vec![], vec![], vec![], String::new(), 0, String::new())
            .unwrap();
        src_fm
            .create(
                "B".into(),
                "core".into(),
                vec![a.id.clone()],
                vec![],
                vec![],
                vec![],
                String::new(),
                0,
                String::new(),
            )
            .unwrap();

        let out = src_dir.path().join("out.json");
        export_features(&src_fm, &out).unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let dst_store = Store::open(dst_dir.path()).unwrap();
        let dst_fm = FeatureModel::new(&dst_store);
        let imported = import_features(&dst_fm, &out).unwrap();
        assert_eq!(imported, 2);
        assert_eq!(dst_fm.get(&a.id).unwrap().id, a.id);
    }
}

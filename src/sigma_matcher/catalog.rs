//! Catalog loading: recursive directory scan + parallel multi-document YAML
//! parsing, grounded on `load_sigma_rules_local`/`load_yaml_file` in
//! `global_sigma_match_module.py` (thread-pool-per-file there, `rayon` here).

use crate::models::SigmaCatalogEntry;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::warn;

fn walk(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yml") || e.eq_ignore_ascii_case("yaml"))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
}

fn load_one(path: &Path, root: &Path) -> Vec<SigmaCatalogEntry> {
    let relative_path = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "failed to read Sigma rule file");
            return Vec::new();
        }
    };

    let mut entries = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        match serde_yaml::Value::deserialize(doc) {
            Ok(value) if value.get("title").is_some() => {
                entries.push(SigmaCatalogEntry {
                    file_path: path.to_string_lossy().to_string(),
                    relative_path: relative_path.clone(),
                    rule: value,
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(file = %path.display(), error = %e, "YAML syntax error in Sigma rule file");
            }
        }
    }
    entries
}

/// Recursively scans `root` for `*.yml`/`*.yaml`, parsing every file (and
/// every document inside multi-document files) in parallel. Files that fail
/// to read or parse are logged and skipped rather than aborting the load.
pub fn load_catalog(root: &str) -> Vec<SigmaCatalogEntry> {
    use serde::Deserialize;
    let root_path = Path::new(root);
    let mut files = Vec::new();
    walk(root_path, &mut files);

    files
        .par_iter()
        .flat_map(|path| load_one(path, root_path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_single_document_rule() {
        let dir = std::env::temp_dir().join("perseptor_sigma_test_single_doc");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("rule.yml");
        std::fs::File::create(&file)
            .unwrap()
            .write_all(b"title: Test Rule\nlogsource:\n  category: process_creation\ndetection:\n  selection:\n    CommandLine|contains: whoami\n  condition: selection\n")
            .unwrap();

        let catalog = load_catalog(dir.to_str().unwrap());
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].rule.get("title").unwrap().as_str().unwrap(), "Test Rule");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn skips_documents_without_a_title() {
        let dir = std::env::temp_dir().join("perseptor_sigma_test_untitled");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("untitled.yml");
        std::fs::File::create(&file).unwrap().write_all(b"foo: bar\n").unwrap();

        let catalog = load_catalog(dir.to_str().unwrap());
        assert!(catalog.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}

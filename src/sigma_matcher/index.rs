//! Multi-signal inverted index over a loaded Sigma catalog (spec.md 4.10,
//! "Index construction"). Built once per catalog root and cached behind a
//! process-wide single slot, replaced atomically on reload.

use crate::models::SigmaCatalogEntry;
use regex::Regex;
use serde_yaml::Value as Yaml;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use parking_lot::Mutex;

fn keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9\-\.:;\\/_]+").unwrap())
}

fn technique_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^attack\.(t\d{4}(?:\.\d{3})?)$").unwrap())
}

fn is_stopword_or_short(token: &str) -> bool {
    token.len() < 3 || crate::sigma_matcher::signals::stopwords().contains(token)
}

/// Recurses through a YAML value, collecting tokens from string VALUES only
/// (never map keys -- those are Sigma field names, not indicators).
fn collect_value_tokens(value: &Yaml, keywords: &mut Vec<String>, phrases: &mut HashSet<String>) {
    match value {
        Yaml::Mapping(map) => {
            for (_, v) in map {
                collect_value_tokens(v, keywords, phrases);
            }
        }
        Yaml::Sequence(seq) => {
            for v in seq {
                collect_value_tokens(v, keywords, phrases);
            }
        }
        Yaml::String(s) => {
            let trimmed = s.trim();
            if trimmed.contains(' ') && trimmed.len() > 3 {
                phrases.insert(trimmed.to_lowercase());
            }
            for m in keyword_re().find_iter(s) {
                let token = m.as_str().to_lowercase();
                if !is_stopword_or_short(&token) {
                    keywords.push(token);
                }
            }
        }
        Yaml::Number(n) => {
            keywords.push(n.to_string());
        }
        _ => {}
    }
}

pub struct SigmaIndex {
    pub catalog: Vec<SigmaCatalogEntry>,
    pub keyword_index: HashMap<String, HashSet<usize>>,
    pub rule_keywords: Vec<HashSet<String>>,
    pub rule_phrases: Vec<HashSet<String>>,
    pub technique_index: HashMap<String, HashSet<usize>>,
    pub logsource_index: HashMap<String, HashSet<usize>>,
    pub rule_status: Vec<String>,
    pub rule_level: Vec<String>,
    pub doc_freq: HashMap<String, usize>,
}

impl SigmaIndex {
    pub fn rule_categories(&self, idx: usize) -> (String, String) {
        let rule = &self.catalog[idx].rule;
        let logsource = rule.get("logsource");
        let category = logsource
            .and_then(|l| l.get("category"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let product = logsource
            .and_then(|l| l.get("product"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        (category, product)
    }
}

pub fn build_index(catalog: Vec<SigmaCatalogEntry>) -> SigmaIndex {
    let n = catalog.len();
    let mut keyword_index: HashMap<String, HashSet<usize>> = HashMap::new();
    let mut rule_keywords = Vec::with_capacity(n);
    let mut rule_phrases = Vec::with_capacity(n);
    let mut technique_index: HashMap<String, HashSet<usize>> = HashMap::new();
    let mut logsource_index: HashMap<String, HashSet<usize>> = HashMap::new();
    let mut rule_status = Vec::with_capacity(n);
    let mut rule_level = Vec::with_capacity(n);

    for (idx, entry) in catalog.iter().enumerate() {
        let detection = entry.rule.get("detection");
        let mut keywords = Vec::new();
        let mut phrases = HashSet::new();
        if let Some(detection) = detection {
            collect_value_tokens(detection, &mut keywords, &mut phrases);
        }
        let unique_keywords: HashSet<String> = keywords.into_iter().collect();
        for kw in &unique_keywords {
            keyword_index.entry(kw.clone()).or_default().insert(idx);
        }
        rule_keywords.push(unique_keywords);
        rule_phrases.push(phrases);

        if let Some(Yaml::Sequence(tags)) = entry.rule.get("tags") {
            for tag in tags {
                if let Some(tag_str) = tag.as_str() {
                    if let Some(caps) = technique_tag_re().captures(tag_str) {
                        let full_id = caps[1].to_uppercase();
                        technique_index.entry(full_id.clone()).or_default().insert(idx);
                        if let Some((parent, _)) = full_id.split_once('.') {
                            technique_index.entry(parent.to_string()).or_default().insert(idx);
                        }
                    }
                }
            }
        }

        let (category, product) = {
            let logsource = entry.rule.get("logsource");
            let category = logsource.and_then(|l| l.get("category")).and_then(|v| v.as_str()).unwrap_or("").to_lowercase();
            let product = logsource.and_then(|l| l.get("product")).and_then(|v| v.as_str()).unwrap_or("").to_lowercase();
            (category, product)
        };
        if !category.is_empty() {
            if !product.is_empty() {
                logsource_index.entry(format!("{category}:{product}")).or_default().insert(idx);
            }
            logsource_index.entry(format!("{category}:*")).or_default().insert(idx);
        }

        let status = entry.rule.get("status").and_then(|v| v.as_str()).unwrap_or("experimental").to_string();
        let level = entry.rule.get("level").and_then(|v| v.as_str()).unwrap_or("medium").to_string();
        rule_status.push(status);
        rule_level.push(level);
    }

    let mut doc_freq: HashMap<String, usize> = HashMap::new();
    for kw_set in &rule_keywords {
        for kw in kw_set {
            *doc_freq.entry(kw.clone()).or_insert(0) += 1;
        }
    }

    SigmaIndex {
        catalog,
        keyword_index,
        rule_keywords,
        rule_phrases,
        technique_index,
        logsource_index,
        rule_status,
        rule_level,
        doc_freq,
    }
}

type CacheSlot = Mutex<Option<(String, Arc<SigmaIndex>)>>;

fn cache_slot() -> &'static CacheSlot {
    static SLOT: OnceLock<CacheSlot> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

/// Returns the prebuilt index for `root`, rebuilding (and replacing the
/// single cached slot) only when the root path changed since the last call.
pub fn get_or_build_index(root: &str) -> Arc<SigmaIndex> {
    let mut slot = cache_slot().lock();
    if let Some((cached_root, index)) = slot.as_ref() {
        if cached_root == root {
            return Arc::clone(index);
        }
    }
    let catalog = super::catalog::load_catalog(root);
    let index = Arc::new(build_index(catalog));
    *slot = Some((root.to_string(), Arc::clone(&index)));
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SigmaCatalogEntry;

    fn rule(yaml: &str) -> SigmaCatalogEntry {
        SigmaCatalogEntry {
            file_path: "test.yml".to_string(),
            relative_path: "test.yml".to_string(),
            rule: serde_yaml::from_str(yaml).unwrap(),
        }
    }

    #[test]
    fn indexes_detection_values_not_keys() {
        let catalog = vec![rule(
            "title: T\ndetection:\n  selection:\n    CommandLine|contains: mimikatz\n  condition: selection\n",
        )];
        let index = build_index(catalog);
        assert!(index.keyword_index.contains_key("mimikatz"));
        assert!(!index.keyword_index.contains_key("commandline"));
    }

    #[test]
    fn technique_tag_indexes_parent_and_full_id() {
        let catalog = vec![rule(
            "title: T\ntags:\n  - attack.t1059.001\ndetection:\n  selection:\n    Image|contains: powershell\n  condition: selection\n",
        )];
        let index = build_index(catalog);
        assert!(index.technique_index.contains_key("T1059.001"));
        assert!(index.technique_index.contains_key("T1059"));
    }

    #[test]
    fn logsource_index_has_exact_and_wildcard_keys() {
        let catalog = vec![rule(
            "title: T\nlogsource:\n  category: process_creation\n  product: windows\ndetection:\n  selection:\n    Image|contains: cmd\n  condition: selection\n",
        )];
        let index = build_index(catalog);
        assert!(index.logsource_index.contains_key("process_creation:windows"));
        assert!(index.logsource_index.contains_key("process_creation:*"));
    }

    #[test]
    fn defaults_status_and_level_when_absent() {
        let catalog = vec![rule(
            "title: T\ndetection:\n  selection:\n    Image|contains: cmd\n  condition: selection\n",
        )];
        let index = build_index(catalog);
        assert_eq!(index.rule_status[0], "experimental");
        assert_eq!(index.rule_level[0], "medium");
    }
}

//! Candidate union, four-signal scoring, filtering and ranking (spec.md
//! 4.10, "Per-candidate scoring" through "Output shape").

use super::index::SigmaIndex;
use super::signals::ReportSignals;
use crate::models::{ScoreBreakdown, SigmaMatchResult};
use std::collections::HashSet;

const BLOCKLIST_PREFIXES: &[&str] = &["selection", "filter"];
const BLOCKLIST_EXACT: &[&str] = &[
    "detection", "condition", "image", "commandline", "parentimage", "parentcommandline",
    "targetfilename", "targetobject", "destinationip", "queryname", "requesturl", "eventid",
    "logsource", "category", "product", "service", "hashes", "originalfilename",
];

fn is_structural_token(token: &str) -> bool {
    let lower = token.to_lowercase();
    BLOCKLIST_EXACT.contains(&lower.as_str())
        || BLOCKLIST_PREFIXES.iter().any(|p| lower.starts_with(p))
}

fn confidence_label(score: f64) -> &'static str {
    if score >= 80.0 {
        "Direct Hit"
    } else if score >= 60.0 {
        "Strong Match"
    } else if score >= 40.0 {
        "Relevant"
    } else {
        "Related"
    }
}

fn quality_factor(status: &str) -> f64 {
    match status {
        "stable" => 1.15,
        "test" => 1.0,
        _ => 0.85,
    }
}

fn fuzzy_matches(signal_kw: &str, rule_kw: &str) -> bool {
    if signal_kw == rule_kw {
        return true;
    }
    if signal_kw.len() >= 4 && rule_kw.len() >= 4 && (signal_kw.contains(rule_kw) || rule_kw.contains(signal_kw)) {
        return true;
    }
    if signal_kw.len() == rule_kw.len() && signal_kw.len() >= 4 {
        let matches = signal_kw.chars().zip(rule_kw.chars()).filter(|(a, b)| a == b).count();
        return (matches as f64 / signal_kw.len() as f64) >= 0.8;
    }
    false
}

fn mitre_score(rule_techniques: &HashSet<&String>, signals: &ReportSignals) -> f64 {
    if rule_techniques.iter().any(|t| signals.techniques.contains(t.as_str())) {
        1.0
    } else {
        0.0
    }
}

fn logsource_score(category: &str, signals: &ReportSignals) -> f64 {
    if !category.is_empty() && signals.logsource_categories.contains(category) {
        1.0
    } else {
        0.0
    }
}

fn ioc_field_score(index: &SigmaIndex, idx: usize, signals: &ReportSignals) -> f64 {
    if signals.ioc_values.is_empty() {
        return 0.0;
    }
    let denom = signals.ioc_values.len().min(5) as f64;
    let keywords = &index.rule_keywords[idx];
    let phrases = &index.rule_phrases[idx];

    let hits = signals
        .ioc_values
        .iter()
        .filter(|ioc| {
            keywords.iter().any(|k| k.contains(ioc.as_str()) || ioc.contains(k.as_str()))
                || phrases.iter().any(|p| p.contains(ioc.as_str()) || ioc.contains(p.as_str()))
        })
        .count();

    if hits == 0 {
        0.0
    } else {
        (hits as f64 / denom).min(1.0)
    }
}

struct KeywordMatch {
    ratio: f64,
    tfidf: f64,
    matched: Vec<String>,
    matched_phrases: Vec<String>,
}

fn keyword_match(index: &SigmaIndex, idx: usize, signals: &ReportSignals, total_rules: usize) -> KeywordMatch {
    let rule_keywords = &index.rule_keywords[idx];
    let rule_phrases = &index.rule_phrases[idx];

    let mut matched: HashSet<String> = HashSet::new();
    for sig_kw in &signals.keywords {
        for rule_kw in rule_keywords {
            if fuzzy_matches(sig_kw, rule_kw) {
                matched.insert(rule_kw.clone());
                break;
            }
        }
    }
    let mut matched_phrases = Vec::new();
    for phrase in rule_phrases {
        // phrase matching happens against the raw report text in the caller;
        // here we approximate with keyword-set membership of every token.
        let tokens: Vec<&str> = phrase.split_whitespace().collect();
        if !tokens.is_empty() && tokens.iter().all(|t| signals.keywords.contains(*t)) {
            matched_phrases.push(phrase.clone());
        }
    }

    let denom = (rule_keywords.len() + rule_phrases.len()).max(1) as f64;
    let ratio = (matched.len() + matched_phrases.len()) as f64 / denom;

    let tfidf_sum: f64 = matched
        .iter()
        .map(|kw| {
            let df = index.doc_freq.get(kw).copied().unwrap_or(1).max(1);
            ((total_rules as f64 + 1.0) / (df as f64 + 1.0)).ln().max(0.0)
        })
        .sum();
    let normalizer = ((total_rules as f64 + 1.0).ln() * matched.len().max(1) as f64).max(1.0);
    let tfidf = (tfidf_sum / normalizer).min(1.0);

    KeywordMatch {
        ratio,
        tfidf,
        matched: matched.into_iter().collect(),
        matched_phrases,
    }
}

fn upstream_url(base_url: &str, entry: &crate::models::SigmaCatalogEntry) -> String {
    let category = entry.rule.get("logsource").and_then(|l| l.get("category")).and_then(|v| v.as_str());
    let product = entry.rule.get("logsource").and_then(|l| l.get("product")).and_then(|v| v.as_str());

    if let (Some(category), Some(product)) = (category, product) {
        return format!(
            "{base_url}/rules/{product}/{category}/{}",
            entry.relative_path
        );
    }

    const PREFIX_TABLE: &[(&str, &str)] = &[
        ("proc_creation_win_", "rules/windows/process_creation"),
        ("file_event_win_", "rules/windows/file_event"),
        ("registry_set_win_", "rules/windows/registry_set"),
        ("net_connection_win_", "rules/windows/network_connection"),
        ("dns_query_win_", "rules/windows/dns_query"),
    ];
    let filename = entry.relative_path.rsplit('/').next().unwrap_or(&entry.relative_path);
    for (prefix, path) in PREFIX_TABLE {
        if filename.starts_with(prefix) {
            return format!("{base_url}/{path}/{}", entry.relative_path);
        }
    }
    format!("{base_url}/{}", entry.relative_path)
}

/// Scores every candidate rule against `signals`, filters by threshold and
/// display-worthy-keyword count, sorts descending, and returns the top `k`.
pub fn score_and_rank(
    index: &SigmaIndex,
    signals: &ReportSignals,
    base_url: &str,
    threshold: f64,
    top_k: usize,
) -> Vec<SigmaMatchResult> {
    let total_rules = index.catalog.len().max(1);

    let mut candidate_indices: HashSet<usize> = HashSet::new();
    for tid in &signals.techniques {
        if let Some(hits) = index.technique_index.get(tid) {
            candidate_indices.extend(hits.iter().copied());
        }
    }
    for cat in &signals.logsource_categories {
        for key in index.logsource_index.keys() {
            if key.starts_with(&format!("{cat}:")) {
                candidate_indices.extend(index.logsource_index[key].iter().copied());
            }
        }
    }
    for kw in &signals.keywords {
        if let Some(hits) = index.keyword_index.get(kw) {
            candidate_indices.extend(hits.iter().copied());
        }
    }

    let mut results: Vec<SigmaMatchResult> = Vec::new();

    for idx in candidate_indices {
        let entry = &index.catalog[idx];
        let (category, _product) = index.rule_categories(idx);

        let rule_technique_ids: HashSet<&String> = index
            .technique_index
            .iter()
            .filter(|(_, hits)| hits.contains(&idx))
            .map(|(id, _)| id)
            .collect();

        let mitre = mitre_score(&rule_technique_ids, signals);
        let logsource = logsource_score(&category, signals);
        let ioc_field = ioc_field_score(index, idx, signals);
        let km = keyword_match(index, idx, signals, total_rules);
        let keyword = 0.5 * km.ratio + 0.5 * km.tfidf;

        let status = &index.rule_status[idx];
        let raw = mitre * 40.0 + ioc_field * 25.0 + logsource * 15.0 + keyword * 20.0;
        let combined = (raw * quality_factor(status)).min(100.0);

        if combined < threshold {
            continue;
        }

        let display_keywords: Vec<String> = km
            .matched
            .iter()
            .filter(|k| !is_structural_token(k))
            .cloned()
            .collect();
        if display_keywords.len() + km.matched_phrases.len() < 3 {
            continue;
        }

        let title = entry.rule.get("title").and_then(|v| v.as_str()).unwrap_or("Untitled Sigma Rule").to_string();
        let description = entry.rule.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let id = entry.rule.get("id").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let tags: Vec<String> = entry
            .rule
            .get("tags")
            .and_then(|v| v.as_sequence())
            .map(|seq| seq.iter().filter_map(|t| t.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let (logsource_category, logsource_product) = index.rule_categories(idx);

        results.push(SigmaMatchResult {
            id,
            title,
            description,
            level: index.rule_level[idx].clone(),
            status: status.clone(),
            combined_score: combined,
            match_ratio: combined,
            confidence_label: confidence_label(combined).to_string(),
            matched_keywords: display_keywords,
            phrase_matches: km.matched_phrases,
            tags,
            logsource_category,
            logsource_product,
            score_breakdown: ScoreBreakdown {
                mitre: mitre * 40.0,
                ioc_field: ioc_field * 25.0,
                logsource: logsource * 15.0,
                keyword: keyword * 20.0,
            },
            upstream_url: upstream_url(base_url, entry),
        });
    }

    results.sort_by(|a, b| b.combined_score.partial_cmp(&a.combined_score).unwrap_or(std::cmp::Ordering::Equal));
    let mut seen_ids = HashSet::new();
    results.retain(|r| seen_ids.insert(r.id.clone()));
    results.truncate(top_k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IoCBundle, Ttp};
    use crate::sigma_matcher::index::build_index;
    use crate::sigma_matcher::signals::build_report_signals;
    use crate::models::SigmaCatalogEntry;

    fn rule(yaml: &str) -> SigmaCatalogEntry {
        SigmaCatalogEntry {
            file_path: "test.yml".to_string(),
            relative_path: "windows/process_creation/proc_creation_win_mimikatz.yml".to_string(),
            rule: serde_yaml::from_str(yaml).unwrap(),
        }
    }

    #[test]
    fn strong_mitre_and_ioc_overlap_surfaces_a_direct_hit() {
        let catalog = vec![rule(
            "title: Mimikatz Credential Dumping\ndescription: Detects mimikatz usage\ntags:\n  - attack.t1003\nlogsource:\n  category: process_creation\n  product: windows\ndetection:\n  selection:\n    CommandLine|contains:\n      - mimikatz\n      - sekurlsa::logonpasswords\n      - lsadump\n  condition: selection\n",
        )];
        let index = build_index(catalog);

        let mut bundle = IoCBundle::default();
        bundle.ttps.push(Ttp {
            mitre_id: "T1003".to_string(),
            technique_name: "OS Credential Dumping".to_string(),
            description: String::new(),
        });
        bundle
            .indicators_of_compromise
            .insert("malicious_commands".to_string(), vec!["sekurlsa::logonpasswords".to_string()]);

        let signals = build_report_signals(&bundle, &[], "attacker ran mimikatz sekurlsa logonpasswords lsadump");
        let results = score_and_rank(&index, &signals, "https://example.com", 25.0, 15);

        assert_eq!(results.len(), 1);
        assert!(results[0].combined_score > 40.0);
    }

    #[test]
    fn unrelated_report_produces_no_matches() {
        let catalog = vec![rule(
            "title: Mimikatz Credential Dumping\ntags:\n  - attack.t1003\nlogsource:\n  category: process_creation\n  product: windows\ndetection:\n  selection:\n    CommandLine|contains: mimikatz\n  condition: selection\n",
        )];
        let index = build_index(catalog);
        let bundle = IoCBundle::default();
        let signals = build_report_signals(&bundle, &[], "a quiet afternoon with no security events");
        let results = score_and_rank(&index, &signals, "https://example.com", 25.0, 15);
        assert!(results.is_empty());
    }

    #[test]
    fn results_are_capped_at_top_k() {
        let mut catalog = Vec::new();
        for i in 0..5 {
            catalog.push(rule(&format!(
                "title: Rule {i}\ntags:\n  - attack.t1003\nlogsource:\n  category: process_creation\n  product: windows\ndetection:\n  selection:\n    CommandLine|contains:\n      - mimikatz\n      - lsadump\n      - sekurlsa\n  condition: selection\n"
            )));
        }
        let index = build_index(catalog);
        let mut bundle = IoCBundle::default();
        bundle.ttps.push(Ttp {
            mitre_id: "T1003".to_string(),
            technique_name: "OS Credential Dumping".to_string(),
            description: String::new(),
        });
        let signals = build_report_signals(&bundle, &[], "mimikatz lsadump sekurlsa");
        let results = score_and_rank(&index, &signals, "https://example.com", 0.0, 2);
        assert!(results.len() <= 2);
    }
}

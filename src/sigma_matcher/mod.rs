//! Sigma catalog matcher (C12): loads a large offline catalog of Sigma
//! rules, builds a multi-signal inverted index, and ranks candidates
//! against a report's IoCs/TTPs/text using four weighted signals
//! (spec.md 4.10). Grounded on `global_sigma_match_module.py`'s
//! catalog-loading and keyword-extraction approach; the weighted scoring
//! combinator itself is the newer design spec.md 4.10 specifies in place
//! of that module's flat match-ratio threshold.

pub mod catalog;
pub mod index;
pub mod scoring;
pub mod signals;

use crate::models::{IoCBundle, MitreTechnique, SigmaMatchResult};

/// End-to-end entry point used by the orchestrator's stage S3: loads (or
/// reuses the cached) index for `rules_dir`, builds report signals, and
/// returns the ranked, filtered, deduped top-`top_k` matches.
pub fn match_report_against_catalog(
    rules_dir: &str,
    bundle: &IoCBundle,
    mitre_techniques: &[MitreTechnique],
    report_text: &str,
    base_url: &str,
    threshold: f64,
    top_k: usize,
) -> Vec<SigmaMatchResult> {
    let index = index::get_or_build_index(rules_dir);
    let signals = signals::build_report_signals(bundle, mitre_techniques, &report_text.to_lowercase());
    scoring::score_and_rank(&index, &signals, base_url, threshold, top_k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn end_to_end_match_against_a_small_catalog() {
        let dir = std::env::temp_dir().join("perseptor_sigma_matcher_e2e");
        std::fs::create_dir_all(&dir).unwrap();
        let mut f = std::fs::File::create(dir.join("mimikatz.yml")).unwrap();
        f.write_all(
            b"title: Mimikatz Usage\ntags:\n  - attack.t1003\nlogsource:\n  category: process_creation\n  product: windows\ndetection:\n  selection:\n    CommandLine|contains:\n      - mimikatz\n      - sekurlsa::logonpasswords\n      - lsadump\n  condition: selection\n",
        )
        .unwrap();

        let mut bundle = IoCBundle::default();
        bundle.ttps.push(crate::models::Ttp {
            mitre_id: "T1003".to_string(),
            technique_name: "OS Credential Dumping".to_string(),
            description: String::new(),
        });
        bundle
            .indicators_of_compromise
            .insert("malicious_commands".to_string(), vec!["sekurlsa::logonpasswords".to_string()]);

        let results = match_report_against_catalog(
            dir.to_str().unwrap(),
            &bundle,
            &[],
            "attacker ran mimikatz sekurlsa logonpasswords lsadump",
            "https://example.com",
            25.0,
            15,
        );

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Mimikatz Usage");
        std::fs::remove_dir_all(&dir).ok();
    }
}

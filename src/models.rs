//! Core data model (§3): the entities that flow through the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The nine closed-set IoC categories. Order matters only for iteration
/// determinism in generators; the set itself is what §8 calls "closed".
pub const IOC_CATEGORIES: &[&str] = &[
    "ips",
    "domains",
    "urls",
    "email_addresses",
    "file_hashes",
    "filenames",
    "registry_keys",
    "process_names",
    "malicious_commands",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl Default for ConfidenceLevel {
    fn default() -> Self {
        ConfidenceLevel::Medium
    }
}

impl ConfidenceLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "high" => Some(ConfidenceLevel::High),
            "medium" => Some(ConfidenceLevel::Medium),
            "low" => Some(ConfidenceLevel::Low),
            _ => None,
        }
    }
}

/// Which vendor to talk to, and how to authenticate. `api_key` is opaque to
/// the core: it's handed straight to the provider implementation.
#[derive(Debug, Clone)]
pub struct ProviderSelector {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub api_key: String,
}

/// A request to analyze one threat report. Immutable after construction.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub source_ref: String,
    pub extracted_text: String,
    pub image_ocr_text: String,
    pub provider_selector: ProviderSelector,
}

/// Minimum combined-text length (§3, §7) before the pipeline may start.
pub const MIN_EXTRACTED_TEXT_LEN: usize = 50;

impl AnalysisRequest {
    pub fn combined_text(&self) -> String {
        if self.image_ocr_text.is_empty() {
            self.extracted_text.clone()
        } else {
            format!("{}\n{}", self.extracted_text, self.image_ocr_text)
        }
    }

    /// §7: pre-stage validation. Only failures here prevent the pipeline
    /// from starting; everything after this point is absorbed into empty
    /// stage defaults.
    pub fn validate(&self) -> Result<(), String> {
        if self.combined_text().trim().len() < MIN_EXTRACTED_TEXT_LEN {
            return Err(format!(
                "extracted text must be at least {MIN_EXTRACTED_TEXT_LEN} characters"
            ));
        }
        Ok(())
    }
}

// ─── Provider abstraction types (§3, §4.1) ────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub latency_ms: f64,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Flagship,
    Efficient,
    Reasoning,
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub provider: &'static str,
    pub model_id: &'static str,
    pub display_name: &'static str,
    pub tier: ModelTier,
    pub max_tokens: u32,
    pub supports_streaming: bool,
    pub supports_temperature: bool,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
}

// ─── IoC / TTP extraction (§3) ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ttp {
    pub mitre_id: String,
    pub technique_name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoCBundle {
    /// Always contains exactly `IOC_CATEGORIES`, possibly empty, after validation.
    pub indicators_of_compromise: BTreeMap<String, Vec<String>>,
    pub ttps: Vec<Ttp>,
    pub threat_actors: Vec<String>,
    pub tools_or_malware: Vec<String>,
    pub campaigns: Vec<String>,
    pub cves: Vec<String>,
    pub suspicious_patterns: Vec<String>,
    pub process_chains: Vec<String>,
    pub confidence_level: ConfidenceLevel,
    pub notes: String,
}

impl Default for IoCBundle {
    fn default() -> Self {
        let mut indicators_of_compromise = BTreeMap::new();
        for cat in IOC_CATEGORIES {
            indicators_of_compromise.insert(cat.to_string(), Vec::new());
        }
        Self {
            indicators_of_compromise,
            ttps: Vec::new(),
            threat_actors: Vec::new(),
            tools_or_malware: Vec::new(),
            campaigns: Vec::new(),
            cves: Vec::new(),
            suspicious_patterns: Vec::new(),
            process_chains: Vec::new(),
            confidence_level: ConfidenceLevel::Medium,
            notes: String::new(),
        }
    }
}

impl IoCBundle {
    pub fn category(&self, name: &str) -> &[String] {
        self.indicators_of_compromise
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.indicators_of_compromise.values().all(|v| v.is_empty())
    }

    pub fn total_ioc_count(&self) -> usize {
        self.indicators_of_compromise.values().map(|v| v.len()).sum()
    }
}

// ─── MITRE ATT&CK (§3, C8) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MitreSource {
    AiExtracted,
    KeywordMatch,
}

impl MitreSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MitreSource::AiExtracted => "ai_extracted",
            MitreSource::KeywordMatch => "keyword_match",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MitreTechnique {
    pub technique_id: String,
    pub technique_name: String,
    pub tactic: String,
    pub confidence: f64,
    pub source: MitreSource,
    pub description: String,
}

// ─── Generated Sigma rule (§3, C10) ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigmaLevel {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl SigmaLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigmaLevel::Informational => "informational",
            SigmaLevel::Low => "low",
            SigmaLevel::Medium => "medium",
            SigmaLevel::High => "high",
            SigmaLevel::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "informational" => Some(SigmaLevel::Informational),
            "low" => Some(SigmaLevel::Low),
            "medium" => Some(SigmaLevel::Medium),
            "high" => Some(SigmaLevel::High),
            "critical" => Some(SigmaLevel::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSource {
    pub category: String,
    pub product: String,
    pub service: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeneratedSigmaRule {
    pub title: String,
    pub id: String,
    pub status: String,
    pub description: String,
    pub references: Vec<String>,
    pub author: String,
    pub date: String,
    /// Always `attack.<tactic>` / `attack.<tid>`, always lowercase (§8).
    pub tags: Vec<String>,
    pub logsource: LogSource,
    /// One or more named selection blocks plus `condition`.
    pub detection: serde_yaml::Mapping,
    pub fields: Vec<String>,
    pub falsepositives: Vec<String>,
    pub level: SigmaLevel,
}

// ─── Sigma catalog / matcher (§3, C12) ─────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SigmaCatalogEntry {
    pub file_path: String,
    pub relative_path: String,
    pub rule: serde_yaml::Value,
}

#[derive(Debug, Clone)]
pub struct SigmaMatchResult {
    pub id: String,
    pub title: String,
    pub description: String,
    pub level: String,
    pub status: String,
    pub combined_score: f64,
    pub match_ratio: f64,
    pub confidence_label: String,
    pub matched_keywords: Vec<String>,
    pub phrase_matches: Vec<String>,
    pub tags: Vec<String>,
    pub logsource_category: String,
    pub logsource_product: String,
    pub score_breakdown: ScoreBreakdown,
    pub upstream_url: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreBreakdown {
    pub mitre: f64,
    pub ioc_field: f64,
    pub logsource: f64,
    pub keyword: f64,
}

// ─── Atomic Red Team style scenarios (§3) ──────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtomicExecutor {
    #[serde(rename = "type")]
    pub executor_type: String,
    pub steps: String,
    pub command: String,
    pub elevation_required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedDetection {
    pub log_source: String,
    pub event_ids: Vec<String>,
    pub key_fields: Vec<String>,
    pub sigma_condition_match: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cleanup {
    pub command: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtomicTest {
    pub sigma_rule_title: String,
    pub test_name: String,
    pub description: String,
    pub mitre_technique: String,
    pub platforms: Vec<String>,
    pub privilege_required: String,
    pub prerequisites: Vec<String>,
    pub executor: AtomicExecutor,
    pub expected_detection: ExpectedDetection,
    pub cleanup: Cleanup,
    pub real_world_reference: String,
    pub safety_notes: String,
}

// ─── SIEM queries (§3, §6, C11) ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiemQueryBlock {
    pub description: String,
    pub query: String,
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiemQueries {
    pub splunk: SiemQueryBlock,
    pub qradar: SiemQueryBlock,
    pub elastic: SiemQueryBlock,
    pub sentinel: SiemQueryBlock,
}

// ─── Aggregated result (§6) ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisDataSummary {
    pub indicators_of_compromise: BTreeMap<String, Vec<String>>,
    pub ttps: Vec<Ttp>,
    pub threat_actors: Vec<String>,
    pub tools_or_malware: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MitreMappingSummary {
    pub techniques: Vec<SerializableMitreTechnique>,
    pub tactic_summary: BTreeMap<String, u32>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerializableMitreTechnique {
    pub technique_id: String,
    pub technique_name: String,
    pub tactic: String,
    pub confidence: f64,
    pub source: String,
    pub description: String,
}

impl From<&MitreTechnique> for SerializableMitreTechnique {
    fn from(t: &MitreTechnique) -> Self {
        Self {
            technique_id: t.technique_id.clone(),
            technique_name: t.technique_name.clone(),
            tactic: t.tactic.clone(),
            confidence: t.confidence,
            source: t.source.as_str().to_string(),
            description: t.description.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct YaraRuleOutput {
    pub name: String,
    pub description: String,
    pub rule: String,
    pub severity: String,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IocSigmaRuleOutput {
    pub title: String,
    pub rule_yaml: String,
    pub category: String,
    pub level: String,
    pub tags: Vec<String>,
    pub ioc_type: String,
    pub ioc_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SigmaMatchOutput {
    pub id: String,
    pub title: String,
    pub description: String,
    pub level: String,
    pub status: String,
    pub combined_score: f64,
    pub match_ratio: f64,
    pub confidence_label: String,
    pub matched_keywords: Vec<String>,
    pub phrase_matches: Vec<String>,
    pub tags: Vec<String>,
    pub upstream_url: String,
}

impl From<&SigmaMatchResult> for SigmaMatchOutput {
    fn from(m: &SigmaMatchResult) -> Self {
        Self {
            id: m.id.clone(),
            title: m.title.clone(),
            description: m.description.clone(),
            level: m.level.clone(),
            status: m.status.clone(),
            combined_score: m.combined_score,
            match_ratio: m.match_ratio,
            confidence_label: m.confidence_label.clone(),
            matched_keywords: m.matched_keywords.clone(),
            phrase_matches: m.phrase_matches.clone(),
            tags: m.tags.clone(),
            upstream_url: m.upstream_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub threat_summary: String,
    pub analysis_data: AnalysisDataSummary,
    pub mitre_mapping: MitreMappingSummary,
    pub yara_rules: Vec<YaraRuleOutput>,
    pub ioc_sigma_rules: Vec<IocSigmaRuleOutput>,
    pub generated_sigma_rules: String,
    pub siem_queries: SiemQueries,
    pub atomic_tests: Vec<AtomicTest>,
    pub sigma_matches: Vec<SigmaMatchOutput>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ioc_bundle_has_every_category() {
        let bundle = IoCBundle::default();
        for cat in IOC_CATEGORIES {
            assert!(bundle.indicators_of_compromise.contains_key(*cat));
        }
        assert!(bundle.is_empty());
    }

    #[test]
    fn combined_text_joins_ocr_when_present() {
        let req = AnalysisRequest {
            source_ref: "https://example.com".into(),
            extracted_text: "report body".into(),
            image_ocr_text: "ocr text".into(),
            provider_selector: ProviderSelector {
                provider_id: None,
                model_id: None,
                api_key: "sk-test".into(),
            },
        };
        assert_eq!(req.combined_text(), "report body\nocr text");
    }

    #[test]
    fn validate_rejects_short_text() {
        let req = AnalysisRequest {
            source_ref: "https://example.com".into(),
            extracted_text: "too short".into(),
            image_ocr_text: "".into(),
            provider_selector: ProviderSelector {
                provider_id: None,
                model_id: None,
                api_key: "sk-test".into(),
            },
        };
        assert!(req.validate().is_err());
    }
}

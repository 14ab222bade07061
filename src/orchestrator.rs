//! Pipeline orchestrator (C13): shared stage logic for both the synchronous
//! and streaming entry points, grounded on
//! `modules/pipeline/orchestrator.py`'s `run_analysis_pipeline_sync` /
//! `run_analysis_pipeline_stream` (same five-stage shape, same per-stage
//! timeouts and empty-default-on-failure policy), reimplemented with
//! `tokio::join!` in place of `ThreadPoolExecutor`.

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::PerseptorError;
use crate::models::{
    AnalysisDataSummary, AnalysisRequest, AnalysisResult, AtomicTest, IoCBundle,
    MitreMappingSummary, Message, ProviderSelector, SerializableMitreTechnique,
    SigmaMatchOutput, SiemQueries,
};
use crate::providers::{factory, guess_provider_from_key, GenerateParams, Provider};
use crate::retry::with_retry;
use crate::validator::{self, ParsedOutput};
use crate::{mitre, sigma_gen, sigma_matcher, siem_gen, yara_gen};
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One line of the streaming contract (spec.md 6): `{stage, progress,
/// message, data?}`, serialized by the (out-of-scope) transport layer as
/// `data: <json>\n\n`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub progress: u8,
    pub message: String,
    pub data: Option<Value>,
}

impl ProgressEvent {
    fn new(stage: &str, progress: u8, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            stage: stage.to_string(),
            progress,
            message: message.into(),
            data,
        }
    }
}

/// Per-call token usage, mirroring the original's `TokenUsageRepository`
/// record shape. The core never persists this itself; [`UsageSink`] is the
/// seam the (out-of-scope) persistence layer plugs into.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub task: String,
    pub provider: String,
    pub model: String,
    pub usage: crate::models::TokenUsage,
}

/// Receives one [`UsageRecord`] per successful provider call.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn record(&self, _record: UsageRecord) {}
}

pub struct Orchestrator {
    cfg: Config,
    cache: Option<ResponseCache>,
    usage_sink: Arc<dyn UsageSink>,
}

impl Orchestrator {
    pub fn new(cfg: Config) -> Self {
        let cache = cfg
            .cache
            .enabled
            .then(|| ResponseCache::new(cfg.cache.max_size, cfg.cache.default_ttl));
        Self {
            cache,
            cfg,
            usage_sink: Arc::new(NoopUsageSink),
        }
    }

    /// Swaps in a caller-supplied usage sink (e.g. a database-backed one),
    /// replacing the no-op default.
    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = sink;
        self
    }

    fn build_provider(&self, selector: &ProviderSelector) -> Result<Arc<dyn Provider>, PerseptorError> {
        let provider_name = selector
            .provider_id
            .clone()
            .unwrap_or_else(|| guess_provider_from_key(&selector.api_key).to_string());
        factory::get_provider(&provider_name, &selector.api_key, selector.model_id.clone())
    }

    /// Calls a provider with retry + a bounded timeout, returning the
    /// response content. Any failure (construction, retry exhaustion,
    /// timeout) is logged and collapses to an empty string -- the caller
    /// substitutes the stage's own default, mirroring the original
    /// orchestrator's blanket `except Exception` fallbacks.
    async fn generate_text(
        &self,
        provider: &Arc<dyn Provider>,
        model: Option<&str>,
        task: &str,
        messages: Vec<Message>,
        timeout: Duration,
    ) -> String {
        let params = GenerateParams::default();
        let cache_key = self.cache.as_ref().map(|_| {
            let payload: String = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
            ResponseCache::make_key(task, &payload, provider.provider_name(), model.unwrap_or("default"))
        });

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(hit) = cache.get(key) {
                return hit;
            }
        }

        let result = tokio::time::timeout(timeout, with_retry(&self.cfg.retry, || provider.generate(&messages, model, params))).await;
        match result {
            Ok(Ok(resp)) => {
                if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
                    cache.set(key, resp.content.clone());
                }
                self.usage_sink.record(UsageRecord {
                    task: task.to_string(),
                    provider: resp.provider.clone(),
                    model: resp.model.clone(),
                    usage: resp.usage.clone(),
                });
                resp.content
            }
            Ok(Err(e)) => {
                warn!(task, error = %e, "provider call failed, using stage default");
                String::new()
            }
            Err(_) => {
                warn!(task, "provider call timed out, using stage default");
                String::new()
            }
        }
    }

    /// Synchronous entry point: runs every stage to completion and returns
    /// the final aggregated record.
    pub async fn run_sync(&self, request: &AnalysisRequest) -> AnalysisResult {
        self.run_inner(request, None).await
    }

    /// Streaming entry point: spawns the pipeline on a background task and
    /// returns a lazy sequence of progress events, terminating with a
    /// `stage = "complete"` event carrying the full record as `data`.
    pub fn run_stream(self: Arc<Self>, request: AnalysisRequest) -> BoxStream<'static, ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel::<ProgressEvent>();
        tokio::spawn(async move {
            let result = self.run_inner(&request, Some(&tx)).await;
            let data = serde_json::to_value(&result).ok();
            let _ = tx.send(ProgressEvent::new("complete", 100, "Analysis complete", data));
        });
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed()
    }

    async fn run_inner(&self, request: &AnalysisRequest, progress: Option<&mpsc::UnboundedSender<ProgressEvent>>) -> AnalysisResult {
        let combined_text = request.combined_text();
        let date = chrono::Utc::now().format("%Y/%m/%d").to_string();

        let provider = match self.build_provider(&request.provider_selector) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(error = %e, "could not construct provider, AI stages will use defaults");
                None
            }
        };
        let model = request.provider_selector.model_id.as_deref();

        // ── Stage S1: parallel {summary, IoC extraction, AI Sigma} ─────────
        emit(progress, "ai_parallel", 22, "Starting parallel AI analysis...", None);
        emit(progress, "threat_summary", 25, "AI analyzing threat landscape...", None);
        emit(progress, "ioc_extraction", 25, "AI extracting IoCs and TTPs...", None);
        emit(progress, "ai_sigma", 25, "AI generating Sigma rules...", None);

        let (threat_summary, ioc_bundle, ai_sigma_raw) = match &provider {
            Some(provider) => {
                let summary_fut = self.generate_text(
                    provider,
                    model,
                    "threat_summary",
                    vec![
                        Message::system(crate::prompts::get("threat_analyst_system")),
                        Message::user(crate::prompts::render(&crate::prompts::get("threat_summary_cot"), &[("report_text", &combined_text)])),
                    ],
                    self.cfg.timeouts.generation,
                );
                let (ioc_fewshot_user, ioc_fewshot_assistant) = crate::prompts::few_shot("ioc_extraction");
                let ioc_fut = self.generate_text(
                    provider,
                    model,
                    "ioc_extraction",
                    vec![
                        Message::system(crate::prompts::get("ioc_extractor_system")),
                        Message::user(ioc_fewshot_user),
                        Message::assistant(ioc_fewshot_assistant),
                        Message::user(crate::prompts::render(&crate::prompts::get("ioc_extraction_cot"), &[("report_text", &combined_text)])),
                    ],
                    self.cfg.timeouts.generation,
                );
                let (sigma_fewshot_user, sigma_fewshot_assistant) = crate::prompts::few_shot("sigma_generation");
                let sigma_fut = self.generate_text(
                    provider,
                    model,
                    "ai_sigma",
                    vec![
                        Message::system(crate::prompts::get("detection_engineer_system")),
                        Message::user(sigma_fewshot_user),
                        Message::assistant(sigma_fewshot_assistant),
                        Message::user(crate::prompts::render(
                            &crate::prompts::get("sigma_generation_cot"),
                            &[("report_text", &request.extracted_text), ("ocr_text", &request.image_ocr_text)],
                        )),
                    ],
                    self.cfg.timeouts.generation,
                );
                let (summary, ioc_raw, sigma_raw) = tokio::join!(summary_fut, ioc_fut, sigma_fut);
                (
                    if summary.is_empty() { "Could not generate threat summary".to_string() } else { summary },
                    parse_ioc_bundle(&ioc_raw),
                    sigma_raw,
                )
            }
            None => ("Could not generate threat summary".to_string(), IoCBundle::default(), String::new()),
        };

        let summary_message = if threat_summary == "Could not generate threat summary" {
            "Threat summary failed"
        } else {
            "Threat summary complete"
        };
        emit(progress, "threat_summary_done", 40, summary_message, Some(json!({"threat_summary": threat_summary})));

        let ioc_count: usize = ioc_bundle.indicators_of_compromise.values().map(|v| v.len()).sum();
        let analysis_data_payload = json!({
            "analysis_data": AnalysisDataSummary {
                indicators_of_compromise: ioc_bundle.indicators_of_compromise.clone(),
                ttps: ioc_bundle.ttps.clone(),
                threat_actors: ioc_bundle.threat_actors.clone(),
                tools_or_malware: ioc_bundle.tools_or_malware.clone(),
            }
        });
        emit(progress, "ioc_done", 50, &format!("Extracted {ioc_count} IoCs"), Some(analysis_data_payload));

        // ── Stage S2: parallel {YARA, MITRE, structural Sigma} ─────────────
        emit(progress, "rules", 55, "Generating detection rules...", None);
        let ioc_map = ioc_bundle.indicators_of_compromise.clone();
        let ((yara_rules, mitre_techniques), ioc_sigma_rules) = {
            let yara_fut = async { yara_gen::generate_yara_rules(&ioc_map, &date) };
            let mitre_fut = async { mitre::map_iocs_to_mitre(&ioc_bundle) };
            let sigma_fut = async {
                sigma_gen::generate_sigma_rules(&ioc_map, &request.source_ref, None, None, &date)
            };
            let (yara, mitre_t, ioc_sigma) = tokio::join!(yara_fut, mitre_fut, sigma_fut);
            ((yara, mitre_t), ioc_sigma)
        };
        emit(progress, "yara_done", 62, &format!("Generated {} YARA rules", yara_rules.len()), None);
        let mitre_tags = mitre::get_mitre_tags(&mitre_techniques);
        let tactic_summary = mitre::get_tactic_summary(&mitre_techniques);
        emit(
            progress,
            "mitre_done",
            68,
            &format!("Mapped {} MITRE techniques", mitre_techniques.len()),
            Some(json!({
                "mitre_mapping": MitreMappingSummary {
                    techniques: mitre_techniques.iter().map(SerializableMitreTechnique::from).collect(),
                    tactic_summary: tactic_summary.clone(),
                    tags: mitre_tags.clone(),
                }
            })),
        );
        let ioc_sigma_yaml = sigma_gen::rules_to_combined_yaml(&ioc_sigma_rules);
        emit(progress, "sigma_done", 75, &format!("Generated {} Sigma rules", ioc_sigma_rules.len()), None);
        let ai_sigma_cleaned = sigma_gen::clean_ai_sigma_output(&ai_sigma_raw);
        let all_sigma_yaml = if !ai_sigma_cleaned.is_empty() {
            if ioc_sigma_yaml.is_empty() { ai_sigma_cleaned } else { format!("{ioc_sigma_yaml}\n---\n{ai_sigma_cleaned}") }
        } else {
            ioc_sigma_yaml
        };

        // ── Stage S3: Sigma catalog matching (depends on S1 + S2) ──────────
        emit(progress, "sigma_match", 76, "Matching global Sigma rules with MITRE data...", None);
        let sigma_matches = {
            let rules_dir = self.cfg.sigma_rules_dir.clone();
            let bundle = ioc_bundle.clone();
            let techniques = mitre_techniques.clone();
            let base_url = self.cfg.sigmahq_base_url.clone();
            let threshold = self.cfg.sigma_catalog_threshold;
            let top_k = self.cfg.sigma_catalog_top_k;
            let text = combined_text.clone();
            let task = tokio::task::spawn_blocking(move || {
                sigma_matcher::match_report_against_catalog(&rules_dir, &bundle, &techniques, &text, &base_url, threshold, top_k)
            });
            match tokio::time::timeout(self.cfg.timeouts.small_task, task).await {
                Ok(Ok(matches)) => matches,
                Ok(Err(e)) => {
                    warn!(error = %e, "Sigma matcher task panicked, using empty default");
                    Vec::new()
                }
                Err(_) => {
                    warn!("Sigma catalog matching timed out, using empty default");
                    Vec::new()
                }
            }
        };
        emit(
            progress,
            "sigma_match_done",
            80,
            &format!("Matched {} global Sigma rules", sigma_matches.len()),
            Some(json!({"sigma_matches": sigma_matches.iter().map(SigmaMatchOutput::from).collect::<Vec<_>>()})),
        );

        // ── Stage S4: parallel {IoC SIEM queries, AI-refined SIEM} ─────────
        emit(progress, "siem", 82, "Generating SIEM queries...", None);
        let mut siem_queries = siem_gen::generate_siem_queries(&ioc_map);
        emit(progress, "siem_structured_done", 88, "IoC-based SIEM queries ready", None);
        if let Some(provider) = &provider {
            if !ai_sigma_raw.trim().is_empty() {
                let (siem_fewshot_user, siem_fewshot_assistant) = crate::prompts::few_shot("siem_conversion");
                let ai_raw = self.generate_text(
                    provider,
                    model,
                    "siem_refine",
                    vec![
                        Message::system(crate::prompts::get("siem_specialist_system")),
                        Message::user(siem_fewshot_user),
                        Message::assistant(siem_fewshot_assistant),
                        Message::user(crate::prompts::render(&crate::prompts::get("siem_conversion_cot"), &[("detection_logic", &ai_sigma_raw)])),
                    ],
                    self.cfg.timeouts.generation,
                )
                .await;
                merge_ai_siem(&mut siem_queries, &ai_raw);
            }
        }
        emit(progress, "siem_ai_done", 93, "AI-refined SIEM queries ready", None);

        // ── Stage S5: atomic test scenarios (union of structural + AI Sigma) ─
        let atomic_tests = if all_sigma_yaml.trim().len() > 20 {
            emit(progress, "atomic_tests", 93, "Generating Atomic Red Team test scenarios...", None);
            match &provider {
                Some(provider) => {
                    let (atomic_fewshot_user, atomic_fewshot_assistant) = crate::prompts::few_shot("atomic_test_generation");
                    let raw = self.generate_text(
                        provider,
                        model,
                        "atomic_tests",
                        vec![
                            Message::system(crate::prompts::get("atomic_test_engineer_system")),
                            Message::user(atomic_fewshot_user),
                            Message::assistant(atomic_fewshot_assistant),
                            Message::user(crate::prompts::render(&crate::prompts::get("atomic_test_generation_cot"), &[("sigma_rule", &all_sigma_yaml)])),
                        ],
                        self.cfg.timeouts.generation,
                    )
                    .await;
                    let tests = parse_atomic_tests(&raw);
                    emit(
                        progress,
                        "atomic_tests_done",
                        97,
                        &format!("Generated {} atomic test scenarios", tests.len()),
                        Some(json!({"atomic_tests": tests})),
                    );
                    tests
                }
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        emit(progress, "finalizing", 98, "Compiling final report...", None);

        info!(
            ioc_count = ioc_bundle.total_ioc_count(),
            mitre_count = mitre_techniques.len(),
            sigma_matches = sigma_matches.len(),
            "analysis pipeline complete"
        );

        AnalysisResult {
            threat_summary,
            analysis_data: AnalysisDataSummary {
                indicators_of_compromise: ioc_bundle.indicators_of_compromise.clone(),
                ttps: ioc_bundle.ttps.clone(),
                threat_actors: ioc_bundle.threat_actors.clone(),
                tools_or_malware: ioc_bundle.tools_or_malware.clone(),
            },
            mitre_mapping: MitreMappingSummary {
                techniques: mitre_techniques.iter().map(SerializableMitreTechnique::from).collect(),
                tactic_summary,
                tags: mitre_tags,
            },
            yara_rules,
            ioc_sigma_rules,
            generated_sigma_rules: all_sigma_yaml,
            siem_queries,
            atomic_tests,
            sigma_matches: sigma_matches.iter().map(SigmaMatchOutput::from).collect(),
        }
    }
}

fn emit(progress: Option<&mpsc::UnboundedSender<ProgressEvent>>, stage: &str, pct: u8, message: &str, data: Option<Value>) {
    if let Some(tx) = progress {
        let _ = tx.send(ProgressEvent::new(stage, pct, message, data));
    }
}

fn parse_ioc_bundle(raw: &str) -> IoCBundle {
    if raw.trim().is_empty() {
        return IoCBundle::default();
    }
    match validator::extract_and_parse(raw) {
        ParsedOutput::Json(value) => {
            let validated = validator::validate_ioc_response(value);
            serde_json::from_value(validated.data).unwrap_or_else(|e| {
                warn!(error = %e, "IoC response did not match expected schema, using default");
                IoCBundle::default()
            })
        }
        ParsedOutput::Malformed(_) => {
            warn!("IoC extraction response could not be repaired into JSON, using default");
            IoCBundle::default()
        }
    }
}

fn parse_atomic_tests(raw: &str) -> Vec<AtomicTest> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match validator::extract_and_parse(raw) {
        ParsedOutput::Json(value) => serde_json::from_value(value).unwrap_or_default(),
        ParsedOutput::Malformed(_) => Vec::new(),
    }
}

/// Merges AI-refined SIEM queries into the deterministic set per-platform,
/// appending as `existing ∥ "/* AI-Refined */" ∥ ai_query` (spec.md 4.11 S4).
fn merge_ai_siem(siem_queries: &mut SiemQueries, ai_raw: &str) {
    let parsed = match validator::extract_and_parse(ai_raw) {
        ParsedOutput::Json(value) => value,
        ParsedOutput::Malformed(_) => return,
    };
    let validated = validator::validate_siem_response(parsed);
    let Ok(ai_queries) = serde_json::from_value::<SiemQueries>(validated.data) else {
        return;
    };

    for (existing, ai) in [
        (&mut siem_queries.splunk, &ai_queries.splunk),
        (&mut siem_queries.qradar, &ai_queries.qradar),
        (&mut siem_queries.elastic, &ai_queries.elastic),
        (&mut siem_queries.sentinel, &ai_queries.sentinel),
    ] {
        if !ai.query.is_empty() && ai.query != "N/A" && !ai.query.starts_with("ERROR") {
            existing.query = format!("{}\n\n/* AI-Refined */\n{}", existing.query, ai.query);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderSelector;

    fn request(text: &str) -> AnalysisRequest {
        AnalysisRequest {
            source_ref: "https://example.com/report".to_string(),
            extracted_text: text.to_string(),
            image_ocr_text: String::new(),
            provider_selector: ProviderSelector {
                provider_id: None,
                model_id: None,
                api_key: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn runs_to_completion_with_no_provider_and_empty_iocs() {
        let orchestrator = Orchestrator::new(Config::default());
        let req = request("A generic report with no indicators of compromise whatsoever, just prose.");
        let result = orchestrator.run_sync(&req).await;
        assert_eq!(result.threat_summary, "Could not generate threat summary");
        assert!(result.atomic_tests.is_empty());
        assert!(result.yara_rules.is_empty());
    }

    #[test]
    fn parse_ioc_bundle_falls_back_to_default_on_garbage() {
        let bundle = parse_ioc_bundle("not json at all");
        assert_eq!(bundle.indicators_of_compromise.len(), crate::models::IOC_CATEGORIES.len());
    }

    #[test]
    fn noop_usage_sink_accepts_records_without_panicking() {
        let sink = NoopUsageSink;
        sink.record(UsageRecord {
            task: "threat_summary".to_string(),
            provider: "anthropic".to_string(),
            model: "claude".to_string(),
            usage: crate::models::TokenUsage::default(),
        });
    }

    #[tokio::test]
    async fn streaming_run_emits_literal_per_task_stage_tags() {
        let orchestrator = Arc::new(Orchestrator::new(Config::default()));
        let req = request("A generic report with no indicators of compromise whatsoever, just prose.");
        let mut stream = orchestrator.run_stream(req);
        let mut stages = Vec::new();
        while let Some(event) = stream.next().await {
            stages.push(event.stage.clone());
        }
        for expected in [
            "threat_summary_done",
            "ioc_done",
            "yara_done",
            "mitre_done",
            "sigma_done",
            "sigma_match_done",
            "siem_structured_done",
            "siem_ai_done",
            "complete",
        ] {
            assert!(stages.contains(&expected.to_string()), "missing stage {expected} in {stages:?}");
        }
        assert!(!stages.contains(&"ai_parallel_done".to_string()));
    }

    #[test]
    fn merge_ai_siem_appends_refined_marker() {
        let mut queries = SiemQueries::default();
        queries.splunk.query = "base query".to_string();
        let ai_raw = r#"{"splunk":{"description":"d","query":"ai query","notes":"n"},"qradar":{"description":"d","query":"N/A","notes":"n"},"elastic":{"description":"d","query":"N/A","notes":"n"},"sentinel":{"description":"d","query":"N/A","notes":"n"}}"#;
        merge_ai_siem(&mut queries, ai_raw);
        assert!(queries.splunk.query.contains("AI-Refined"));
        assert!(queries.splunk.query.contains("ai query"));
    }
}

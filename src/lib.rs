//! perseptor-core: the threat-intelligence analysis pipeline.
//!
//! Takes a threat report (plus optional image OCR text), extracts IoCs and
//! TTPs, maps them to MITRE ATT&CK, generates Sigma/YARA/SIEM detections,
//! matches the report against an offline Sigma rule catalog, and proposes
//! atomic tests -- all through a five-stage [`orchestrator`] pipeline that
//! degrades to per-stage defaults rather than aborting on a failed provider
//! call. See `SPEC_FULL.md` for the full module map.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod mitre;
pub mod models;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod retry;
pub mod siem_gen;
pub mod sigma_gen;
pub mod sigma_matcher;
pub mod validator;
pub mod yara_gen;

pub use config::Config;
pub use error::{PerseptorError, Result};
pub use models::{AnalysisRequest, AnalysisResult};
pub use orchestrator::{Orchestrator, ProgressEvent, UsageRecord, UsageSink};

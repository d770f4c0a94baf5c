//! Role classification of an aggregated analysis.
//!
//! The classifier is an external chat-completion service. Its answer must be
//! exactly `{primaryRole, roleScore, aiAnalysis: {analysisSummary, improvementSuggestions}}`;
//! anything missing, extra or out of range is rejected as a parsing failure
//! rather than filled with defaults.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use repolens_common::{ActivityTotals, AiNarrative};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::ClassifierConfig;
use crate::error::{AnalysisError, Result};

/// Numbers and text handed to the classifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSummary {
    pub selected_repositories: Vec<String>,
    pub overall_score: u32,
    pub language_ratios: BTreeMap<String, f64>,
    /// Mean quality score per language over the selection
    pub language_quality: BTreeMap<String, f64>,
    pub activity: ActivityTotals,
    pub repositories: Vec<RepositorySummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySummary {
    pub name: String,
    pub score: u32,
    pub commit_frequency: f64,
    pub languages: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleAssessment {
    pub primary_role: String,
    pub role_score: u32,
    pub ai_analysis: AiNarrative,
}

#[async_trait]
pub trait RoleClassifier: Send + Sync {
    async fn classify(&self, summary: &AggregateSummary) -> Result<RoleAssessment>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AssessmentWire {
    primary_role: String,
    role_score: u32,
    ai_analysis: NarrativeWire,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct NarrativeWire {
    analysis_summary: Vec<String>,
    improvement_suggestions: Vec<String>,
}

/// Strictly parse the classifier's JSON answer.
pub fn parse_role_assessment(content: &str) -> Result<RoleAssessment> {
    let wire: AssessmentWire = serde_json::from_str(content.trim())
        .map_err(|e| AnalysisError::Parsing(format!("classifier response: {e}")))?;

    let primary_role = wire.primary_role.trim().to_string();
    if primary_role.is_empty() {
        return Err(AnalysisError::Parsing(
            "classifier response: empty primaryRole".into(),
        ));
    }
    if wire.role_score > 100 {
        return Err(AnalysisError::Parsing(format!(
            "classifier response: roleScore {} outside 0..=100",
            wire.role_score
        )));
    }
    Ok(RoleAssessment {
        primary_role,
        role_score: wire.role_score,
        ai_analysis: AiNarrative {
            analysis_summary: wire.ai_analysis.analysis_summary,
            improvement_suggestions: wire.ai_analysis.improvement_suggestions,
        },
    })
}

const SYSTEM_PROMPT: &str = "Analyse the GitHub repository statistics provided by the user \
and answer with a single JSON object that follows the requested format exactly.";

fn user_prompt(summary: &AggregateSummary) -> Result<String> {
    let data = serde_json::to_string_pretty(summary)?;
    Ok(format!(
        "Using the repository analysis data below, assess the selected repositories as a whole.\n\
         \n\
         1. primaryRole: the best-fitting IT job role (e.g. Backend, Frontend, DevOps Engineer).\n\
         2. roleScore: an integer from 0 to 100 rating the ability to perform that role.\n\
         3. aiAnalysis.analysisSummary: a list of sentences summarising the analysis.\n\
         4. aiAnalysis.improvementSuggestions: a list of concrete improvement suggestions.\n\
         \n\
         Answer with exactly this JSON shape and no other keys:\n\
         {{\"primaryRole\": \"Backend\", \"roleScore\": 88, \"aiAnalysis\": \
         {{\"analysisSummary\": [\"...\"], \"improvementSuggestions\": [\"...\"]}}}}\n\
         \n\
         ## Data\n{data}"
    ))
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` classifier.
#[derive(Debug, Clone)]
pub struct ChatRoleClassifier {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl ChatRoleClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.api_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl RoleClassifier for ChatRoleClassifier {
    async fn classify(&self, summary: &AggregateSummary) -> Result<RoleAssessment> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt(summary)?},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "response_format": {"type": "json_object"},
        });

        let mut req = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        debug!(model = %self.model, repositories = summary.repositories.len(), "requesting role classification");
        let resp = req.send().await?.error_for_status()?;
        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| AnalysisError::Parsing(format!("classifier envelope: {e}")))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AnalysisError::Parsing("classifier returned no content".into()))?;

        let assessment = parse_role_assessment(&content)?;
        info!(role = %assessment.primary_role, score = assessment.role_score, "role classified");
        Ok(assessment)
    }
}

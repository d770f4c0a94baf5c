//! Thin reqwest client over the quality-gate REST API.
//!
//! Every call authenticates with the service token as the basic-auth user
//! and an empty password. Response classification:
//! - 2xx: parsed; an `errors` array in the body is an explicit failure
//! - 404 on the gate status: the project has not been analysed yet
//! - 5xx: surfaced as a transport error so callers may retry
//! - any other status: explicit failure, never retried

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::QualityGateConfig;
use crate::error::{AnalysisError, Result};

/// Metric keys that feed the per-language quality score.
pub const LANGUAGE_METRICS: [&str; 5] = [
    "coverage",
    "bugs",
    "code_smells",
    "vulnerabilities",
    "duplicated_lines_density",
];

const DISTRIBUTION_METRIC: &str = "ncloc_language_distribution";
const ISSUES_PAGE_SIZE: u32 = 500;
const ISSUES_MAX_PAGES: u32 = 20;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCondition {
    pub metric_key: String,
    #[serde(default)]
    pub comparator: Option<String>,
    #[serde(default)]
    pub error_threshold: Option<String>,
    #[serde(default)]
    pub actual_value: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GateStatus {
    pub status: String,
    #[serde(default)]
    pub conditions: Vec<GateCondition>,
}

/// One poll of the gate status.
#[derive(Debug, Clone, PartialEq)]
pub enum GateProbe {
    NotReady,
    Ready(GateStatus),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Measure {
    pub metric: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeasuresResponse {
    component: MeasuresComponent,
}

#[derive(Debug, Deserialize)]
struct MeasuresComponent {
    #[serde(default)]
    measures: Vec<Measure>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Issue {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub rule: Option<String>,
    /// Missing severities are scored as unknown
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssuesResponse {
    #[serde(default)]
    issues: Vec<Issue>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    total: u64,
}

#[derive(Debug, Clone)]
pub struct QualityGateClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl QualityGateClient {
    pub fn new(config: &QualityGateConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: config.host_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let req = self.http.get(format!("{}/{}", self.base_url, path));
        match &self.token {
            Some(token) => req.basic_auth(token, Some("")),
            None => req,
        }
    }

    /// Current gate status of `project_key`.
    pub async fn project_status(&self, project_key: &str) -> Result<GateProbe> {
        let resp = self
            .get("qualitygates/project_status")
            .query(&[("projectKey", project_key)])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(project = %project_key, "quality gate has no analysis yet");
            return Ok(GateProbe::NotReady);
        }
        let body = json_body(resp).await?;
        let payload = body.get("projectStatus").unwrap_or(&body);
        let status: GateStatus = serde_json::from_value(payload.clone())
            .map_err(|e| AnalysisError::Parsing(format!("quality gate status: {e}")))?;

        match status.status.to_ascii_uppercase().as_str() {
            "NONE" => Ok(GateProbe::NotReady),
            "OK" | "WARN" | "ERROR" => Ok(GateProbe::Ready(status)),
            other => Err(AnalysisError::Parsing(format!(
                "unknown quality gate status `{other}`"
            ))),
        }
    }

    pub async fn measures(&self, component: &str, metric_keys: &[&str]) -> Result<Vec<Measure>> {
        let resp = self
            .get("measures/component")
            .query(&[
                ("componentKey", component),
                ("metricKeys", metric_keys.join(",").as_str()),
            ])
            .send()
            .await?;
        let body = json_body(resp).await?;
        let parsed: MeasuresResponse = serde_json::from_value(body)
            .map_err(|e| AnalysisError::Parsing(format!("measures response: {e}")))?;
        Ok(parsed.component.measures)
    }

    /// Lines of code per language as reported by the scan.
    pub async fn language_distribution(&self, component: &str) -> Result<BTreeMap<String, u64>> {
        let measures = self.measures(component, &[DISTRIBUTION_METRIC]).await?;
        match measures
            .iter()
            .find(|m| m.metric == DISTRIBUTION_METRIC)
            .and_then(|m| m.value.as_deref())
        {
            Some(raw) => parse_distribution(raw),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Raw values of [`LANGUAGE_METRICS`], keyed by metric (possibly `metric:language`).
    pub async fn language_measures(&self, component: &str) -> Result<BTreeMap<String, String>> {
        let measures = self.measures(component, &LANGUAGE_METRICS).await?;
        Ok(measures
            .into_iter()
            .filter_map(|m| m.value.map(|v| (m.metric, v)))
            .collect())
    }

    /// All issues raised for `component` by the given external engine.
    pub async fn issues(&self, component: &str, engine_id: &str) -> Result<Vec<Issue>> {
        let mut collected = Vec::new();
        for page in 1..=ISSUES_MAX_PAGES {
            let resp = self
                .get("issues/search")
                .query(&[("componentKeys", component), ("engineId", engine_id)])
                .query(&[("ps", ISSUES_PAGE_SIZE), ("p", page)])
                .send()
                .await?;
            let body = json_body(resp).await?;
            let parsed: IssuesResponse = serde_json::from_value(body)
                .map_err(|e| AnalysisError::Parsing(format!("issues response: {e}")))?;

            let total = parsed.paging.map(|p| p.total).or(parsed.total);
            let fetched = parsed.issues.len();
            collected.extend(parsed.issues);
            let done = match total {
                Some(total) => collected.len() as u64 >= total,
                None => true,
            };
            if done || fetched == 0 {
                break;
            }
        }
        Ok(collected)
    }
}

/// First `errors[].msg` of a quality-gate error body.
fn explicit_error(body: &Value) -> Option<String> {
    let errors = body.get("errors")?.as_array()?;
    let messages: Vec<&str> = errors
        .iter()
        .filter_map(|e| e.get("msg").and_then(Value::as_str))
        .collect();
    if messages.is_empty() {
        None
    } else {
        Some(messages.join("; "))
    }
}

async fn json_body(resp: Response) -> Result<Value> {
    let status = resp.status();
    if status.is_server_error() {
        return Err(match resp.error_for_status() {
            Err(e) => AnalysisError::Transport(e),
            Ok(_) => AnalysisError::AnalysisFailure(format!("quality gate answered {status}")),
        });
    }
    let text = resp.text().await?;
    let body: Value = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::Null)
    };

    if let Some(msg) = explicit_error(&body) {
        return Err(AnalysisError::AnalysisFailure(format!(
            "quality gate error ({status}): {msg}"
        )));
    }
    if !status.is_success() {
        return Err(AnalysisError::AnalysisFailure(format!(
            "quality gate rejected request with {status}"
        )));
    }
    if body.is_null() {
        return Err(AnalysisError::Parsing(
            "quality gate returned a non-JSON body".into(),
        ));
    }
    Ok(body)
}

/// Parse an `ncloc_language_distribution` value.
///
/// Accepts a JSON object (`{"java": "120"}` or `{"java": 120}`) or the
/// service's native `java=120;js=40` form. Fractional counts are truncated.
pub fn parse_distribution(raw: &str) -> Result<BTreeMap<String, u64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(BTreeMap::new());
    }

    if raw.starts_with('{') {
        let object: serde_json::Map<String, Value> = serde_json::from_str(raw)
            .map_err(|e| AnalysisError::Parsing(format!("language distribution: {e}")))?;
        return object
            .into_iter()
            .map(|(lang, v)| {
                let count = match &v {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                count
                    .filter(|c| c.is_finite() && *c >= 0.0)
                    .map(|c| (lang.clone(), c as u64))
                    .ok_or_else(|| {
                        AnalysisError::Parsing(format!("language distribution value for {lang}: {v}"))
                    })
            })
            .collect();
    }

    raw.split(';')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (lang, count) = pair.split_once('=').ok_or_else(|| {
                AnalysisError::Parsing(format!("language distribution entry `{pair}`"))
            })?;
            let count = count.trim().parse::<f64>().ok().filter(|c| *c >= 0.0).ok_or_else(|| {
                AnalysisError::Parsing(format!("language distribution count `{pair}`"))
            })?;
            Ok((lang.trim().to_string(), count as u64))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> QualityGateClient {
        QualityGateClient::new(&QualityGateConfig {
            host_url: format!("{}/api", server.uri()),
            token: Some("tok".into()),
            lint_engine_id: "pmd".into(),
        })
        .unwrap()
    }

    #[test]
    fn distribution_json_and_native_forms() {
        let json = parse_distribution(r#"{"java":"120","js":40.7}"#).unwrap();
        assert_eq!(json.get("java"), Some(&120));
        assert_eq!(json.get("js"), Some(&40));

        let native = parse_distribution("java=120;xml=8").unwrap();
        assert_eq!(native.get("java"), Some(&120));
        assert_eq!(native.get("xml"), Some(&8));

        assert!(parse_distribution("").unwrap().is_empty());
    }

    #[test]
    fn distribution_garbage_is_parsing_error() {
        assert!(matches!(
            parse_distribution("not a map"),
            Err(AnalysisError::Parsing(_))
        ));
        assert!(matches!(
            parse_distribution(r#"{"java": true}"#),
            Err(AnalysisError::Parsing(_))
        ));
        assert!(matches!(
            parse_distribution("java=lots"),
            Err(AnalysisError::Parsing(_))
        ));
    }

    #[tokio::test]
    async fn project_status_ready_with_conditions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/qualitygates/project_status"))
            .and(query_param("projectKey", "octo_engine"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "projectStatus": {
                    "status": "ERROR",
                    "conditions": [
                        {"metricKey": "bugs", "comparator": "GT", "errorThreshold": "0",
                         "actualValue": "3", "status": "ERROR"}
                    ]
                }
            })))
            .mount(&server)
            .await;

        match client(&server).project_status("octo_engine").await.unwrap() {
            GateProbe::Ready(status) => {
                assert_eq!(status.status, "ERROR");
                assert_eq!(status.conditions.len(), 1);
                assert_eq!(status.conditions[0].metric_key, "bugs");
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn not_found_and_none_are_not_ready() {
        let server = MockServer::start().await;
        Mock::given(path("/api/qualitygates/project_status"))
            .and(query_param("projectKey", "missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "errors": [{"msg": "Project 'missing' not found"}]
            })))
            .mount(&server)
            .await;
        Mock::given(path("/api/qualitygates/project_status"))
            .and(query_param("projectKey", "fresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"projectStatus": {"status": "NONE"}})),
            )
            .mount(&server)
            .await;

        let c = client(&server);
        assert_eq!(c.project_status("missing").await.unwrap(), GateProbe::NotReady);
        assert_eq!(c.project_status("fresh").await.unwrap(), GateProbe::NotReady);
    }

    #[tokio::test]
    async fn explicit_error_is_analysis_failure() {
        let server = MockServer::start().await;
        Mock::given(path("/api/qualitygates/project_status"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "errors": [{"msg": "Insufficient privileges"}]
            })))
            .mount(&server)
            .await;
        let err = client(&server).project_status("k").await.unwrap_err();
        match err {
            AnalysisError::AnalysisFailure(msg) => assert!(msg.contains("Insufficient privileges")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(path("/api/qualitygates/project_status"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = client(&server).project_status("k").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn measures_feed_distribution_and_language_metrics() {
        let server = MockServer::start().await;
        Mock::given(path("/api/measures/component"))
            .and(query_param("metricKeys", "ncloc_language_distribution"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "component": {"measures": [
                    {"metric": "ncloc_language_distribution", "value": "js=300;css=20"}
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(path("/api/measures/component"))
            .and(query_param(
                "metricKeys",
                "coverage,bugs,code_smells,vulnerabilities,duplicated_lines_density",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "component": {"measures": [
                    {"metric": "coverage:js", "value": "80"},
                    {"metric": "bugs:js", "value": "2"},
                    {"metric": "code_smells"}
                ]}
            })))
            .mount(&server)
            .await;

        let c = client(&server);
        let dist = c.language_distribution("k").await.unwrap();
        assert_eq!(dist.get("js"), Some(&300));
        assert_eq!(dist.get("css"), Some(&20));

        let measures = c.language_measures("k").await.unwrap();
        assert_eq!(measures.get("coverage:js").map(String::as_str), Some("80"));
        assert!(!measures.contains_key("code_smells"));
    }

    #[tokio::test]
    async fn issues_follow_paging() {
        let server = MockServer::start().await;
        Mock::given(path("/api/issues/search"))
            .and(query_param("engineId", "pmd"))
            .and(query_param("p", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "paging": {"pageIndex": 1, "pageSize": 500, "total": 3},
                "issues": [{"severity": "MAJOR"}, {"severity": "INFO"}]
            })))
            .mount(&server)
            .await;
        Mock::given(path("/api/issues/search"))
            .and(query_param("p", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "paging": {"pageIndex": 2, "pageSize": 500, "total": 3},
                "issues": [{"severity": "BLOCKER"}]
            })))
            .mount(&server)
            .await;

        let issues = client(&server).issues("k", "pmd").await.unwrap();
        let severities: Vec<_> = issues.iter().filter_map(|i| i.severity.as_deref()).collect();
        assert_eq!(severities, ["MAJOR", "INFO", "BLOCKER"]);
    }
}

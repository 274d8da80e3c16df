//! Remote workflow client abstraction.
//!
//! This module defines the [`WorkflowClient`] trait for executing a single
//! workflow run, plus the production `reqwest` implementation and a mock for
//! tests.
//!
//! The production client is deliberately single-shot: **every call builds
//! its own `reqwest::Client`**, so no transport state is ever shared between
//! concurrent tasks. Tearing down one call (timeout, cancellation, drop) can
//! therefore never disturb a connection in use by another task.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::binding::{ParameterSchema, WorkflowBinding};
use crate::error::{TaskErrorKind, VolleyError};
use crate::task::InputMap;

/// Application-level outcome reported by the remote service for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Parsed response of a single workflow run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Identifier assigned by the remote service, captured from the first
    /// response. Persisted for diagnostics; not sufficient for dedup.
    pub external_run_id: Option<String>,
    pub status: RunStatus,
    /// The raw result payload; see [`extract_output`] for the displayable
    /// text derivation.
    pub outputs: Value,
    pub elapsed_ms: u64,
    pub error_detail: Option<String>,
}

/// A failed workflow call, already mapped onto the task error taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct RunError {
    pub kind: TaskErrorKind,
    pub detail: String,
}

impl RunError {
    pub fn new(kind: TaskErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

pub type RunOutcome = std::result::Result<RunResult, RunError>;

/// Failure modes of the schema-fetch endpoint, as surfaced by the registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaFetchError {
    #[error("credentials rejected: {0}")]
    Auth(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("malformed schema response: {0}")]
    Protocol(String),
}

impl From<SchemaFetchError> for VolleyError {
    fn from(err: SchemaFetchError) -> Self {
        match err {
            SchemaFetchError::Auth(detail) => VolleyError::Auth(detail),
            SchemaFetchError::Unreachable(detail) => VolleyError::Unreachable(detail),
            SchemaFetchError::Protocol(detail) => VolleyError::Protocol(detail),
        }
    }
}

pub type SchemaResult = std::result::Result<ParameterSchema, SchemaFetchError>;

/// Trait for talking to the remote workflow service.
///
/// Implementations must keep calls isolated from each other: a call owns
/// whatever transport it uses for its lifetime, and closing it must not
/// affect any other in-flight call.
#[async_trait]
pub trait WorkflowClient: Send + Sync + Clone + 'static {
    /// Execute one workflow run with the given inputs.
    ///
    /// `timeout` is the single per-call deadline covering connect, headers
    /// and body; exceeding it yields [`TaskErrorKind::Timeout`].
    async fn run(
        &self,
        binding: &WorkflowBinding,
        inputs: &InputMap,
        timeout: Duration,
    ) -> RunOutcome;

    /// Fetch the workflow's parameter schema.
    async fn fetch_schema(
        &self,
        base_url: &str,
        credential: &str,
        timeout: Duration,
    ) -> SchemaResult;
}

// ============================================================================
// Output extraction
// ============================================================================

/// Sentinel written when a successful run produced nothing displayable.
pub const NO_OUTPUT: &str = "no output";

/// Service bookkeeping fields that are never part of the displayable result.
const RESERVED_KEYS: [&str; 9] = [
    "id",
    "workflow_id",
    "status",
    "elapsed_time",
    "total_tokens",
    "total_steps",
    "created_at",
    "finished_at",
    "error",
];

/// Derive the displayable result string from a run payload.
///
/// The rule, shared with the result assembler:
/// prefer `outputs`, else a top-level `output`, else `result`; if the
/// selected value nests another `outputs` object, descend once; a map is
/// flattened by joining its values in insertion order with newlines, after
/// dropping reserved bookkeeping keys; an empty result becomes the literal
/// `"no output"`.
pub fn extract_output(payload: &Value) -> String {
    let selected = payload
        .get("outputs")
        .or_else(|| payload.get("output"))
        .or_else(|| payload.get("result"));
    let Some(mut value) = selected else {
        return NO_OUTPUT.to_string();
    };

    if let Some(inner) = value.get("outputs") {
        value = inner;
    }

    let text = match value {
        Value::Object(map) => map
            .iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .map(|(_, v)| scalar_text(v))
            .collect::<Vec<_>>()
            .join("\n"),
        other => scalar_text(other),
    };

    if text.trim().is_empty() {
        NO_OUTPUT.to_string()
    } else {
        text
    }
}

/// Structured values flatten through string conversion; this loses type
/// information for nested lists/objects, which is accepted and recorded in
/// DESIGN.md.
fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Production workflow client.
///
/// Stateless by construction: `run` and `fetch_schema` build a fresh
/// `reqwest::Client` per call.
#[derive(Debug, Clone, Default)]
pub struct HttpWorkflowClient;

impl HttpWorkflowClient {
    pub fn new() -> Self {
        Self
    }
}

fn map_transport_error(err: &reqwest::Error) -> RunError {
    if err.is_timeout() {
        RunError::new(TaskErrorKind::Timeout, "per-call deadline exceeded")
    } else {
        RunError::new(TaskErrorKind::Transport, err.to_string())
    }
}

fn map_http_status(status: reqwest::StatusCode, body: &str) -> RunError {
    let snippet: String = body.chars().take(200).collect();
    let detail = format!("HTTP {}: {}", status.as_u16(), snippet);
    if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
        RunError::new(TaskErrorKind::Retryable, detail)
    } else {
        RunError::new(TaskErrorKind::Permanent, detail)
    }
}

fn run_url(base_url: &str) -> String {
    format!("{}/workflows/run", base_url.trim_end_matches('/'))
}

fn parameters_url(base_url: &str) -> String {
    format!("{}/parameters", base_url.trim_end_matches('/'))
}

/// Parse a 2xx run response body into a [`RunResult`].
fn parse_run_response(body: &str) -> RunOutcome {
    let value: Value = serde_json::from_str(body).map_err(|e| {
        RunError::new(
            TaskErrorKind::Protocol,
            format!("response body is not JSON: {e}"),
        )
    })?;
    if !value.is_object() {
        return Err(RunError::new(
            TaskErrorKind::Protocol,
            "response body is not a JSON object",
        ));
    }

    // Responses either carry the run envelope at the top level or nest it
    // under `data`.
    let envelope = value.get("data").filter(|d| d.is_object()).unwrap_or(&value);

    let external_run_id = value
        .get("workflow_run_id")
        .and_then(Value::as_str)
        .or_else(|| envelope.get("id").and_then(Value::as_str))
        .or_else(|| value.get("id").and_then(Value::as_str))
        .map(str::to_string);

    let status = match envelope.get("status").and_then(Value::as_str) {
        Some("failed") | Some("stopped") => RunStatus::Failed,
        // Absent status on a 2xx body is treated as success; the extraction
        // rule will still yield "no output" when nothing useful came back.
        _ => RunStatus::Succeeded,
    };

    let elapsed_ms = envelope
        .get("elapsed_time")
        .and_then(Value::as_f64)
        .map(|secs| (secs * 1000.0) as u64)
        .unwrap_or(0);

    let error_detail = envelope
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(RunResult {
        external_run_id,
        status,
        outputs: envelope.clone(),
        elapsed_ms,
        error_detail,
    })
}

#[async_trait]
impl WorkflowClient for HttpWorkflowClient {
    #[tracing::instrument(skip_all, fields(base_url = %binding.base_url))]
    async fn run(
        &self,
        binding: &WorkflowBinding,
        inputs: &InputMap,
        timeout: Duration,
    ) -> RunOutcome {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RunError::new(TaskErrorKind::Transport, e.to_string()))?;

        let body = serde_json::json!({
            "inputs": inputs,
            "response_mode": "blocking",
        });

        let response = client
            .post(run_url(&binding.base_url))
            .bearer_auth(&binding.credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_transport_error(&e))?;

        if !status.is_success() {
            return Err(map_http_status(status, &text));
        }

        parse_run_response(&text)
    }

    #[tracing::instrument(skip_all, fields(base_url = %base_url))]
    async fn fetch_schema(
        &self,
        base_url: &str,
        credential: &str,
        timeout: Duration,
    ) -> SchemaResult {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchemaFetchError::Unreachable(e.to_string()))?;

        let response = client
            .get(parameters_url(base_url))
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| SchemaFetchError::Unreachable(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SchemaFetchError::Unreachable(e.to_string()))?;

        match status.as_u16() {
            200..=299 => serde_json::from_str::<ParameterSchema>(&text)
                .map_err(|e| SchemaFetchError::Protocol(format!("{e}"))),
            401 | 403 => Err(SchemaFetchError::Auth(format!("HTTP {}", status.as_u16()))),
            code => Err(SchemaFetchError::Protocol(format!(
                "unexpected HTTP {code} from schema endpoint"
            ))),
        }
    }
}

// ============================================================================
// Test/mock implementation
// ============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// One scripted response for the mock client.
struct ScriptedRun {
    outcome: RunOutcome,
    delay: Option<Duration>,
    trigger: Option<oneshot::Receiver<()>>,
}

/// Record of a call made to the mock workflow client.
#[derive(Debug, Clone)]
pub struct RunCall {
    pub inputs: InputMap,
    pub timeout: Duration,
}

/// Mock workflow client for tests.
///
/// Responses are scripted either as a global FIFO queue (`push_run`) or
/// keyed on a specific input value (`respond_where`). A triggered response
/// holds its call open until the returned sender fires, which lets tests
/// observe concurrency limits and pause/cancel behaviour deterministically.
#[derive(Clone, Default)]
pub struct MockWorkflowClient {
    schema: Arc<Mutex<Option<SchemaResult>>>,
    queue: Arc<Mutex<VecDeque<ScriptedRun>>>,
    keyed: Arc<Mutex<HashMap<(String, String), VecDeque<ScriptedRun>>>>,
    calls: Arc<Mutex<Vec<RunCall>>>,
    in_flight: Arc<AtomicUsize>,
}

impl MockWorkflowClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the schema returned by `fetch_schema`.
    pub fn with_schema(self, schema: ParameterSchema) -> Self {
        *self.schema.lock() = Some(Ok(schema));
        self
    }

    pub fn set_schema_result(&self, result: SchemaResult) {
        *self.schema.lock() = Some(result);
    }

    /// Queue a response; calls consume the queue in FIFO order.
    pub fn push_run(&self, outcome: RunOutcome) {
        self.queue.lock().push_back(ScriptedRun {
            outcome,
            delay: None,
            trigger: None,
        });
    }

    /// Queue a response that completes only after `delay`.
    pub fn push_run_delayed(&self, outcome: RunOutcome, delay: Duration) {
        self.queue.lock().push_back(ScriptedRun {
            outcome,
            delay: Some(delay),
            trigger: None,
        });
    }

    /// Queue a response that is held open until the returned sender fires.
    ///
    /// Dropping the sender releases the call as well.
    pub fn push_run_with_trigger(&self, outcome: RunOutcome) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.queue.lock().push_back(ScriptedRun {
            outcome,
            delay: None,
            trigger: Some(rx),
        });
        tx
    }

    /// Script a response for any call whose `param` input equals `value`.
    /// Keyed responses take precedence over the global queue.
    pub fn respond_where(&self, param: &str, value: &str, outcome: RunOutcome) {
        self.respond_where_delayed(param, value, outcome, Duration::ZERO);
    }

    pub fn respond_where_delayed(
        &self,
        param: &str,
        value: &str,
        outcome: RunOutcome,
        delay: Duration,
    ) {
        self.keyed
            .lock()
            .entry((param.to_string(), value.to_string()))
            .or_default()
            .push_back(ScriptedRun {
                outcome,
                delay: (!delay.is_zero()).then_some(delay),
                trigger: None,
            });
    }

    pub fn calls(&self) -> Vec<RunCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn next_scripted(&self, inputs: &InputMap) -> Option<ScriptedRun> {
        {
            let mut keyed = self.keyed.lock();
            for ((param, value), responses) in keyed.iter_mut() {
                let matches = inputs
                    .get(param)
                    .map(|v| match v {
                        Value::String(s) => s == value,
                        other => other.to_string() == *value,
                    })
                    .unwrap_or(false);
                if matches {
                    if let Some(scripted) = responses.pop_front() {
                        return Some(scripted);
                    }
                }
            }
        }
        self.queue.lock().pop_front()
    }
}

/// A convenient successful [`RunResult`] whose extraction yields `text`.
pub fn ok_run(text: &str) -> RunOutcome {
    Ok(RunResult {
        external_run_id: Some(uuid::Uuid::new_v4().to_string()),
        status: RunStatus::Succeeded,
        outputs: serde_json::json!({ "outputs": { "text": text } }),
        elapsed_ms: 1,
        error_detail: None,
    })
}

#[async_trait]
impl WorkflowClient for MockWorkflowClient {
    async fn run(
        &self,
        _binding: &WorkflowBinding,
        inputs: &InputMap,
        timeout: Duration,
    ) -> RunOutcome {
        self.calls.lock().push(RunCall {
            inputs: inputs.clone(),
            timeout,
        });

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let Some(scripted) = self.next_scripted(inputs) else {
            return Err(RunError::new(
                TaskErrorKind::Protocol,
                "no scripted response for inputs",
            ));
        };

        if let Some(delay) = scripted.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(trigger) = scripted.trigger {
            // A dropped sender releases the call too.
            let _ = trigger.await;
        }

        scripted.outcome
    }

    async fn fetch_schema(
        &self,
        _base_url: &str,
        _credential: &str,
        _timeout: Duration,
    ) -> SchemaResult {
        self.schema
            .lock()
            .clone()
            .unwrap_or_else(|| Ok(ParameterSchema::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extraction_prefers_outputs_then_output_then_result() {
        assert_eq!(
            extract_output(&json!({"outputs": {"text": "A"}, "output": "B"})),
            "A"
        );
        assert_eq!(extract_output(&json!({"output": "B", "result": "C"})), "B");
        assert_eq!(extract_output(&json!({"result": "C"})), "C");
        assert_eq!(extract_output(&json!({"unrelated": 1})), NO_OUTPUT);
    }

    #[test]
    fn extraction_descends_one_nested_outputs_level() {
        let payload = json!({"outputs": {"outputs": {"result": "A", "confidence": "0.9"}}});
        assert_eq!(extract_output(&payload), "A\n0.9");
    }

    #[test]
    fn extraction_filters_reserved_keys_and_joins_in_order() {
        let payload = json!({"outputs": {
            "status": "succeeded",
            "answer": "first",
            "elapsed_time": 1.5,
            "note": "second",
            "total_tokens": 42
        }});
        assert_eq!(extract_output(&payload), "first\nsecond");
    }

    #[test]
    fn extraction_stringifies_non_string_scalars() {
        let payload = json!({"outputs": {"count": 3, "flag": true}});
        assert_eq!(extract_output(&payload), "3\ntrue");
    }

    #[test]
    fn empty_extraction_yields_sentinel() {
        assert_eq!(extract_output(&json!({"outputs": {}})), NO_OUTPUT);
        assert_eq!(
            extract_output(&json!({"outputs": {"status": "succeeded"}})),
            NO_OUTPUT
        );
    }

    #[test]
    fn run_response_parses_nested_data_envelope() {
        let body = r#"{
            "workflow_run_id": "wr-123",
            "task_id": "t-1",
            "data": {
                "id": "run-9",
                "status": "succeeded",
                "outputs": {"text": "hello"},
                "elapsed_time": 2.5
            }
        }"#;
        let result = parse_run_response(body).unwrap();
        assert_eq!(result.external_run_id.as_deref(), Some("wr-123"));
        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(result.elapsed_ms, 2500);
        assert_eq!(extract_output(&result.outputs), "hello");
    }

    #[test]
    fn run_response_maps_failed_status() {
        let body = r#"{"data": {"id": "run-1", "status": "failed", "error": "boom"}}"#;
        let result = parse_run_response(body).unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error_detail.as_deref(), Some("boom"));
    }

    #[test]
    fn malformed_body_is_protocol() {
        let err = parse_run_response("not json").unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Protocol);
        let err = parse_run_response("[1,2,3]").unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Protocol);
    }

    #[test]
    fn http_status_mapping_follows_the_table() {
        use reqwest::StatusCode;
        for code in [500u16, 502, 503, 408, 429] {
            let err = map_http_status(StatusCode::from_u16(code).unwrap(), "");
            assert_eq!(err.kind, TaskErrorKind::Retryable, "code {code}");
        }
        for code in [400u16, 401, 403, 404, 422] {
            let err = map_http_status(StatusCode::from_u16(code).unwrap(), "");
            assert_eq!(err.kind, TaskErrorKind::Permanent, "code {code}");
        }
    }

    fn test_binding() -> WorkflowBinding {
        WorkflowBinding {
            id: crate::binding::BindingId::new(),
            name: "test".to_string(),
            description: None,
            base_url: "https://workflows.example.com/v1".to_string(),
            credential: "key".to_string(),
            schema: None,
            synced_at: None,
            active: true,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn mock_pops_queued_responses_in_order() {
        let mock = MockWorkflowClient::new();
        mock.push_run(ok_run("first"));
        mock.push_run(ok_run("second"));

        let binding = test_binding();
        let inputs = InputMap::new();
        let r1 = mock
            .run(&binding, &inputs, Duration::from_secs(1))
            .await
            .unwrap();
        let r2 = mock
            .run(&binding, &inputs, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(extract_output(&r1.outputs), "first");
        assert_eq!(extract_output(&r2.outputs), "second");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_keyed_responses_take_precedence() {
        let mock = MockWorkflowClient::new();
        mock.push_run(ok_run("generic"));
        mock.respond_where("q", "special", ok_run("keyed"));

        let binding = test_binding();
        let mut inputs = InputMap::new();
        inputs.insert("q".to_string(), json!("special"));
        let r = mock
            .run(&binding, &inputs, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(extract_output(&r.outputs), "keyed");
    }

    #[tokio::test]
    async fn mock_unscripted_call_fails_protocol() {
        let mock = MockWorkflowClient::new();
        let err = mock
            .run(&test_binding(), &InputMap::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Protocol);
    }

    #[tokio::test]
    async fn mock_trigger_holds_call_open() {
        let mock = MockWorkflowClient::new();
        let trigger = mock.push_run_with_trigger(ok_run("held"));

        let binding = test_binding();
        let inputs = InputMap::new();
        let call = {
            let mock = mock.clone();
            tokio::spawn(async move { mock.run(&binding, &inputs, Duration::from_secs(5)).await })
        };

        // The call is in flight until the trigger fires.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();
        let result = call.await.unwrap().unwrap();
        assert_eq!(extract_output(&result.outputs), "held");
        assert_eq!(mock.in_flight_count(), 0);
    }
}

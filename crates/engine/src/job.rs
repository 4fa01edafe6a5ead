//! Job dispatch.
//!
//! A [`JobClient`] opens one event channel, queues the workflow over HTTP and
//! reads events until the job reaches a terminal state. The watchdog, the
//! submission call and the event stream race inside a single `select!` loop,
//! so a job resolves exactly once.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, Connector, EventChannel, ListenerId, Listeners};
use crate::error::{JobError, Result};
use crate::event::{Artifact, EngineEvent, EventKind};
use crate::http::EngineApi;

/// Default watchdog for a whole job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(600);

/// Lifecycle of a job client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Connecting,
    Submitting,
    Streaming,
    Succeeded,
    Failed,
}

/// Terminal output of a successful job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub prompt_id: String,
    /// Node whose `executed` event finished the job.
    pub node: String,
    pub artifacts: Vec<Artifact>,
}

/// Runs one job against the engine.
pub struct JobClient {
    client_id: String,
    api: Arc<dyn EngineApi>,
    connector: Arc<dyn Connector>,
    listeners: Listeners,
    end_marker: Option<String>,
    channel: Option<EventChannel>,
    phase: JobPhase,
    closed: bool,
}

impl JobClient {
    pub fn new(
        api: Arc<dyn EngineApi>,
        connector: Arc<dyn Connector>,
        client_id: impl Into<String>,
    ) -> Result<Self> {
        if api.endpoint().host().is_empty() {
            return Err(JobError::MissingHost);
        }
        let client_id = client_id.into();
        if client_id.trim().is_empty() {
            return Err(JobError::MissingClientId);
        }
        Ok(Self {
            client_id,
            api,
            connector,
            listeners: Listeners::new(),
            end_marker: None,
            channel: None,
            phase: JobPhase::Idle,
            closed: false,
        })
    }

    /// Only an `executed` event from `node` ends the job.
    pub fn with_end_marker(mut self, node: Option<String>) -> Self {
        self.end_marker = node.filter(|n| !n.is_empty());
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.on(kind, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.listeners.off(id)
    }

    /// Submit `payload` and wait for its outcome.
    ///
    /// The client is closed afterwards whatever the outcome; a second call
    /// fails with [`JobError::AlreadyClosed`].
    pub async fn submit(&mut self, payload: Value, timeout: Duration) -> Result<JobResult> {
        if self.closed {
            return Err(JobError::AlreadyClosed);
        }
        if is_empty_payload(&payload) {
            self.phase = JobPhase::Failed;
            return Err(JobError::MissingPayload);
        }

        let outcome = self.dispatch(&payload, timeout).await;
        match &outcome {
            Ok(result) => {
                self.phase = JobPhase::Succeeded;
                info!(
                    job = %self.client_id,
                    prompt_id = %result.prompt_id,
                    artifacts = result.artifacts.len(),
                    "job finished"
                );
            }
            Err(e) => {
                self.phase = JobPhase::Failed;
                warn!(job = %self.client_id, error = %e, "job failed");
            }
        }
        self.close().await;
        outcome
    }

    async fn dispatch(&mut self, payload: &Value, timeout: Duration) -> Result<JobResult> {
        self.phase = JobPhase::Connecting;
        let url = self.api.endpoint().ws_url(&self.client_id);
        let channel =
            EventChannel::open(self.connector.as_ref(), &url, self.listeners.clone()).await?;
        let channel = self.channel.insert(channel);

        self.phase = JobPhase::Submitting;
        let api = Arc::clone(&self.api);
        let submission = api.submit(&self.client_id, payload);
        let watchdog = tokio::time::sleep(timeout);
        tokio::pin!(submission, watchdog);
        let mut prompt_id: Option<String> = None;

        loop {
            tokio::select! {
                biased;

                () = &mut watchdog => return Err(JobError::Timeout(timeout)),

                accepted = &mut submission, if prompt_id.is_none() => {
                    let id = accepted?;
                    debug!(job = %self.client_id, prompt_id = %id, "job queued");
                    prompt_id = Some(id);
                    self.phase = JobPhase::Streaming;
                }

                next = channel.next_event() => match next {
                    ChannelEvent::Event(event) => {
                        let verdict =
                            interpret(event, self.end_marker.as_deref(), prompt_id.as_deref());
                        if let Some(outcome) = verdict {
                            return outcome;
                        }
                    }
                    ChannelEvent::Closed => return Err(JobError::UnexpectedClose),
                    ChannelEvent::Failed(e) => return Err(e.into()),
                },
            }
        }
    }

    /// Release the event channel. Idempotent.
    pub async fn close(&mut self) {
        self.closed = true;
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }
}

impl std::fmt::Debug for JobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobClient")
            .field("client_id", &self.client_id)
            .field("end_marker", &self.end_marker)
            .field("phase", &self.phase)
            .field("closed", &self.closed)
            .finish()
    }
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Decide whether `event` ends the job. `None` means keep streaming.
fn interpret(
    event: EngineEvent,
    end_marker: Option<&str>,
    prompt_id: Option<&str>,
) -> Option<Result<JobResult>> {
    match event {
        EngineEvent::Status(_)
        | EngineEvent::ExecutionStart(_)
        | EngineEvent::ExecutionCached(_)
        | EngineEvent::Progress(_)
        | EngineEvent::Executing(_) => None,
        EngineEvent::Executed(None) => Some(Err(JobError::InvalidExecutedData)),
        EngineEvent::Executed(Some(data)) => {
            if end_marker.is_some_and(|node| node != data.node) {
                debug!(node = %data.node, "intermediate node executed");
                return None;
            }
            let prompt_id = if data.prompt_id.is_empty() {
                prompt_id.unwrap_or_default().to_string()
            } else {
                data.prompt_id
            };
            Some(Ok(JobResult {
                prompt_id,
                node: data.node,
                artifacts: data.output.images,
            }))
        }
        EngineEvent::ExecutionError(message) | EngineEvent::Error(message) => {
            Some(Err(JobError::ExecutionError(message)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{self, FakeEngine, ScriptedConnector, Step};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client(engine: &Arc<FakeEngine>, connector: &Arc<ScriptedConnector>) -> JobClient {
        JobClient::new(engine.clone(), connector.clone(), "client-1").unwrap()
    }

    fn payload() -> Value {
        json!({"3": {"inputs": {"seed": 1}}})
    }

    #[tokio::test]
    async fn resolves_with_artifacts() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new().with_script(vec![
            fake::status(),
            fake::progress(1, 2),
            fake::progress(2, 2),
            fake::executed("9", &["a.png", "b.png"]),
        ]));
        let mut job = client(&engine, &connector).with_end_marker(Some("9".into()));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        job.on(EventKind::Progress, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = job.submit(payload(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.artifacts.len(), 2);
        assert_eq!(result.artifacts[0].filename, "a.png");
        assert_eq!(result.node, "9");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(job.phase(), JobPhase::Succeeded);
        assert_eq!(connector.closes(), 1);
        assert_eq!(connector.urls(), vec!["ws://engine.test:8188/ws?clientId=client-1"]);

        let submissions = engine.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0], ("client-1".to_string(), payload()));
    }

    #[tokio::test]
    async fn execution_error_closes_once() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(
            ScriptedConnector::new()
                .with_script(vec![fake::status(), fake::execution_error("out of memory")]),
        );
        let mut job = client(&engine, &connector);

        let err = job.submit(payload(), Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, JobError::ExecutionError("out of memory".into()));
        job.close().await;
        assert_eq!(connector.closes(), 1);
        assert_eq!(job.phase(), JobPhase::Failed);

        let again = job.submit(payload(), Duration::from_secs(5)).await;
        assert_eq!(again, Err(JobError::AlreadyClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_terminal_event() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new().with_script(vec![fake::status()]));
        let mut job = client(&engine, &connector);

        let err = job.submit(payload(), Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, JobError::Timeout(Duration::from_secs(5)));
        assert_eq!(connector.closes(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(connector.closes(), 1);
        assert!(job.is_closed());
    }

    #[tokio::test]
    async fn unexpected_close() {
        let engine = Arc::new(FakeEngine::new());
        let connector =
            Arc::new(ScriptedConnector::new().with_script(vec![fake::status(), Step::Close]));
        let mut job = client(&engine, &connector);

        let err = job.submit(payload(), Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, JobError::UnexpectedClose);
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn transport_failure() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(
            ScriptedConnector::new().with_script(vec![Step::Fail("connection reset".into())]),
        );
        let mut job = client(&engine, &connector);

        let err = job.submit(payload(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, JobError::TransportError(m) if m.contains("connection reset")));
    }

    #[tokio::test]
    async fn rejected_submission_closes_channel() {
        let engine = Arc::new(FakeEngine::rejecting(JobError::ApiCallFailed(
            "status 400".into(),
        )));
        let connector = Arc::new(ScriptedConnector::new());
        let mut job = client(&engine, &connector);

        let err = job.submit(payload(), Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, JobError::ApiCallFailed("status 400".into()));
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn end_marker_skips_intermediate_nodes() {
        let script = || {
            vec![
                fake::executed("5", &["preview.png"]),
                fake::executed("9", &["final.png"]),
            ]
        };
        let engine = Arc::new(FakeEngine::new());

        let connector = Arc::new(ScriptedConnector::new().with_script(script()));
        let mut marked = client(&engine, &connector).with_end_marker(Some("9".into()));
        let result = marked.submit(payload(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.artifacts[0].filename, "final.png");

        let connector = Arc::new(ScriptedConnector::new().with_script(script()));
        let mut unmarked = client(&engine, &connector);
        let result = unmarked.submit(payload(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.artifacts[0].filename, "preview.png");
    }

    #[tokio::test]
    async fn executed_without_data_is_invalid() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(
            ScriptedConnector::new().with_script(vec![Step::event(json!({"type": "executed"}))]),
        );
        let mut job = client(&engine, &connector);
        let err = job.submit(payload(), Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, JobError::InvalidExecutedData);
    }

    #[tokio::test]
    async fn rejects_missing_inputs() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new());

        let err = JobClient::new(engine.clone(), connector.clone(), " ").unwrap_err();
        assert_eq!(err, JobError::MissingClientId);

        let mut job = client(&engine, &connector);
        let err = job.submit(Value::Null, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, JobError::MissingPayload);
        assert!(connector.urls().is_empty());
        assert!(engine.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_exactly_once_under_races() {
        let terminals: Vec<(Step, bool)> = vec![
            (fake::executed("9", &["a.png"]), true),
            (fake::execution_error("boom"), false),
            (Step::Close, false),
            (Step::Fail("reset".into()), false),
        ];
        for (index, (terminal, succeeds)) in terminals.into_iter().enumerate() {
            for (event_ms, timeout_ms) in [(10, 50), (50, 10), (0, 1), (40, 41), (41, 40)] {
                let engine = Arc::new(FakeEngine::new());
                let connector = Arc::new(ScriptedConnector::new().with_script(vec![
                    fake::progress(1, 3),
                    Step::Delay(Duration::from_millis(event_ms)),
                    terminal.clone(),
                    fake::execution_error("late"),
                    Step::Close,
                ]));
                let mut job = client(&engine, &connector);
                let timeout = Duration::from_millis(timeout_ms);
                let outcome = job.submit(payload(), timeout).await;

                if event_ms >= timeout_ms {
                    assert_eq!(outcome, Err(JobError::Timeout(timeout)), "case {index}");
                } else {
                    assert_eq!(outcome.is_ok(), succeeds, "case {index}: {outcome:?}");
                    assert_ne!(outcome, Err(JobError::ExecutionError("late".into())));
                }
                assert_eq!(connector.closes(), 1, "case {index}");
                assert_eq!(engine.submissions().len(), 1, "case {index}");
            }
        }
    }
}

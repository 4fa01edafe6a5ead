//! The model/tool conversation loop.
//!
//! [`Agent::execute`] calls the model one step at a time, runs the tool calls
//! it streams, appends each result to the conversation and calls the model
//! again, until the model stops or the iteration bound is reached.

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::model::{
    Backend, Chunk, ChunkKind, FinishReason, Message, ModelError, ModelRequest, StreamEvent,
    ToolCall, ToolResult,
};
use crate::tools::ToolHost;

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Callbacks fired while a run streams.
///
/// Output is split into segments of one [`ChunkKind`]; every started segment
/// is ended before the next one starts and before the model step returns.
pub trait AgentObserver: Send {
    fn on_iteration(&mut self, _iteration: usize) {}

    fn on_segment_start(&mut self, _kind: ChunkKind) {}

    fn on_segment_end(&mut self, _kind: ChunkKind) {}

    fn on_chunk(&mut self, _chunk: &Chunk) {}
}

impl AgentObserver for () {}

/// Append-only message history of one run.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl ConversationState {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// A run that ended with the model stopping.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Text of the final model step.
    pub text: String,
    pub messages: Vec<Message>,
    /// Model calls made.
    pub iterations: usize,
}

#[derive(Debug, Default)]
struct Segmenter {
    current: Option<ChunkKind>,
}

impl Segmenter {
    fn observe(&mut self, kind: ChunkKind, observer: &mut dyn AgentObserver) {
        if self.current == Some(kind) {
            return;
        }
        if let Some(previous) = self.current.replace(kind) {
            observer.on_segment_end(previous);
        }
        observer.on_segment_start(kind);
    }

    fn finish(&mut self, observer: &mut dyn AgentObserver) {
        if let Some(previous) = self.current.take() {
            observer.on_segment_end(previous);
        }
    }
}

/// Drives a backend and a tool host through a bounded conversation.
pub struct Agent<B, H> {
    backend: B,
    tools: H,
    max_iterations: usize,
}

impl<B: Backend, H: ToolHost> Agent<B, H> {
    pub fn new(backend: B, tools: H) -> Self {
        Self {
            backend,
            tools,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn tools(&self) -> &H {
        &self.tools
    }

    /// Run the conversation to completion.
    ///
    /// Fails with [`AgentError::MaxIterationsExceeded`] when the model has
    /// not stopped after `max_iterations` calls.
    pub async fn execute(
        &self,
        messages: Vec<Message>,
        observer: &mut dyn AgentObserver,
    ) -> Result<RunOutcome, AgentError> {
        let mut state = ConversationState::new(messages);

        for iteration in 1..=self.max_iterations {
            observer.on_iteration(iteration);
            let specs = self.tools.specs();
            let mut stream = self
                .backend
                .stream(ModelRequest {
                    messages: state.messages(),
                    tools: &specs,
                    max_steps: 1,
                })
                .await?;

            let mut segments = Segmenter::default();
            let mut text = String::new();
            let mut finish = None;
            while let Some(event) = stream.next().await {
                let chunk = match event {
                    Ok(StreamEvent::Chunk(chunk)) => chunk,
                    Ok(StreamEvent::Finish(reason)) => {
                        finish = Some(reason);
                        break;
                    }
                    Err(e) => {
                        segments.finish(observer);
                        return Err(e.into());
                    }
                };
                segments.observe(chunk.kind(), observer);
                observer.on_chunk(&chunk);

                match chunk {
                    Chunk::TextDelta(delta) => text.push_str(&delta),
                    Chunk::ToolCall {
                        call,
                        provider_executed: false,
                    } => {
                        let result = self.run_tool(call).await;
                        segments.observe(ChunkKind::ToolResult, observer);
                        state.push(self.backend.replay_part(&result));
                        observer.on_chunk(&Chunk::ToolResult(result));
                    }
                    Chunk::ToolResult(result) => state.push(self.backend.replay_part(&result)),
                    _ => {}
                }
            }
            segments.finish(observer);

            match finish {
                Some(FinishReason::Stop) => {
                    if !text.is_empty() {
                        state.push(Message::assistant(text.clone()));
                    }
                    info!(iteration, "agent finished");
                    return Ok(RunOutcome {
                        text,
                        messages: state.into_messages(),
                        iterations: iteration,
                    });
                }
                Some(FinishReason::Error) => return Err(AgentError::ModelFinishedWithError),
                Some(reason) => debug!(iteration, ?reason, "model wants another step"),
                None => {
                    return Err(AgentError::Model(ModelError::InvalidResponse(
                        "stream ended without a finish reason".into(),
                    )));
                }
            }
        }

        warn!(max = self.max_iterations, "agent gave up");
        Err(AgentError::MaxIterationsExceeded(self.max_iterations))
    }

    async fn run_tool(&self, call: ToolCall) -> ToolResult {
        debug!(tool = %call.name, id = %call.id, "running tool call");
        match self.tools.execute(&call).await {
            Ok(output) => ToolResult::success(call, output),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool call failed");
                ToolResult::error(call, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkStream, Part, Role, ToolSpec};
    use crate::tools::{EmptyToolHost, ToolError};
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Step = Vec<Result<StreamEvent, ModelError>>;

    /// Replays one scripted step per call; keeps asking for more once empty.
    #[derive(Default)]
    struct ScriptedBackend {
        steps: Mutex<VecDeque<Step>>,
        history_lengths: Mutex<Vec<usize>>,
    }

    impl ScriptedBackend {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.history_lengths.lock().unwrap().len()
        }
    }

    impl Backend for ScriptedBackend {
        async fn stream(&self, request: ModelRequest<'_>) -> Result<ChunkStream, ModelError> {
            self.history_lengths
                .lock()
                .unwrap()
                .push(request.messages.len());
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![Ok(StreamEvent::Finish(FinishReason::ToolCalls))]);
            Ok(futures::stream::iter(step).boxed())
        }
    }

    struct EchoTools;

    impl ToolHost for EchoTools {
        fn specs(&self) -> Vec<ToolSpec> {
            vec![ToolSpec {
                name: "echo".into(),
                description: "Echo the input".into(),
                input_schema: json!({"type": "object"}),
            }]
        }

        async fn execute(&self, call: &ToolCall) -> Result<Value, ToolError> {
            match call.name.as_str() {
                "echo" => Ok(call.input.clone()),
                other => Err(ToolError::NotFound(other.to_string())),
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl AgentObserver for Recorder {
        fn on_segment_start(&mut self, kind: ChunkKind) {
            self.0.push(format!("start:{kind:?}"));
        }

        fn on_segment_end(&mut self, kind: ChunkKind) {
            self.0.push(format!("end:{kind:?}"));
        }
    }

    fn text(delta: &str) -> Result<StreamEvent, ModelError> {
        Ok(StreamEvent::Chunk(Chunk::TextDelta(delta.into())))
    }

    fn tool_call(name: &str, input: Value) -> Result<StreamEvent, ModelError> {
        Ok(StreamEvent::Chunk(Chunk::ToolCall {
            call: ToolCall {
                id: "call-1".into(),
                name: name.into(),
                input,
            },
            provider_executed: false,
        }))
    }

    fn finish(reason: FinishReason) -> Result<StreamEvent, ModelError> {
        Ok(StreamEvent::Finish(reason))
    }

    fn replayed_result(message: &Message) -> &ToolResult {
        message
            .parts
            .iter()
            .find_map(|part| match part {
                Part::ToolResult(result) => Some(result),
                _ => None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn tool_round_trip() {
        let backend = ScriptedBackend::new(vec![
            vec![
                text("Let me check."),
                tool_call("echo", json!({"x": 1})),
                finish(FinishReason::ToolCalls),
            ],
            vec![text("Done"), text("."), finish(FinishReason::Stop)],
        ]);
        let agent = Agent::new(backend, EchoTools);
        let mut recorder = Recorder::default();

        let outcome = agent
            .execute(vec![Message::user("hi")], &mut recorder)
            .await
            .unwrap();

        assert_eq!(outcome.text, "Done.");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(*agent.backend().history_lengths.lock().unwrap(), vec![1, 2]);
        assert_eq!(outcome.messages.len(), 3);
        assert_eq!(outcome.messages[1].role, Role::Assistant);
        let result = replayed_result(&outcome.messages[1]);
        assert!(!result.is_error());
        assert_eq!(result.output_text(), r#"{"x":1}"#);
        assert_eq!(
            recorder.0,
            vec![
                "start:Text",
                "end:Text",
                "start:ToolCall",
                "end:ToolCall",
                "start:ToolResult",
                "end:ToolResult",
                "start:Text",
                "end:Text",
            ]
        );
    }

    #[tokio::test]
    async fn failed_tool_is_replayed_as_error() {
        let backend = ScriptedBackend::new(vec![
            vec![tool_call("missing", json!({})), finish(FinishReason::ToolCalls)],
            vec![finish(FinishReason::Stop)],
        ]);
        let agent = Agent::new(backend, EchoTools);

        let outcome = agent.execute(vec![Message::user("hi")], &mut ()).await.unwrap();
        let result = replayed_result(&outcome.messages[1]);
        assert!(result.is_error());
        assert_eq!(result.output_text(), "tool not found: missing");
        assert_eq!(outcome.text, "");
        assert_eq!(outcome.messages.len(), 2);
    }

    #[tokio::test]
    async fn provider_executed_calls_are_not_rerun() {
        let call = ToolCall {
            id: "srv-1".into(),
            name: "web_search".into(),
            input: json!({"q": "rust"}),
        };
        let backend = ScriptedBackend::new(vec![vec![
            Ok(StreamEvent::Chunk(Chunk::ToolCall {
                call: call.clone(),
                provider_executed: true,
            })),
            Ok(StreamEvent::Chunk(Chunk::ToolResult(ToolResult::success(
                call,
                json!("found"),
            )))),
            text("Answer"),
            finish(FinishReason::Stop),
        ]]);
        let agent = Agent::new(backend, EmptyToolHost);

        let outcome = agent.execute(vec![Message::user("q")], &mut ()).await.unwrap();
        assert_eq!(outcome.messages.len(), 3);
        assert_eq!(replayed_result(&outcome.messages[1]).output_text(), "found");
    }

    #[tokio::test]
    async fn error_finish_rejects_without_retry() {
        let backend = ScriptedBackend::new(vec![vec![text("oops"), finish(FinishReason::Error)]]);
        let agent = Agent::new(backend, EchoTools);

        let err = agent.execute(vec![Message::user("hi")], &mut ()).await.unwrap_err();
        assert!(matches!(err, AgentError::ModelFinishedWithError));
        assert_eq!(agent.backend().calls(), 1);
    }

    #[tokio::test]
    async fn never_stopping_hits_the_bound() {
        let agent = Agent::new(ScriptedBackend::default(), EchoTools).with_max_iterations(3);

        let err = agent.execute(vec![Message::user("hi")], &mut ()).await.unwrap_err();
        assert!(matches!(err, AgentError::MaxIterationsExceeded(3)));
        assert_eq!(agent.backend().calls(), 3);
        // Nothing extra is appended for non-stop steps.
        assert_eq!(*agent.backend().history_lengths.lock().unwrap(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn stream_without_finish_is_invalid() {
        let backend = ScriptedBackend::new(vec![vec![text("cut off")]]);
        let agent = Agent::new(backend, EchoTools);
        let mut recorder = Recorder::default();

        let err = agent
            .execute(vec![Message::user("hi")], &mut recorder)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::Model(ModelError::InvalidResponse(_))
        ));
        assert_eq!(recorder.0, vec!["start:Text", "end:Text"]);
    }

    #[tokio::test]
    async fn stream_errors_propagate() {
        let backend = ScriptedBackend::new(vec![vec![
            text("partial"),
            Err(ModelError::Network("reset".into())),
        ]]);
        let agent = Agent::new(backend, EchoTools);

        let err = agent.execute(vec![Message::user("hi")], &mut ()).await.unwrap_err();
        assert!(matches!(err, AgentError::Model(ModelError::Network(_))));
    }
}

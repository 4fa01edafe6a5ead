//! Binding tool definitions to executable tools.
//!
//! [`ToolBinder::bind`] validates a [`ToolDefinition`] once, up front: every
//! substitution path must resolve inside the template, bounds must be
//! ordered and defaults must coerce. The resulting [`BoundTool`] shares the
//! pristine template and copies it for every execution.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use catalog::{ParameterSpec, RandomBitWidth, ToolDefinition};
use engine::{
    ArtifactSink, Connector, DEFAULT_JOB_TIMEOUT, EngineApi, EngineEvent, EventKind, JobClient,
    PassThroughSink,
};
use futures::StreamExt;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::params::{bounds_ordered, coerce, input_schema, random_value};
use super::template::TemplatePath;
use super::{BindError, ContentRef, ToolError, ToolReporter};
use crate::model::ToolSpec;

/// Artifacts fetched and stored at once.
pub const DEFAULT_ARTIFACT_CONCURRENCY: usize = 4;

/// Random width used when a randomizable parameter does not name one.
const FALLBACK_RANDOM_WIDTH: RandomBitWidth = RandomBitWidth::B32;

/// Shared collaborators for every bound tool.
#[derive(Clone)]
pub struct ToolBinder {
    api: Arc<dyn EngineApi>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn ArtifactSink>,
    timeout: Duration,
    concurrency: usize,
}

impl ToolBinder {
    pub fn new(api: Arc<dyn EngineApi>, connector: Arc<dyn Connector>) -> Self {
        Self {
            api,
            connector,
            sink: Arc::new(PassThroughSink),
            timeout: DEFAULT_JOB_TIMEOUT,
            concurrency: DEFAULT_ARTIFACT_CONCURRENCY,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn api(&self) -> &Arc<dyn EngineApi> {
        &self.api
    }

    pub fn bind(&self, definition: &ToolDefinition) -> Result<BoundTool, BindError> {
        let template_error = |reason: String| BindError::InvalidTemplate {
            tool: definition.name.clone(),
            reason,
        };
        definition.check().map_err(|e| template_error(e.to_string()))?;

        let mut names = HashSet::new();
        let mut parameters = Vec::with_capacity(definition.parameters.len());
        for spec in &definition.parameters {
            if !names.insert(spec.name.as_str()) {
                return Err(BindError::DuplicateParameter(spec.name.clone()));
            }
            parameters.push(bind_parameter(spec, &definition.workflow_template)?);
        }

        Ok(BoundTool {
            inner: Arc::new(BoundInner {
                name: definition.name.clone(),
                description: definition
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Run the '{}' workflow", definition.name)),
                schema: input_schema(&definition.parameters),
                template: definition.workflow_template.clone(),
                end_marker: definition.end_marker.clone(),
                parameters,
                binder: self.clone(),
            }),
        })
    }
}

impl std::fmt::Debug for ToolBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBinder")
            .field("engine", &self.api.endpoint().host())
            .field("timeout", &self.timeout)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[derive(Debug)]
enum ValueSource {
    Random(RandomBitWidth),
    /// Hidden from the model; always the default.
    Fixed,
    Caller,
}

#[derive(Debug)]
struct BoundParameter {
    spec: ParameterSpec,
    path: TemplatePath,
    default: Option<Value>,
    source: ValueSource,
}

fn bind_parameter(spec: &ParameterSpec, template: &Value) -> Result<BoundParameter, BindError> {
    let path_error = |reason: String| BindError::InvalidPath {
        parameter: spec.name.clone(),
        path: spec.substitution_path.clone(),
        reason,
    };
    let path: TemplatePath = spec.substitution_path.parse().map_err(path_error)?;
    path.check(template).map_err(path_error)?;

    if !bounds_ordered(spec) {
        return Err(BindError::InvertedBounds(spec.name.clone()));
    }

    let default = spec
        .default_value
        .as_ref()
        .map(|raw| coerce(spec, &Value::String(raw.clone())))
        .transpose()
        .map_err(|reason| BindError::InvalidDefault {
            parameter: spec.name.clone(),
            reason,
        })?;

    let source = if spec.randomizable {
        ValueSource::Random(spec.random_bit_width.unwrap_or(FALLBACK_RANDOM_WIDTH))
    } else if !spec.tool_parameter {
        ValueSource::Fixed
    } else {
        ValueSource::Caller
    };

    Ok(BoundParameter {
        spec: spec.clone(),
        path,
        default,
        source,
    })
}

/// The executable form of a tool definition. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BoundTool {
    inner: Arc<BoundInner>,
}

#[derive(Debug)]
struct BoundInner {
    name: String,
    description: String,
    schema: Value,
    template: Value,
    end_marker: Option<String>,
    parameters: Vec<BoundParameter>,
    binder: ToolBinder,
}

impl BoundTool {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.inner.name.clone(),
            description: self.inner.description.clone(),
            input_schema: self.inner.schema.clone(),
        }
    }

    /// Build the job payload for `input` from a fresh copy of the template.
    pub fn prepare(&self, input: &Value) -> Result<Value, ToolError> {
        let empty = Map::new();
        let args = match input {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(ToolError::InvalidInput("arguments must be a JSON object".into())),
        };

        let mut payload = self.inner.template.clone();
        for parameter in &self.inner.parameters {
            let name = &parameter.spec.name;
            let value = match parameter.source {
                ValueSource::Random(width) => {
                    let value = random_value(width)
                        .map_err(|e| ToolError::Execution(format!("random source: {e}")))?;
                    Some(json!(value))
                }
                ValueSource::Fixed => parameter.default.clone(),
                ValueSource::Caller => match args.get(name).filter(|v| !v.is_null()) {
                    Some(raw) => Some(coerce(&parameter.spec, raw).map_err(|reason| {
                        ToolError::InvalidParameter {
                            name: name.clone(),
                            reason,
                        }
                    })?),
                    None if parameter.default.is_some() => parameter.default.clone(),
                    None if parameter.spec.required => {
                        return Err(ToolError::MissingParameter(name.clone()));
                    }
                    None => None,
                },
            };
            if let Some(value) = value {
                parameter
                    .path
                    .write(&mut payload, value)
                    .map_err(|reason| ToolError::Execution(format!("{}: {reason}", parameter.path)))?;
            }
        }
        Ok(payload)
    }

    /// Run the tool and resolve its artifacts.
    ///
    /// Progress and each resolved artifact go to `reporter` as they happen.
    pub async fn execute(
        &self,
        input: &Value,
        reporter: &dyn ToolReporter,
    ) -> Result<Vec<ContentRef>, ToolError> {
        let payload = self.prepare(input)?;
        let binder = &self.inner.binder;
        let client_id = uuid::Uuid::new_v4().to_string();
        let mut job = JobClient::new(
            Arc::clone(&binder.api),
            Arc::clone(&binder.connector),
            client_id.clone(),
        )?
        .with_end_marker(self.inner.end_marker.clone());
        info!(tool = %self.inner.name, job = %client_id, "running tool");

        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, u64)>();
        job.on(EventKind::Progress, move |event| {
            if let EngineEvent::Progress(progress) = event {
                let _ = tx.send((progress.value, progress.max));
            }
        });

        let mut throttle = ProgressThrottle::default();
        let submit = job.submit(payload, binder.timeout);
        tokio::pin!(submit);
        let outcome = loop {
            tokio::select! {
                outcome = &mut submit => break outcome,
                Some((value, max)) = rx.recv() => throttle.report(reporter, value, max),
            }
        };
        while let Ok((value, max)) = rx.try_recv() {
            throttle.report(reporter, value, max);
        }
        let result = outcome?;

        let count = result.artifacts.len() as u64;
        let endpoint = binder.api.endpoint().clone();
        let mut resolved = futures::stream::iter(result.artifacts.into_iter().enumerate())
            .map(|(index, artifact)| {
                let sink = Arc::clone(&binder.sink);
                let url = endpoint.view_url(&artifact);
                async move {
                    let stored = sink.store(&artifact, &url).await;
                    (index, artifact, stored)
                }
            })
            .buffered(binder.concurrency);

        let mut contents = Vec::new();
        while let Some((index, artifact, stored)) = resolved.next().await {
            // Every attempt ticks, stored or not.
            let uri = match stored {
                Ok(uri) => {
                    let content = ContentRef::new(uri.clone(), artifact.filename);
                    reporter.content(&content);
                    contents.push(content);
                    Some(uri)
                }
                Err(e) => {
                    warn!(
                        tool = %self.inner.name,
                        filename = %artifact.filename,
                        error = %e,
                        "skipping artifact"
                    );
                    None
                }
            };
            reporter.progress(index as u64 + 1, Some(count), uri.as_deref());
        }

        if contents.is_empty() {
            return Err(ToolError::NoArtifactsProduced);
        }
        debug!(tool = %self.inner.name, artifacts = contents.len(), "tool finished");
        Ok(contents)
    }
}

/// Forwards job progress only when it moves forward.
#[derive(Debug, Default)]
struct ProgressThrottle {
    last: Option<u64>,
}

impl ProgressThrottle {
    fn report(&mut self, reporter: &dyn ToolReporter, value: u64, max: u64) {
        if self.last.is_some_and(|last| value <= last) {
            return;
        }
        self.last = Some(value);
        reporter.progress(value, Some(max), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::DataType;
    use engine::fake::{self, FakeEngine, ScriptedConnector, Step};
    use engine::{Artifact, JobError, SinkError};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<(u64, Option<u64>)>>,
        contents: Mutex<Vec<String>>,
    }

    impl ToolReporter for Recorder {
        fn progress(&self, current: u64, total: Option<u64>, _message: Option<&str>) {
            self.progress.lock().unwrap().push((current, total));
        }

        fn content(&self, content: &ContentRef) {
            self.contents.lock().unwrap().push(content.uri.clone());
        }
    }

    /// Fails for filenames containing "bad".
    struct PickySink;

    #[async_trait::async_trait]
    impl ArtifactSink for PickySink {
        async fn store(&self, artifact: &Artifact, _url: &str) -> Result<String, SinkError> {
            if artifact.filename.contains("bad") {
                return Err(SinkError::Upload("rejected".into()));
            }
            Ok(format!("https://cdn.test/{}", artifact.filename))
        }
    }

    fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "portrait",
            json!({
                "3": {"inputs": {"seed": 0, "steps": 20, "cfg": 7.0}},
                "5": {"inputs": {"width": 512, "height": 512}},
                "6": {"inputs": {"text": ""}}
            }),
        )
        .with_end_marker("9")
        .with_parameter(ParameterSpec::new("prompt", DataType::String, "6.inputs.text").required())
        .with_parameter(
            ParameterSpec::new("width", DataType::Integer, "5.inputs.width")
                .required()
                .with_int_bounds(Some(1), Some(1024)),
        )
        .with_parameter(
            ParameterSpec::new("cfg", DataType::Float, "3.inputs.cfg")
                .with_float_bounds(Some(1.0), Some(15.0))
                .with_default("6.5"),
        )
        .with_parameter(
            ParameterSpec::new("seed", DataType::Integer, "3.inputs.seed")
                .randomized(RandomBitWidth::B16),
        )
        .with_parameter(
            ParameterSpec::new("steps", DataType::Integer, "3.inputs.steps")
                .with_default("30")
                .hidden(),
        )
    }

    fn binder(engine: &Arc<FakeEngine>, connector: &Arc<ScriptedConnector>) -> ToolBinder {
        ToolBinder::new(engine.clone(), connector.clone())
    }

    #[test]
    fn clamps_into_payload() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new());
        let tool = binder(&engine, &connector).bind(&definition()).unwrap();

        let payload = tool
            .prepare(&json!({"prompt": "a cat", "width": 2000, "seed": 5, "steps": 1}))
            .unwrap();
        assert_eq!(payload["5"]["inputs"]["width"], json!(1024));
        assert_eq!(payload["6"]["inputs"]["text"], json!("a cat"));
        assert_eq!(payload["3"]["inputs"]["cfg"], json!(6.5));
        assert_eq!(payload["3"]["inputs"]["steps"], json!(30));
        assert_eq!(payload["5"]["inputs"]["height"], json!(512));
    }

    #[test]
    fn random_parameters_ignore_caller_input() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new());
        let tool = binder(&engine, &connector).bind(&definition()).unwrap();

        for _ in 0..50 {
            let payload = tool
                .prepare(&json!({"prompt": "x", "width": 64, "seed": 999_999}))
                .unwrap();
            let seed = payload["3"]["inputs"]["seed"].as_u64().unwrap();
            assert!(seed <= RandomBitWidth::B16.max_value());
        }
    }

    #[test]
    fn validation_errors_name_the_parameter() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new());
        let tool = binder(&engine, &connector).bind(&definition()).unwrap();

        assert_eq!(
            tool.prepare(&json!({"prompt": "x"})),
            Err(ToolError::MissingParameter("width".into()))
        );
        assert!(matches!(
            tool.prepare(&json!({"prompt": "x", "width": "wide"})),
            Err(ToolError::InvalidParameter { name, .. }) if name == "width"
        ));
        assert!(matches!(
            tool.prepare(&json!(["x"])),
            Err(ToolError::InvalidInput(_))
        ));
    }

    #[test]
    fn bind_rejects_bad_definitions() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new());
        let binder = binder(&engine, &connector);

        let bad_path = definition().with_parameter(ParameterSpec::new(
            "denoise",
            DataType::Float,
            "42.inputs.denoise",
        ));
        assert!(matches!(
            binder.bind(&bad_path),
            Err(BindError::InvalidPath { parameter, .. }) if parameter == "denoise"
        ));

        let inverted = definition().with_parameter(
            ParameterSpec::new("height", DataType::Integer, "5.inputs.height")
                .with_int_bounds(Some(10), Some(1)),
        );
        assert_eq!(
            binder.bind(&inverted).unwrap_err(),
            BindError::InvertedBounds("height".into())
        );

        let duplicate = definition()
            .with_parameter(ParameterSpec::new("prompt", DataType::String, "6.inputs.text"));
        assert_eq!(
            binder.bind(&duplicate).unwrap_err(),
            BindError::DuplicateParameter("prompt".into())
        );

        let bad_default = definition().with_parameter(
            ParameterSpec::new("height", DataType::Integer, "5.inputs.height").with_default("tall"),
        );
        assert!(matches!(
            binder.bind(&bad_default),
            Err(BindError::InvalidDefault { .. })
        ));
    }

    #[test]
    fn template_is_never_mutated() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new());
        let def = definition();
        let tool = binder(&engine, &connector).bind(&def).unwrap();

        tool.prepare(&json!({"prompt": "first", "width": 100})).unwrap();
        let second = tool.prepare(&json!({"prompt": "second", "width": 200})).unwrap();
        assert_eq!(second["6"]["inputs"]["text"], json!("second"));
        assert_eq!(tool.inner.template, def.workflow_template);
    }

    #[test]
    fn spec_carries_schema() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new());
        let spec = binder(&engine, &connector).bind(&definition()).unwrap().spec();
        assert_eq!(spec.name, "portrait");
        assert_eq!(spec.input_schema["required"], json!(["prompt", "width"]));

        let defaulted = definition().with_parameter(
            ParameterSpec::new("height", DataType::Integer, "5.inputs.height")
                .required()
                .with_default("768"),
        );
        let tool = binder(&engine, &connector).bind(&defaulted).unwrap();
        assert_eq!(tool.spec().input_schema["required"], json!(["prompt", "width"]));
        let payload = tool.prepare(&json!({"prompt": "x", "width": 64})).unwrap();
        assert_eq!(payload["5"]["inputs"]["height"], json!(768));
        assert!(spec.input_schema["properties"].get("seed").is_none());
        assert!(spec.input_schema["properties"].get("steps").is_none());
    }

    #[tokio::test]
    async fn streams_content_in_order() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new().with_script(vec![
            fake::status(),
            fake::progress(1, 2),
            fake::progress(1, 2),
            fake::progress(2, 2),
            fake::executed("9", &["a.png", "b.png"]),
        ]));
        let tool = binder(&engine, &connector).bind(&definition()).unwrap();
        let recorder = Recorder::default();

        let contents = tool
            .execute(&json!({"prompt": "a cat", "width": 2000}), &recorder)
            .await
            .unwrap();

        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].mime_type, "image/png");
        assert!(contents[0].uri.ends_with("/view?filename=a.png&subfolder=&type=output"));
        assert_eq!(
            *recorder.contents.lock().unwrap(),
            vec![contents[0].uri.clone(), contents[1].uri.clone()]
        );
        assert_eq!(
            *recorder.progress.lock().unwrap(),
            vec![(1, Some(2)), (2, Some(2)), (1, Some(2)), (2, Some(2))]
        );
        assert_eq!(connector.closes(), 1);

        let submissions = engine.submissions();
        assert_eq!(submissions[0].1["5"]["inputs"]["width"], json!(1024));
    }

    #[tokio::test]
    async fn partial_artifact_failures_are_skipped() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new().with_script(vec![fake::executed(
            "9",
            &["bad-1.png", "good.png", "bad-2.png"],
        )]));
        let tool = binder(&engine, &connector)
            .with_sink(Arc::new(PickySink))
            .bind(&definition())
            .unwrap();

        let recorder = Recorder::default();

        let contents = tool
            .execute(&json!({"prompt": "x", "width": 64}), &recorder)
            .await
            .unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].uri, "https://cdn.test/good.png");
        assert_eq!(
            *recorder.progress.lock().unwrap(),
            vec![(1, Some(3)), (2, Some(3)), (3, Some(3))]
        );
    }

    #[tokio::test]
    async fn all_artifacts_failing_is_an_error() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(
            ScriptedConnector::new().with_script(vec![fake::executed("9", &["bad.png"])]),
        );
        let tool = binder(&engine, &connector)
            .with_sink(Arc::new(PickySink))
            .bind(&definition())
            .unwrap();

        let err = tool
            .execute(&json!({"prompt": "x", "width": 64}), &crate::tools::NullReporter)
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::NoArtifactsProduced);
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn job_failures_propagate() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(
            ScriptedConnector::new().with_script(vec![fake::execution_error("CUDA out of memory")]),
        );
        let tool = binder(&engine, &connector).bind(&definition()).unwrap();

        let err = tool
            .execute(&json!({"prompt": "x", "width": 64}), &crate::tools::NullReporter)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ToolError::Job(JobError::ExecutionError("CUDA out of memory".into()))
        );
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn invalid_input_never_reaches_engine() {
        let engine = Arc::new(FakeEngine::new());
        let connector = Arc::new(ScriptedConnector::new());
        let tool = binder(&engine, &connector).bind(&definition()).unwrap();

        let err = tool
            .execute(&json!({"width": 64}), &crate::tools::NullReporter)
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::MissingParameter("prompt".into()));
        assert!(connector.urls().is_empty());
        assert!(engine.submissions().is_empty());
    }

    #[tokio::test]
    async fn concurrent_runs_do_not_share_payloads() {
        let engine = Arc::new(FakeEngine::new().with_submit_delay(Duration::from_millis(5)));
        let connector = Arc::new(ScriptedConnector::new());
        for _ in 0..2 {
            connector.push_script(vec![
                Step::Delay(Duration::from_millis(10)),
                fake::executed("9", &["out.png"]),
            ]);
        }
        let tool = binder(&engine, &connector).bind(&definition()).unwrap();

        let first_input = json!({"prompt": "first", "width": 100});
        let second_input = json!({"prompt": "second", "width": 200});
        let (first, second) = tokio::join!(
            tool.execute(&first_input, &crate::tools::NullReporter),
            tool.execute(&second_input, &crate::tools::NullReporter),
        );
        first.unwrap();
        second.unwrap();

        let mut prompts: Vec<(Value, Value)> = engine
            .submissions()
            .into_iter()
            .map(|(_, p)| (p["6"]["inputs"]["text"].clone(), p["5"]["inputs"]["width"].clone()))
            .collect();
        prompts.sort_by_key(|(text, _)| text.to_string());
        assert_eq!(
            prompts,
            vec![
                (json!("first"), json!(100)),
                (json!("second"), json!(200))
            ]
        );
        assert_eq!(connector.closes(), 2);
    }
}

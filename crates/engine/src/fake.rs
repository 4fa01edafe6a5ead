//! Scripted engine doubles.
//!
//! [`ScriptedConnector`] hands out transports that replay a fixed list of
//! frames; [`FakeEngine`] stands in for the HTTP side channel and records
//! every submission.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::channel::{Connector, Frame, Transport};
use crate::error::{JobError, TransportError};
use crate::http::{EngineApi, EngineEndpoint, Health};

/// One scripted transport action.
#[derive(Debug, Clone)]
pub enum Step {
    Text(String),
    Delay(Duration),
    Close,
    Fail(String),
}

impl Step {
    pub fn event(value: Value) -> Self {
        Self::Text(value.to_string())
    }
}

pub fn status() -> Step {
    Step::event(json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 1}}}}))
}

pub fn progress(value: u64, max: u64) -> Step {
    Step::event(json!({"type": "progress", "data": {"value": value, "max": max, "node": "3"}}))
}

pub fn executed(node: &str, filenames: &[&str]) -> Step {
    let images: Vec<Value> = filenames
        .iter()
        .map(|name| json!({"filename": name, "subfolder": "", "type": "output"}))
        .collect();
    Step::event(json!({
        "type": "executed",
        "data": {
            "node": node,
            "display_node": node,
            "output": {"images": images},
            "prompt_id": "prompt-1"
        }
    }))
}

pub fn execution_error(message: &str) -> Step {
    Step::event(json!({
        "type": "execution_error",
        "data": {"prompt_id": "prompt-1", "exception_message": message}
    }))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Connector replaying one queued script per connection.
///
/// Connections beyond the queued scripts get an empty script. A transport
/// whose script is exhausted waits forever.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    urls: Mutex<Vec<String>>,
    closes: Arc<AtomicUsize>,
    refuse: AtomicBool,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, steps: Vec<Step>) -> Self {
        self.push_script(steps);
        self
    }

    pub fn push_script(&self, steps: Vec<Step>) {
        lock(&self.scripts).push_back(steps);
    }

    /// Make every further connection attempt fail.
    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Number of transports closed so far.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// URLs connected to, in order.
    pub fn urls(&self) -> Vec<String> {
        lock(&self.urls).clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }
        lock(&self.urls).push(url.to_string());
        let steps = lock(&self.scripts).pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedTransport {
            steps: steps.into(),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct ScriptedTransport {
    steps: VecDeque<Step>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn recv(&mut self) -> Result<Frame, TransportError> {
        loop {
            match self.steps.pop_front() {
                Some(Step::Text(text)) => return Ok(Frame::Text(text)),
                Some(Step::Delay(delay)) => tokio::time::sleep(delay).await,
                Some(Step::Close) => return Ok(Frame::Closed),
                Some(Step::Fail(message)) => return Err(TransportError::Receive(message)),
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-process stand-in for the engine's HTTP API.
#[derive(Debug)]
pub struct FakeEngine {
    endpoint: EngineEndpoint,
    reply: Result<String, JobError>,
    submit_delay: Duration,
    health: Health,
    submissions: Mutex<Vec<(String, Value)>>,
}

impl FakeEngine {
    /// Accepts every job as `prompt-1`.
    pub fn new() -> Self {
        Self {
            endpoint: EngineEndpoint::fixed("engine.test:8188"),
            reply: Ok("prompt-1".to_string()),
            submit_delay: Duration::ZERO,
            health: Health::Healthy,
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Rejects every job with `error`.
    pub fn rejecting(error: JobError) -> Self {
        Self {
            reply: Err(error),
            ..Self::new()
        }
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn with_health(mut self, health: Health) -> Self {
        self.health = health;
        self
    }

    /// Every `(client_id, payload)` submitted so far.
    pub fn submissions(&self) -> Vec<(String, Value)> {
        lock(&self.submissions).clone()
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineApi for FakeEngine {
    fn endpoint(&self) -> &EngineEndpoint {
        &self.endpoint
    }

    async fn submit(&self, client_id: &str, payload: &Value) -> Result<String, JobError> {
        lock(&self.submissions).push((client_id.to_string(), payload.clone()));
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        self.reply.clone()
    }

    async fn health(&self) -> Health {
        self.health.clone()
    }
}

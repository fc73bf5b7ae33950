//! Scripted producer for driving the session engine in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{AgentMessage, EventProducer, EventStream, ExecuteRequest, ProducerError};

#[derive(Debug, Clone)]
pub enum MockStep {
    Message(Value),
    Delay(Duration),
    /// Waits until the gate is notified (or the execution is cancelled).
    Gate(Arc<Notify>),
    Fail(String),
    WaitForCancel,
}

#[derive(Debug, Default)]
pub struct MockProducer {
    scripts: Mutex<VecDeque<Vec<MockStep>>>,
    requests: Mutex<Vec<ExecuteRequest>>,
}

impl MockProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the script used by the next `execute` call. Calls without a
    /// queued script produce an empty stream.
    pub fn push_script(&self, steps: Vec<MockStep>) -> &Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(steps);
        self
    }

    pub fn requests(&self) -> Vec<ExecuteRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|request| request.prompt).collect()
    }
}

impl EventProducer for MockProducer {
    fn execute(&self, request: ExecuteRequest) -> EventStream {
        let steps = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_default();
        let cancel = request.cancel.clone();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let state = Some((VecDeque::from(steps), cancel));
        stream::unfold(state, |state| async move {
            let Some((mut steps, cancel)) = state else {
                return None;
            };
            loop {
                if cancel.is_cancelled() {
                    return Some((Err(ProducerError::Cancelled), None));
                }
                let Some(step) = steps.pop_front() else {
                    return None;
                };
                match step {
                    MockStep::Message(value) => {
                        return Some((Ok(AgentMessage::new(value)), Some((steps, cancel))));
                    }
                    MockStep::Delay(duration) => {
                        wait_or_cancel(&cancel, tokio::time::sleep(duration)).await;
                    }
                    MockStep::Gate(gate) => {
                        wait_or_cancel(&cancel, gate.notified()).await;
                    }
                    MockStep::Fail(message) => {
                        return Some((Err(ProducerError::Other(message)), None));
                    }
                    MockStep::WaitForCancel => {
                        cancel.cancelled().await;
                    }
                }
            }
        })
        .boxed()
    }
}

async fn wait_or_cancel(cancel: &CancellationToken, wait: impl std::future::Future<Output = ()>) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = wait => {}
    }
}

pub fn system_init(session_id: &str) -> Value {
    json!({
        "type": "system",
        "subtype": "init",
        "session_id": session_id,
    })
}

pub fn assistant_text(session_id: &str, text: &str) -> Value {
    json!({
        "type": "assistant",
        "session_id": session_id,
        "message": {
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
        },
    })
}

pub fn result_success(session_id: &str) -> Value {
    json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "session_id": session_id,
    })
}

// ABOUTME: Test utilities for switchyard-agent, including a scripted generation engine.
// ABOUTME: Used in tests to simulate engine turns without real API calls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::runtime::{EngineError, Generation, GenerationEngine, GenerationRequest};

type Responder = Arc<dyn Fn(&GenerationRequest) -> Result<Generation, EngineError> + Send + Sync>;

/// An engine that replays queued generations in order and records every request.
///
/// When the queue runs dry the fallback is used if one is set, otherwise the call fails
/// with a provider error so a test notices an unexpected extra turn.
pub struct ScriptedEngine {
    queue: Mutex<VecDeque<Result<Generation, EngineError>>>,
    fallback: Option<Responder>,
    delay: Option<Duration>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Generation>) -> Self {
        Self {
            queue: Mutex::new(script.into_iter().map(Ok).collect()),
            fallback: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with the same text.
    pub fn replying(text: &str) -> Self {
        let text = text.to_owned();
        Self::new(Vec::new()).with_fallback(move |_| Ok(Generation::text(text.clone())))
    }

    /// Answer every request with the given function once the queue is empty.
    pub fn with_fallback<F>(mut self, responder: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<Generation, EngineError> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(responder));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue an error as the next turn.
    pub fn push_error(&self, error: EngineError) {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match (next, &self.fallback) {
            (Some(turn), _) => turn,
            (None, Some(responder)) => responder(&request),
            (None, None) => Err(EngineError::ProviderError(
                "scripted engine has no turns left".to_string(),
            )),
        }
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }
}

//! In-process generator for driving sessions step by step from tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::GenerationError;

use super::{Delta, DeltaSink, GenerationRequest, Generator};

pub(crate) enum Step {
    Delta(String),
    Done(String),
    Fail(String),
    /// Return `Ok` without a terminal delta.
    End,
}

/// Each call to [`ScriptedGenerator::script`] queues one generation run;
/// `stream` calls consume runs in order and block on their steps.
#[derive(Default)]
pub(crate) struct ScriptedGenerator {
    runs: Mutex<VecDeque<mpsc::UnboundedReceiver<Step>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

#[derive(Clone)]
pub(crate) struct Script {
    tx: mpsc::UnboundedSender<Step>,
}

impl Script {
    pub fn delta(&self, text: &str) -> &Self {
        let _ = self.tx.send(Step::Delta(text.to_string()));
        self
    }

    pub fn done(&self) {
        let _ = self.tx.send(Step::Done(String::new()));
    }

    pub fn done_with(&self, text: &str) {
        let _ = self.tx.send(Step::Done(text.to_string()));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.tx.send(Step::Fail(reason.to_string()));
    }

    pub fn end(&self) {
        let _ = self.tx.send(Step::End);
    }
}

impl ScriptedGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self) -> Script {
        let (tx, rx) = mpsc::unbounded_channel();
        self.runs.lock().push_back(rx);
        Script { tx }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn stream(
        &self,
        request: GenerationRequest,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<(), GenerationError> {
        self.requests.lock().push(request);
        let next = self.runs.lock().pop_front();
        let Some(mut steps) = next else {
            return Err(GenerationError::Backend("no scripted run queued".into()));
        };

        while let Some(step) = steps.recv().await {
            match step {
                Step::Delta(text) => on_delta(Delta::text(text))?,
                Step::Done(text) => {
                    on_delta(Delta::terminal(text))?;
                    return Ok(());
                }
                Step::Fail(reason) => return Err(GenerationError::Backend(reason)),
                Step::End => return Ok(()),
            }
        }
        // script handle dropped
        Ok(())
    }
}

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AdvisoryClient, AdvisoryMode, AdvisoryRequest, AdvisoryResponse};
use crate::errors::AdvisoryError;

type Scripted = Result<AdvisoryResponse, AdvisoryError>;

/// Deterministic advisory backend.
///
/// Scripted replies are consumed in order per mode. Once a script runs out the
/// stub answers assessments with its fixed confidence and returns fix requests
/// without a revision.
pub struct StubAdvisor {
    default_confidence: f64,
    assess: Mutex<VecDeque<Scripted>>,
    fix: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<AdvisoryRequest>>,
}

impl StubAdvisor {
    pub fn new(default_confidence: f64) -> Self {
        Self {
            default_confidence: default_confidence.clamp(0.0, 1.0),
            assess: Mutex::new(VecDeque::new()),
            fix: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Stub that approves every assessment.
    pub fn approving() -> Self {
        Self::new(1.0)
    }

    pub fn with_assessments(self, replies: impl IntoIterator<Item = Scripted>) -> Self {
        if let Ok(mut queue) = self.assess.lock() {
            queue.extend(replies);
        }
        self
    }

    pub fn with_fixes(self, replies: impl IntoIterator<Item = Scripted>) -> Self {
        if let Ok(mut queue) = self.fix.lock() {
            queue.extend(replies);
        }
        self
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<AdvisoryRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_scripted(&self, mode: AdvisoryMode) -> Option<Scripted> {
        let queue = match mode {
            AdvisoryMode::Assess => &self.assess,
            AdvisoryMode::FixSuggest => &self.fix,
        };
        queue.lock().ok().and_then(|mut q| q.pop_front())
    }
}

impl Default for StubAdvisor {
    fn default() -> Self {
        Self::approving()
    }
}

#[async_trait]
impl AdvisoryClient for StubAdvisor {
    fn name(&self) -> &str {
        "stub"
    }

    async fn advise(&self, request: &AdvisoryRequest) -> Result<AdvisoryResponse, AdvisoryError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        if let Some(reply) = self.next_scripted(request.mode) {
            return reply;
        }
        Ok(match request.mode {
            AdvisoryMode::Assess => AdvisoryResponse::with_confidence(self.default_confidence),
            AdvisoryMode::FixSuggest => AdvisoryResponse::default(),
        })
    }
}

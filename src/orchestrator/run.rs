//! Run state
//!
//! Everything one run accumulates: the intent, the candidate chain with the
//! verdict and failure of each candidate, the analyses and the repair
//! counter. Owned by a single `process` call and never shared.

use crate::execution_loop::{ErrorAnalysis, FailureDetail};
use crate::generation::QueryCandidate;
use crate::intent::IntentDecision;
use crate::orchestrator::RunStatus;
use crate::question::Question;
use crate::security::{ThreatCategory, ValidationVerdict};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Started,
    IntentResolved,
    Generated,
    Validated,
    Executed,
    Repairing,
    Explained,
    Terminal(RunStatus),
}

#[derive(Debug, Clone)]
pub struct CandidateRecord {
    pub candidate: QueryCandidate,
    pub verdict: Option<ValidationVerdict>,
    /// Why this candidate was sent to the critic, if it was.
    pub failure: Option<FailureDetail>,
}

#[derive(Debug)]
pub struct OrchestrationRun {
    pub id: Uuid,
    pub question: Question,
    pub state: RunState,
    pub intent: Option<IntentDecision>,
    pub chain: Vec<CandidateRecord>,
    pub analyses: Vec<ErrorAnalysis>,
    pub repairs: u32,
    pub max_repairs: u32,
    pub threats_seen: Vec<ThreatCategory>,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub stage_ms: BTreeMap<String, u64>,
}

impl OrchestrationRun {
    pub fn new(question: Question, max_repairs: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            question,
            state: RunState::Started,
            intent: None,
            chain: Vec::new(),
            analyses: Vec::new(),
            repairs: 0,
            max_repairs,
            threats_seen: Vec::new(),
            started_at: Utc::now(),
            started: Instant::now(),
            stage_ms: BTreeMap::new(),
        }
    }

    pub fn transition(&mut self, next: RunState) {
        debug!(run_id = %self.id, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    pub fn time_stage(&mut self, stage: &str, since: Instant) {
        *self.stage_ms.entry(stage.to_string()).or_insert(0) += since.elapsed().as_millis() as u64;
    }

    /// Append a candidate; its revision becomes its position in the chain.
    pub fn push_candidate(&mut self, mut candidate: QueryCandidate) {
        candidate.revision = self.chain.len() as u32;
        self.chain.push(CandidateRecord {
            candidate,
            verdict: None,
            failure: None,
        });
    }

    pub fn current(&self) -> Option<&CandidateRecord> {
        self.chain.last()
    }

    pub fn record_verdict(&mut self, verdict: ValidationVerdict) {
        for threat in &verdict.threats {
            if !self.threats_seen.contains(&threat.category) {
                self.threats_seen.push(threat.category);
            }
        }
        if let Some(record) = self.chain.last_mut() {
            record.candidate.cost_estimate = verdict.cost_estimate.clone();
            record.verdict = Some(verdict);
        }
    }

    pub fn record_failure(&mut self, failure: FailureDetail) {
        if let Some(record) = self.chain.last_mut() {
            record.failure = Some(failure);
        }
    }

    pub fn can_repair(&self) -> bool {
        self.repairs < self.max_repairs
    }

    pub fn consume_repair(&mut self) {
        self.repairs += 1;
    }

    /// The newest viable candidate that failed; repairs always start here.
    pub fn last_viable_failure(&self) -> Option<(&QueryCandidate, &FailureDetail)> {
        self.chain
            .iter()
            .rev()
            .filter(|r| r.candidate.is_viable())
            .find_map(|r| r.failure.as_ref().map(|f| (&r.candidate, f)))
    }

    /// Attach an analysis to the candidate it diagnosed. Analyses for
    /// revisions not in the chain are dropped.
    pub fn attach_analysis(&mut self, analysis: ErrorAnalysis) {
        if (analysis.failing_revision as usize) < self.chain.len() {
            self.analyses.push(analysis);
        }
    }

    pub fn last_verdict(&self) -> Option<&ValidationVerdict> {
        self.chain.iter().rev().find_map(|r| r.verdict.as_ref())
    }

    pub fn last_execution_failure(&self) -> Option<&str> {
        self.chain.iter().rev().find_map(|r| match &r.failure {
            Some(FailureDetail::Execution(f)) => Some(f.message.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionFailure;
    use crate::generation::CandidateOrigin;

    fn candidate(sql: &str, confidence: f64) -> QueryCandidate {
        let mut c = QueryCandidate::empty(99, CandidateOrigin::Generated, "");
        c.query = sql.into();
        c.confidence = confidence;
        c
    }

    #[test]
    fn test_revisions_follow_chain_position() {
        let mut run = OrchestrationRun::new(Question::new("q").unwrap(), 2);
        run.push_candidate(candidate("SELECT 1", 0.9));
        run.push_candidate(candidate("SELECT 2", 0.9));
        assert_eq!(run.chain[1].candidate.revision, 1);
    }

    #[test]
    fn test_last_viable_failure_skips_empty_repairs() {
        let mut run = OrchestrationRun::new(Question::new("q").unwrap(), 3);
        run.push_candidate(candidate("SELECT nme FROM t", 0.8));
        run.record_failure(FailureDetail::Execution(ExecutionFailure::new("column nme does not exist")));
        run.push_candidate(candidate("", 0.0));

        let (failing, failure) = run.last_viable_failure().unwrap();
        assert_eq!(failing.revision, 0);
        assert!(matches!(failure, FailureDetail::Execution(_)));
        assert_eq!(run.last_execution_failure(), Some("column nme does not exist"));
    }

    #[test]
    fn test_budget() {
        let mut run = OrchestrationRun::new(Question::new("q").unwrap(), 1);
        assert!(run.can_repair());
        run.consume_repair();
        assert!(!run.can_repair());
    }
}

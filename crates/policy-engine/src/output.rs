//! Output governance
//!
//! `apply_output` is the only way a result becomes visible. Every admitted
//! call appends exactly one history record; a refused call changes nothing.

use policy_lang::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use crate::error::GovernanceError;
use crate::types::{ExecutionContext, OutputHistory, OutputIds};

pub trait OutputPolicy: Send + Sync {
    fn id(&self) -> Uuid;

    fn output_history(&self) -> &[OutputHistory];

    /// Declared output names
    fn outputs(&self) -> &[String];

    /// Gate one release. On success the appended record is returned.
    fn apply_output(&mut self, context: &ExecutionContext, outputs: OutputIds)
        -> Result<OutputHistory, GovernanceError>;

    /// Audit view; never includes history contents
    fn public_state(&self) -> Result<Value, GovernanceError>;

    fn policy_code(&self) -> String;
}

/// Records every release unconditionally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicOutputPolicy {
    pub id: Uuid,
    pub output_history: Vec<OutputHistory>,
    pub outputs: Vec<String>,
    pub node_uid: Option<Uuid>,
}

impl BasicOutputPolicy {
    pub fn new(outputs: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            output_history: Vec::new(),
            outputs,
            node_uid: None,
        }
    }
}

impl OutputPolicy for BasicOutputPolicy {
    fn id(&self) -> Uuid {
        self.id
    }

    fn output_history(&self) -> &[OutputHistory] {
        &self.output_history
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn apply_output(
        &mut self,
        context: &ExecutionContext,
        outputs: OutputIds,
    ) -> Result<OutputHistory, GovernanceError> {
        let record = OutputHistory::new(outputs, &context.credentials);
        self.output_history.push(record.clone());
        info!(policy = %self.id, released = record.outputs.len(), "output released");
        Ok(record)
    }

    fn public_state(&self) -> Result<Value, GovernanceError> {
        Ok(Value::Map(BTreeMap::new()))
    }

    fn policy_code(&self) -> String {
        "(class OutputPolicy [OutputPolicy]\n  :doc \"records every release\")".to_string()
    }
}

/// Admits at most `limit` releases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPolicyExecuteCount {
    pub id: Uuid,
    pub output_history: Vec<OutputHistory>,
    pub outputs: Vec<String>,
    pub node_uid: Option<Uuid>,
    count: u64,
    limit: u64,
}

impl OutputPolicyExecuteCount {
    pub fn new(limit: u64, outputs: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            output_history: Vec::new(),
            outputs,
            node_uid: None,
            count: 0,
            limit,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.limit
    }

    /// Re-check what decoding cannot: `count <= limit`, one record per release
    pub fn check(&self) -> Result<(), GovernanceError> {
        if self.count > self.limit {
            return Err(GovernanceError::CorruptState(format!(
                "policy {} has count {} above limit {}",
                self.id, self.count, self.limit
            )));
        }
        if self.output_history.len() as u64 != self.count {
            return Err(GovernanceError::CorruptState(format!(
                "policy {} has count {} but {} history records",
                self.id,
                self.count,
                self.output_history.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
impl OutputPolicyExecuteCount {
    pub(crate) fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }
}

impl OutputPolicy for OutputPolicyExecuteCount {
    fn id(&self) -> Uuid {
        self.id
    }

    fn output_history(&self) -> &[OutputHistory] {
        &self.output_history
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn apply_output(
        &mut self,
        context: &ExecutionContext,
        outputs: OutputIds,
    ) -> Result<OutputHistory, GovernanceError> {
        if self.is_exhausted() {
            return Err(GovernanceError::Exhausted {
                count: self.count,
                limit: self.limit,
            });
        }
        let record = OutputHistory::new(outputs, &context.credentials);
        self.output_history.push(record.clone());
        self.count += 1;
        info!(policy = %self.id, count = self.count, limit = self.limit, "output released");
        Ok(record)
    }

    fn public_state(&self) -> Result<Value, GovernanceError> {
        let mut state = BTreeMap::new();
        state.insert("limit".to_string(), Value::Int(clamp(self.limit)));
        state.insert("count".to_string(), Value::Int(clamp(self.count)));
        Ok(Value::Map(state))
    }

    fn policy_code(&self) -> String {
        "(class OutputPolicyExecuteCount [OutputPolicy]\n  \
         :params [limit]\n  \
         :state {:count 0}\n  \
         :admit (< @count @limit)\n  \
         :on-admit {:count (+ @count 1)})"
            .to_string()
    }
}

fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// `OutputPolicyExecuteCount` with the limit fixed at one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPolicyExecuteOnce(OutputPolicyExecuteCount);

impl OutputPolicyExecuteOnce {
    pub fn new(outputs: Vec<String>) -> Self {
        Self(OutputPolicyExecuteCount::new(1, outputs))
    }

    pub fn count(&self) -> u64 {
        self.0.count()
    }

    pub fn limit(&self) -> u64 {
        self.0.limit()
    }

    pub fn check(&self) -> Result<(), GovernanceError> {
        if self.0.limit != 1 {
            return Err(GovernanceError::CorruptState(format!(
                "execute-once policy {} has limit {}",
                self.0.id, self.0.limit
            )));
        }
        self.0.check()
    }
}

impl OutputPolicy for OutputPolicyExecuteOnce {
    fn id(&self) -> Uuid {
        self.0.id
    }

    fn output_history(&self) -> &[OutputHistory] {
        self.0.output_history()
    }

    fn outputs(&self) -> &[String] {
        self.0.outputs()
    }

    fn apply_output(
        &mut self,
        context: &ExecutionContext,
        outputs: OutputIds,
    ) -> Result<OutputHistory, GovernanceError> {
        self.0.apply_output(context, outputs)
    }

    fn public_state(&self) -> Result<Value, GovernanceError> {
        self.0.public_state()
    }

    fn policy_code(&self) -> String {
        "(class OutputPolicyExecuteOnce [OutputPolicyExecuteCount]\n  :defaults {:limit 1})".to_string()
    }
}

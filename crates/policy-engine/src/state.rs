//! Persisted form of every policy kind

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::custom::{CustomInputPolicy, CustomOutputPolicy, CustomPolicy, CustomPolicyState};
use crate::error::GovernanceError;
use crate::input::{ExactMatch, InputPolicy};
use crate::output::{BasicOutputPolicy, OutputPolicy, OutputPolicyExecuteCount, OutputPolicyExecuteOnce};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolicyState {
    ExactMatch(ExactMatch),
    OutputPolicy(BasicOutputPolicy),
    OutputPolicyExecuteCount(OutputPolicyExecuteCount),
    OutputPolicyExecuteOnce(OutputPolicyExecuteOnce),
    CustomInput(CustomPolicyState),
    CustomOutput(CustomPolicyState),
}

impl PolicyState {
    pub fn kind(&self) -> &str {
        match self {
            PolicyState::ExactMatch(_) => "ExactMatch",
            PolicyState::OutputPolicy(_) => "OutputPolicy",
            PolicyState::OutputPolicyExecuteCount(_) => "OutputPolicyExecuteCount",
            PolicyState::OutputPolicyExecuteOnce(_) => "OutputPolicyExecuteOnce",
            PolicyState::CustomInput(s) | PolicyState::CustomOutput(s) => &s.unique_name,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            PolicyState::ExactMatch(p) => p.id(),
            PolicyState::OutputPolicy(p) => p.id(),
            PolicyState::OutputPolicyExecuteCount(p) => p.id(),
            PolicyState::OutputPolicyExecuteOnce(p) => p.id(),
            PolicyState::CustomInput(s) | PolicyState::CustomOutput(s) => s.id,
        }
    }

    /// Invariants a decoded state must still satisfy
    pub fn check(&self) -> Result<(), GovernanceError> {
        match self {
            PolicyState::OutputPolicyExecuteCount(p) => p.check(),
            PolicyState::OutputPolicyExecuteOnce(p) => p.check(),
            _ => Ok(()),
        }
    }
}

impl From<ExactMatch> for PolicyState {
    fn from(p: ExactMatch) -> Self {
        PolicyState::ExactMatch(p)
    }
}

impl From<BasicOutputPolicy> for PolicyState {
    fn from(p: BasicOutputPolicy) -> Self {
        PolicyState::OutputPolicy(p)
    }
}

impl From<OutputPolicyExecuteCount> for PolicyState {
    fn from(p: OutputPolicyExecuteCount) -> Self {
        PolicyState::OutputPolicyExecuteCount(p)
    }
}

impl From<OutputPolicyExecuteOnce> for PolicyState {
    fn from(p: OutputPolicyExecuteOnce) -> Self {
        PolicyState::OutputPolicyExecuteOnce(p)
    }
}

impl From<&CustomInputPolicy> for PolicyState {
    fn from(p: &CustomInputPolicy) -> Self {
        PolicyState::CustomInput(p.state().clone())
    }
}

impl From<&CustomOutputPolicy> for PolicyState {
    fn from(p: &CustomOutputPolicy) -> Self {
        PolicyState::CustomOutput(p.state().clone())
    }
}

impl From<&CustomPolicy> for PolicyState {
    fn from(p: &CustomPolicy) -> Self {
        match p {
            CustomPolicy::Input(p) => p.into(),
            CustomPolicy::Output(p) => p.into(),
        }
    }
}

use serde::{Deserialize, Serialize};

/// Agent lifecycle state.
///
/// The state machine enforces valid transitions:
///
/// ```text
/// Queued -> Running -> Done
///              |
///          Recovering{1} -> Recovering{2} -> ... -> Done
/// ```
///
/// `Recovering` is entered when a failed task's failure tasks replace the
/// agent's queue. The attempt counter is what the recovery budget limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentState {
    Queued,
    Running,
    Recovering { attempt: u32 },
    Done,
}

/// Events that trigger state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    /// First tick, or adoption of an already-running worker.
    Started,
    /// A task failed and its failure tasks took over the queue.
    Escalated,
    /// The queue ran out.
    Finished,
    Aborted,
}

impl AgentState {
    /// Apply a transition, returning the new state or an error if the
    /// transition is not valid from the current state.
    pub fn apply(&self, transition: Transition) -> Result<AgentState, String> {
        match (self, transition) {
            // --- Queued ---
            (AgentState::Queued, Transition::Started) => Ok(AgentState::Running),
            (AgentState::Queued, Transition::Aborted) => Ok(AgentState::Done),

            // --- Running ---
            (AgentState::Running, Transition::Escalated) => {
                Ok(AgentState::Recovering { attempt: 1 })
            }
            (AgentState::Running, Transition::Finished | Transition::Aborted) => {
                Ok(AgentState::Done)
            }

            // --- Recovering ---
            (AgentState::Recovering { attempt }, Transition::Escalated) => {
                Ok(AgentState::Recovering {
                    attempt: attempt + 1,
                })
            }
            (AgentState::Recovering { .. }, Transition::Finished | Transition::Aborted) => {
                Ok(AgentState::Done)
            }

            // --- Done ---
            (AgentState::Done, _) => Err(format!(
                "agent is done; cannot apply transition {:?}",
                transition
            )),

            _ => Err(format!(
                "invalid transition {:?} from state {:?}",
                transition, self
            )),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Done)
    }

    /// Escalations performed so far.
    pub fn recovery_attempts(&self) -> u32 {
        match self {
            AgentState::Recovering { attempt } => *attempt,
            _ => 0,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            AgentState::Queued => "queued",
            AgentState::Running => "running",
            AgentState::Recovering { .. } => "recovering",
            AgentState::Done => "done",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Recovering { attempt } => write!(f, "recovering (attempt {})", attempt),
            other => write!(f, "{}", other.label()),
        }
    }
}

// ABOUTME: Plan model for multi-step orchestration: sequential steps holding independent tasks.
// ABOUTME: PlanDocument is the strict JSON exchange format produced by the planner engine.

use serde::{Deserialize, Serialize};

/// A unit of work assigned to one named worker agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub description: String,
    #[serde(rename = "agent")]
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl PlanTask {
    pub fn new(description: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            agent_name: agent_name.into(),
            result: None,
        }
    }
}

/// A step of a plan. Tasks inside one step are mutually independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub objective: String,
    pub tasks: Vec<PlanTask>,
}

/// The wire shape the planner must return: a bare JSON object, no fencing, no prose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDocument {
    pub steps: Vec<PlanStep>,
    pub is_complete: bool,
}

impl PlanDocument {
    /// Parse planner output. Any wrapping around the object is rejected.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// JSON schema describing this document, suitable for a structured response format.
    pub fn json_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "steps": {
                    "type": "array",
                    "description": "Steps executed strictly in order",
                    "items": {
                        "type": "object",
                        "properties": {
                            "objective": {
                                "type": "string",
                                "description": "What this step contributes to the overall objective"
                            },
                            "tasks": {
                                "type": "array",
                                "description": "Independent tasks that may run in parallel within the step",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "description": {
                                            "type": "string",
                                            "description": "Actionable instruction for the agent"
                                        },
                                        "agent": {
                                            "type": "string",
                                            "description": "Name of one of the available agents"
                                        }
                                    },
                                    "required": ["description", "agent"]
                                }
                            }
                        },
                        "required": ["objective", "tasks"]
                    }
                },
                "isComplete": {
                    "type": "boolean",
                    "description": "Whether the objective is already fully achieved"
                }
            },
            "required": ["steps", "isComplete"]
        })
    }
}

/// A plan bound to the objective it was produced for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub objective: String,
    pub steps: Vec<PlanStep>,
    pub is_complete: bool,
}

impl Plan {
    pub fn from_document(objective: impl Into<String>, document: PlanDocument) -> Self {
        Self {
            objective: objective.into(),
            steps: document.steps,
            is_complete: document.is_complete,
        }
    }

    pub fn task_count(&self) -> usize {
        self.steps.iter().map(|s| s.tasks.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    #[serde(rename = "In Progress")]
    InProgress,
    Complete,
}

/// Accumulated outcome of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanResult {
    pub objective: String,
    pub steps: Vec<PlanStep>,
    pub result: String,
    pub status: PlanStatus,
}

impl PlanResult {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            steps: Vec::new(),
            result: String::new(),
            status: PlanStatus::InProgress,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == PlanStatus::Complete
    }
}

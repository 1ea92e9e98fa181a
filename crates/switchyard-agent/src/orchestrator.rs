// ABOUTME: Orchestrator: plans an objective with a planner agent, runs the plan's steps, and synthesizes.
// ABOUTME: Steps run in order; tasks inside a step run concurrently and the first failure aborts the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use switchyard_core::{
    EventBus, EventPayload, Plan, PlanDocument, PlanResult, PlanStatus, PlanStep, PlanTask,
};

use crate::agent::{Agent, AgentBuilder, AgentError};
use crate::prompt;
use crate::runtime::{GenerationConfig, GenerationEngine, ResponseFormat};

const EVENT_SOURCE: &str = "orchestrator";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("an engine is required unless both planner and synthesizer are supplied")]
    MissingEngine,

    #[error("duplicate worker agent name: {0}")]
    DuplicateAgent(String),

    #[error("failed to build the {role} agent: {source}")]
    AgentBuild {
        role: &'static str,
        #[source]
        source: AgentError,
    },

    #[error("planner failed: {0}")]
    Planner(#[source] AgentError),

    #[error("planner output is not a valid plan: {source}")]
    PlanParse {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("step {step_index} task {task_index} names unknown agent '{agent}'")]
    UnknownAgent {
        step_index: usize,
        task_index: usize,
        agent: String,
    },

    #[error("step {step_index} task {task_index} ({agent}) failed: {source}")]
    TaskFailed {
        step_index: usize,
        task_index: usize,
        agent: String,
        #[source]
        source: AgentError,
    },

    #[error("step {step_index} task {task_index} ({agent}) timed out after {after:?}")]
    TaskTimeout {
        step_index: usize,
        task_index: usize,
        agent: String,
        after: Duration,
    },

    #[error("synthesizer failed: {0}")]
    Synthesis(#[source] AgentError),

    #[error("run cancelled")]
    Cancelled,
}

impl OrchestratorError {
    /// Step index, task index, and agent name when the error is tied to one task.
    fn task_context(&self) -> (Option<usize>, Option<usize>, Option<String>) {
        match self {
            OrchestratorError::UnknownAgent {
                step_index,
                task_index,
                agent,
            }
            | OrchestratorError::TaskFailed {
                step_index,
                task_index,
                agent,
                ..
            }
            | OrchestratorError::TaskTimeout {
                step_index,
                task_index,
                agent,
                ..
            } => (Some(*step_index), Some(*task_index), Some(agent.clone())),
            _ => (None, None, None),
        }
    }
}

#[derive(Default)]
pub struct OrchestratorBuilder {
    engine: Option<Arc<dyn GenerationEngine>>,
    planner: Option<Arc<Agent>>,
    synthesizer: Option<Arc<Agent>>,
    workers: Vec<Arc<Agent>>,
    events: Option<EventBus>,
    task_timeout: Option<Duration>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine for the default planner and synthesizer.
    pub fn engine(mut self, engine: Arc<dyn GenerationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn planner(mut self, planner: impl Into<Arc<Agent>>) -> Self {
        self.planner = Some(planner.into());
        self
    }

    pub fn synthesizer(mut self, synthesizer: impl Into<Arc<Agent>>) -> Self {
        self.synthesizer = Some(synthesizer.into());
        self
    }

    pub fn worker(mut self, agent: impl Into<Arc<Agent>>) -> Self {
        self.workers.push(agent.into());
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Bound each task's run. Unset means tasks may take as long as they need.
    pub fn task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub async fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let mut workers = BTreeMap::new();
        for agent in self.workers {
            let name = agent.name().to_string();
            if workers.insert(name.clone(), agent).is_some() {
                return Err(OrchestratorError::DuplicateAgent(name));
            }
        }

        let planner = match self.planner {
            Some(planner) => planner,
            None => {
                let engine = self.engine.clone().ok_or(OrchestratorError::MissingEngine)?;
                default_agent(
                    prompt::PLANNER_NAME,
                    prompt::PLANNER_DESCRIPTION,
                    engine,
                    self.events.clone(),
                )
                .await
                .map_err(|source| OrchestratorError::AgentBuild {
                    role: "planner",
                    source,
                })?
            }
        };
        let synthesizer = match self.synthesizer {
            Some(synthesizer) => synthesizer,
            None => {
                let engine = self.engine.clone().ok_or(OrchestratorError::MissingEngine)?;
                default_agent(
                    prompt::SYNTHESIZER_NAME,
                    prompt::SYNTHESIZER_DESCRIPTION,
                    engine,
                    self.events.clone(),
                )
                .await
                .map_err(|source| OrchestratorError::AgentBuild {
                    role: "synthesizer",
                    source,
                })?
            }
        };

        tracing::info!(workers = workers.len(), "orchestrator ready");
        Ok(Orchestrator {
            planner,
            synthesizer,
            workers,
            events: self.events,
            task_timeout: self.task_timeout,
        })
    }
}

async fn default_agent(
    name: &str,
    description: &str,
    engine: Arc<dyn GenerationEngine>,
    events: Option<EventBus>,
) -> Result<Arc<Agent>, AgentError> {
    let mut builder = AgentBuilder::new(name).description(description).engine(engine);
    if let Some(events) = events {
        builder = builder.events(events);
    }
    Ok(Arc::new(builder.build().await?))
}

pub struct Orchestrator {
    planner: Arc<Agent>,
    synthesizer: Arc<Agent>,
    workers: BTreeMap<String, Arc<Agent>>,
    events: Option<EventBus>,
    task_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.keys().map(String::as_str).collect()
    }

    pub fn worker(&self, name: &str) -> Option<&Arc<Agent>> {
        self.workers.get(name)
    }

    /// Plan, execute, and synthesize one objective.
    pub async fn generate(&self, objective: &str) -> Result<PlanResult, OrchestratorError> {
        let run_id = Ulid::new();
        let span = tracing::info_span!("workflow", run = %run_id);
        async {
            tracing::info!(objective = %objective, "workflow started");
            self.publish(EventPayload::WorkflowStarted {
                objective: objective.to_string(),
            });

            match self.execute(objective).await {
                Ok(result) => {
                    tracing::info!(steps = result.steps.len(), "workflow finished");
                    self.publish(EventPayload::WorkflowFinished {
                        result: result.clone(),
                    });
                    Ok(result)
                }
                Err(err) => {
                    self.report(&err);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Like `generate`, returning only the synthesized text.
    pub async fn generate_str(&self, objective: &str) -> Result<String, OrchestratorError> {
        Ok(self.generate(objective).await?.result)
    }

    /// Like `generate`, abandoning the run as soon as `cancel` fires.
    pub async fn generate_with_cancel(
        &self,
        objective: &str,
        cancel: CancellationToken,
    ) -> Result<PlanResult, OrchestratorError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let err = OrchestratorError::Cancelled;
                self.report(&err);
                Err(err)
            }
            result = self.generate(objective) => result,
        }
    }

    /// Ask the planner for a plan covering the objective.
    pub async fn plan(&self, objective: &str) -> Result<Plan, OrchestratorError> {
        let capabilities: Vec<String> = self
            .workers
            .values()
            .map(|agent| {
                prompt::capability_listing(agent.name(), agent.description(), &agent.list_tools())
            })
            .collect();
        let config = GenerationConfig::structured(ResponseFormat::json_schema(
            "plan",
            PlanDocument::json_schema(),
        ));

        let raw = self
            .planner
            .generate_str(&prompt::plan_prompt(objective, &capabilities), Some(config))
            .await
            .map_err(OrchestratorError::Planner)?;
        let document = PlanDocument::parse(&raw)
            .map_err(|source| OrchestratorError::PlanParse { raw, source })?;
        let plan = Plan::from_document(objective, document);

        tracing::info!(steps = plan.steps.len(), tasks = plan.task_count(), "plan ready");
        if !plan.is_complete {
            tracing::warn!("planner reports the plan does not fully cover the objective");
        }
        Ok(plan)
    }

    /// Disconnect every agent's servers.
    pub async fn close(&self) {
        for agent in self.workers.values() {
            agent.close().await;
        }
        self.planner.close().await;
        self.synthesizer.close().await;
    }

    async fn execute(&self, objective: &str) -> Result<PlanResult, OrchestratorError> {
        let plan = self.plan(objective).await?;
        let mut result = PlanResult::new(objective);

        for (step_index, step) in plan.steps.into_iter().enumerate() {
            // Resolve every agent before starting any task of the step
            let assigned = step
                .tasks
                .iter()
                .enumerate()
                .map(|(task_index, task)| {
                    self.workers
                        .get(&task.agent_name)
                        .cloned()
                        .ok_or_else(|| OrchestratorError::UnknownAgent {
                            step_index,
                            task_index,
                            agent: task.agent_name.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            tracing::info!(step = step_index, tasks = step.tasks.len(), objective = %step.objective, "step started");
            self.publish(EventPayload::StepStarted {
                step_index,
                step: step.clone(),
            });

            let completed = result.steps.as_slice();
            let runs = step
                .tasks
                .iter()
                .cloned()
                .zip(assigned)
                .enumerate()
                .map(|(task_index, (task, agent))| {
                    self.run_task(objective, step_index, task_index, task, agent, completed)
                });
            let tasks = try_join_all(runs).await?;

            let executed = PlanStep {
                objective: step.objective,
                tasks,
            };
            tracing::info!(step = step_index, "step finished");
            self.publish(EventPayload::StepFinished {
                step_index,
                step: executed.clone(),
            });
            result.steps.push(executed);
        }

        let text = self
            .synthesizer
            .generate_str(&prompt::synthesis_prompt(objective, &result.steps), None)
            .await
            .map_err(OrchestratorError::Synthesis)?;
        result.result = text;
        result.status = PlanStatus::Complete;
        Ok(result)
    }

    async fn run_task(
        &self,
        objective: &str,
        step_index: usize,
        task_index: usize,
        mut task: PlanTask,
        agent: Arc<Agent>,
        completed: &[PlanStep],
    ) -> Result<PlanTask, OrchestratorError> {
        tracing::debug!(step = step_index, task = task_index, agent = %agent.name(), "task started");
        self.publish(EventPayload::TaskStarted {
            step_index,
            task_index,
            task: task.clone(),
        });

        let prompt = prompt::task_prompt(objective, &task.description, completed);
        let run = agent.generate_str(&prompt, None);
        let outcome = match self.task_timeout {
            Some(after) => tokio::time::timeout(after, run).await.map_err(|_| {
                OrchestratorError::TaskTimeout {
                    step_index,
                    task_index,
                    agent: task.agent_name.clone(),
                    after,
                }
            })?,
            None => run.await,
        };
        let text = outcome.map_err(|source| OrchestratorError::TaskFailed {
            step_index,
            task_index,
            agent: task.agent_name.clone(),
            source,
        })?;

        task.result = Some(text);
        tracing::debug!(step = step_index, task = task_index, "task finished");
        self.publish(EventPayload::TaskFinished {
            step_index,
            task_index,
            task: task.clone(),
        });
        Ok(task)
    }

    fn report(&self, err: &OrchestratorError) {
        let (step_index, task_index, agent) = err.task_context();
        tracing::error!(error = %err, step = ?step_index, task = ?task_index, agent = ?agent, "workflow failed");
        self.publish(EventPayload::WorkflowError {
            error: err.to_string(),
            step_index,
            task_index,
            agent,
        });
    }

    fn publish(&self, payload: EventPayload) {
        if let Some(events) = &self.events {
            events.publish(EVENT_SOURCE, payload);
        }
    }
}

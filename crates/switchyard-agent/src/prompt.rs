// ABOUTME: Prompt text for agents, the planner, and the synthesizer.
// ABOUTME: Renders worker capabilities and completed plan progress into plain text.

use switchyard_core::{PlanStep, ToolSpec};

pub const PLANNER_NAME: &str = "planner";
pub const SYNTHESIZER_NAME: &str = "synthesizer";

pub const PLANNER_DESCRIPTION: &str = "You break an objective into an ordered plan. \
    Each step groups tasks that can run independently of each other, and each task names \
    exactly one of the available agents. You answer only with the plan object.";

pub const SYNTHESIZER_DESCRIPTION: &str = "You turn the results of a completed plan into \
    one clear, self-contained answer to the original objective.";

/// System prompt for an agent with the given name and description.
pub fn agent_system_prompt(name: &str, description: &str) -> String {
    let mut prompt = format!("You are {}.", name);
    if !description.is_empty() {
        prompt.push(' ');
        prompt.push_str(description);
    }
    prompt.push_str(
        "\n\nUse the available tools when they help you complete the request. \
         When you have enough information, answer directly without calling more tools.",
    );
    prompt
}

/// One line per tool under a heading naming the agent.
pub fn capability_listing(name: &str, description: &str, tools: &[ToolSpec]) -> String {
    let mut listing = format!("- {}: {}", name, description);
    if tools.is_empty() {
        listing.push_str("\n    (no tools)");
    }
    for tool in tools {
        listing.push_str(&format!("\n    * {}: {}", tool.name, tool.description));
    }
    listing
}

/// Render executed steps with their task results, or a placeholder when nothing ran yet.
pub fn format_progress(steps: &[PlanStep]) -> String {
    if steps.is_empty() {
        return "No steps have been completed yet.".to_string();
    }
    let mut out = String::new();
    for (index, step) in steps.iter().enumerate() {
        out.push_str(&format!("Step {}: {}\n", index + 1, step.objective));
        for task in &step.tasks {
            out.push_str(&format!(
                "  - [{}] {}\n    Result: {}\n",
                task.agent_name,
                task.description,
                task.result.as_deref().unwrap_or("(no result)")
            ));
        }
    }
    out.trim_end().to_string()
}

pub fn plan_prompt(objective: &str, capabilities: &[String]) -> String {
    format!(
        "Objective:\n{objective}\n\n\
         Available agents:\n{agents}\n\n\
         Produce a plan that achieves the objective using only the agents listed above. \
         Steps run one after another. Tasks inside a step run in parallel, so they must not \
         depend on each other. Set isComplete to true only when the plan fully covers the objective.\n\n\
         Respond with a single JSON object of the form \
         {{\"steps\": [{{\"objective\": string, \"tasks\": [{{\"description\": string, \"agent\": string}}]}}], \"isComplete\": boolean}}. \
         Do not wrap it in code fences and do not add any other text.",
        objective = objective,
        agents = capabilities.join("\n"),
    )
}

pub fn task_prompt(objective: &str, task_description: &str, completed: &[PlanStep]) -> String {
    format!(
        "You are working on part of a larger objective.\n\n\
         Overall objective:\n{}\n\n\
         Progress so far:\n{}\n\n\
         Your task:\n{}",
        objective,
        format_progress(completed),
        task_description
    )
}

pub fn synthesis_prompt(objective: &str, steps: &[PlanStep]) -> String {
    format!(
        "Objective:\n{}\n\n\
         Results of the executed plan:\n{}\n\n\
         Write the final answer to the objective using these results.",
        objective,
        format_progress(steps)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::PlanTask;

    fn done_step() -> PlanStep {
        let mut task = PlanTask::new("find X", "researcher");
        task.result = Some("X is 42".to_string());
        PlanStep {
            objective: "find".to_string(),
            tasks: vec![task],
        }
    }

    #[test]
    fn system_prompt_names_agent() {
        let prompt = agent_system_prompt("researcher", "Finds facts.");
        assert!(prompt.starts_with("You are researcher. Finds facts."));
    }

    #[test]
    fn progress_lists_results() {
        let text = format_progress(&[done_step()]);
        assert!(text.contains("Step 1: find"));
        assert!(text.contains("[researcher] find X"));
        assert!(text.contains("Result: X is 42"));
        assert_eq!(format_progress(&[]), "No steps have been completed yet.");
    }

    #[test]
    fn task_prompt_carries_objective_task_and_history() {
        let prompt = task_prompt("ship X", "write X", &[done_step()]);
        assert!(prompt.contains("ship X"));
        assert!(prompt.contains("write X"));
        assert!(prompt.contains("X is 42"));
    }

    #[test]
    fn plan_prompt_lists_agents_and_format() {
        let listing = capability_listing(
            "researcher",
            "Finds facts.",
            &[ToolSpec::new("search", "Search the web", json!({}))],
        );
        let prompt = plan_prompt("ship X", &[listing]);
        assert!(prompt.contains("- researcher: Finds facts."));
        assert!(prompt.contains("* search: Search the web"));
        assert!(prompt.contains("isComplete"));
    }
}

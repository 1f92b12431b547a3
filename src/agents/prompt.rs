//! Turn prompt rendering
//!
//! Each turn sends a single prompt upstream. It is rendered with Tera from
//! the agent type, the instance's working memory and recent history, and
//! the inbound user message.

use serde::Serialize;
use tera::{Context, Tera};

use crate::agents::catalog::AgentCatalog;
use crate::agents::domain::{AgentInstance, AgentTypeSpec, TurnRole};
use crate::agents::error::{AgentError, AgentResult};
use crate::agents::hierarchy::{COMPLETE_TASK_TOOL, DELEGATE_TOOL};

const TURN_TEMPLATE_NAME: &str = "turn";

const DEFAULT_TURN_TEMPLATE: &str = r#"{{ system_prompt }}

You are the {{ role }} of this project.
{% if capabilities %}Capabilities: {{ capabilities | join(sep=", ") }}
{% endif %}{% if hires %}
You may delegate work to: {% for hire in hires %}{{ hire }}{% if not loop.last %}, {% endif %}{% endfor %}.
To delegate, call the `{{ delegate_tool }}` tool with {"role": "<role>", "task": "<description>", "requires_response": true}.
{% endif %}{% if open_task %}
Current task from {{ open_task.from_role }}: {{ open_task.description }}
When it is done, call the `{{ complete_task_tool }}` tool with {"summary": "<what was done>"}.
{% endif %}{% if awaiting %}
Waiting on:
{% for item in awaiting %}- {{ item.to_role }}: {{ item.task }}
{% endfor %}{% endif %}
{% for turn in history %}{{ turn.role }}: {{ turn.content }}
{% endfor %}user: {{ message }}
assistant:"#;

#[derive(Serialize)]
struct HistoryLine<'a> {
    role: &'static str,
    content: &'a str,
}

/// Renders per-turn prompts from a Tera template
pub struct PromptRenderer {
    tera: Tera,
}

impl PromptRenderer {
    pub fn new() -> AgentResult<Self> {
        Self::with_template(DEFAULT_TURN_TEMPLATE)
    }

    /// Uses a custom turn template. The template sees `system_prompt`,
    /// `role`, `capabilities`, `hires`, `open_task`, `awaiting`, `history`
    /// and `message`.
    pub fn with_template(template: &str) -> AgentResult<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template(TURN_TEMPLATE_NAME, template)
            .map_err(|e| AgentError::Prompt(e.to_string()))?;
        Ok(Self { tera })
    }

    pub fn render(
        &self,
        catalog: &AgentCatalog,
        spec: &AgentTypeSpec,
        instance: &AgentInstance,
        message: &str,
    ) -> AgentResult<String> {
        let hires: Vec<&str> = spec
            .can_hire
            .iter()
            .filter(|role| catalog.get(**role).is_some())
            .map(|role| role.as_str())
            .collect();

        let history: Vec<HistoryLine<'_>> = instance
            .conversation_history
            .iter()
            .map(|turn| HistoryLine {
                role: match turn.role {
                    TurnRole::User => "user",
                    TurnRole::Assistant => "assistant",
                },
                content: &turn.content,
            })
            .collect();

        let mut context = Context::new();
        context.insert(
            "system_prompt",
            &render_system_prompt(spec.system_prompt.as_deref().unwrap_or_default(), instance),
        );
        context.insert("role", instance.role.as_str());
        context.insert("capabilities", &spec.capabilities);
        context.insert("hires", &hires);
        context.insert("delegate_tool", DELEGATE_TOOL);
        context.insert("complete_task_tool", COMPLETE_TASK_TOOL);
        context.insert("open_task", &instance.working_memory.open_task);
        context.insert("awaiting", &instance.working_memory.awaiting);
        context.insert("history", &history);
        context.insert("message", message);

        self.tera
            .render(TURN_TEMPLATE_NAME, &context)
            .map_err(|e| AgentError::Prompt(e.to_string()))
    }
}

/// Renders template variables in a configured system prompt.
///
/// `role` and `project_id` are available. Falls back to the raw prompt if
/// rendering fails.
pub fn render_system_prompt(system_prompt: &str, instance: &AgentInstance) -> String {
    if !system_prompt.contains("{{") {
        return system_prompt.to_string();
    }

    let mut context = Context::new();
    context.insert("role", instance.role.as_str());
    context.insert("project_id", &instance.project_id);

    match Tera::one_off(system_prompt, &context, false) {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!("Failed to render system prompt template: {}", e);
            system_prompt.to_string()
        }
    }
}

//! Agent-merge engine: rewrites an outgoing chat-completion body according to
//! the resolved context's merge policies.
//!
//! [`apply`] is a pure function over the opaque JSON body; the input is never
//! mutated. Only `system_prompt` and `skills` policies are consulted;
//! resolved MCP endpoints stay on the context for the tool round-trip and are
//! never injected into the provider body.
//!
//! Note on idempotence: `overwrite` is idempotent; `prepend`/`append` inject
//! a second copy of the prompt when applied twice, so callers apply the
//! engine exactly once per request.

use serde_json::{json, Value};

use crate::tenant::{skill_name, ListPolicy, SystemPromptPolicy, TenantContext};

/// Applies the context's merge policies to `body`, returning the rewritten
/// request. No-ops entirely when the resolved fields are absent or empty.
pub fn apply(body: &Value, ctx: &TenantContext) -> Value {
    let mut out = body.clone();
    if let Some(prompt) = ctx
        .resolved_system_prompt
        .as_deref()
        .filter(|p| !p.is_empty())
    {
        apply_system_prompt(&mut out, prompt, ctx.merge_policies.system_prompt);
    }
    if !ctx.resolved_skills.is_empty() {
        apply_skills(&mut out, &ctx.resolved_skills, ctx.merge_policies.skills);
    }
    out
}

fn system_message(prompt: &str) -> Value {
    json!({"role": "system", "content": prompt})
}

fn is_system(msg: &Value) -> bool {
    msg.get("role").and_then(Value::as_str) == Some("system")
}

fn apply_system_prompt(body: &mut Value, prompt: &str, policy: SystemPromptPolicy) {
    if policy == SystemPromptPolicy::Ignore {
        return;
    }
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    match policy {
        SystemPromptPolicy::Prepend => messages.insert(0, system_message(prompt)),
        SystemPromptPolicy::Append => messages.push(system_message(prompt)),
        SystemPromptPolicy::Overwrite => {
            messages.retain(|m| !is_system(m));
            messages.insert(0, system_message(prompt));
        }
        SystemPromptPolicy::Ignore => {}
    }
}

fn apply_skills(body: &mut Value, resolved: &[Value], policy: ListPolicy) {
    match policy {
        ListPolicy::Ignore => {}
        ListPolicy::Overwrite => {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("tools".into(), Value::Array(resolved.to_vec()));
            }
        }
        ListPolicy::Merge => {
            let request_tools = body
                .get("tools")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            // Agent tools first; request tools only where the name is new.
            let mut merged = resolved.to_vec();
            for tool in request_tools {
                let collides = skill_name(&tool)
                    .map(|name| {
                        merged
                            .iter()
                            .any(|have| skill_name(have) == Some(name))
                    })
                    .unwrap_or(false);
                if !collides {
                    merged.push(tool);
                }
            }
            if let Some(obj) = body.as_object_mut() {
                obj.insert("tools".into(), Value::Array(merged));
            }
        }
    }
}

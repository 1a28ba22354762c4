use std::collections::BTreeMap;

use db::models::{
    dev_environment::{DevEnvironment, DevEnvironmentKind},
    task::Task,
    task_conversation::TaskConversation,
};

use crate::error::CommandBuildError;

/// Sentinel accepted in `TaskConversation.config_model`: "use whatever the
/// agent binary defaults to" rather than an explicit model override.
const MODEL_SENTINEL_DEFAULT: &str = "default";

/// Everything `services::ContainerRunner::Launch` needs to start one agent
/// container, built from a `DevEnvironment` plus the task/conversation being
/// executed (SPEC_FULL.md §4.2). This crate stops at argv/env construction;
/// actually spawning the container is the services crate's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cpu_quota: f64,
    pub memory_mib: i64,
}

impl LaunchSpec {
    /// A shell-quoted rendering of the full command line, for the masked
    /// transcript persisted on `ExecutionLog.launch_command`. The agent
    /// itself is launched via argv directly (no shell involved), so this is
    /// display-only.
    pub fn transcript(&self) -> String {
        self.argv
            .iter()
            .map(|arg| shlex::quote(arg).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Same rendering, with secret-looking env values redacted. Used instead
    /// of [`Self::transcript`] whenever the command is shown to a user; the
    /// actually-launched command is never redacted.
    pub fn masked_env(&self) -> BTreeMap<String, String> {
        utils::secret::mask_env(&self.env)
    }
}

/// Builds the [`LaunchSpec`] for one conversation, per `DevEnvironment.kind`.
pub fn build_launch_spec(
    dev_env: &DevEnvironment,
    task: &Task,
    conv: &TaskConversation,
    project_system_prompt: Option<&str>,
    rewritten_prompt: &str,
) -> Result<LaunchSpec, CommandBuildError> {
    let kind = dev_env
        .kind()
        .map_err(|_| CommandBuildError::UnknownKind(dev_env.kind.clone()))?;

    let argv = match kind {
        DevEnvironmentKind::ClaudeCode => build_claude_code_argv(dev_env, task, conv, project_system_prompt, rewritten_prompt),
        DevEnvironmentKind::Opencode => vec!["opencode".to_string(), rewritten_prompt.to_string()],
        DevEnvironmentKind::GeminiCli => vec!["gemini".to_string(), rewritten_prompt.to_string()],
    };

    Ok(LaunchSpec {
        image: dev_env.image.clone(),
        argv,
        env: dev_env.env_vars(),
        cpu_quota: dev_env.cpu_quota,
        memory_mib: dev_env.memory_mib,
    })
}

fn build_claude_code_argv(
    dev_env: &DevEnvironment,
    task: &Task,
    conv: &TaskConversation,
    project_system_prompt: Option<&str>,
    rewritten_prompt: &str,
) -> Vec<String> {
    let mut argv = vec![
        "claude".to_string(),
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    if let Some(session_id) = &task.session_id {
        argv.push("--resume".to_string());
        argv.push(session_id.clone());
    }

    if let Some(model) = &conv.config_model {
        if model != MODEL_SENTINEL_DEFAULT {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }
    }

    // Plan-permission and skip-permission-prompts are mutually exclusive.
    if conv.config_is_plan_mode {
        argv.push("--permission-mode".to_string());
        argv.push("plan".to_string());
    } else {
        argv.push("--dangerously-skip-permissions".to_string());
    }

    for system_prompt in [project_system_prompt, dev_env.system_prompt.as_deref()] {
        if let Some(prompt) = system_prompt {
            if !prompt.trim().is_empty() {
                argv.push("--append-system-prompt".to_string());
                argv.push(prompt.trim().to_string());
            }
        }
    }

    argv.push(rewritten_prompt.to_string());
    argv
}

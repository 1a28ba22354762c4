use std::path::PathBuf;

use executors::LaunchSpec;
use uuid::Uuid;

/// Which bind-mount scheme `ContainerRunner::launch` uses. Exactly one is
/// chosen per launch, decided once at process start by the presence of a
/// container-in-container sentinel (`/.dockerenv` or the configured override;
/// see `utils::ContainerInContainerMode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// Host process runs directly on the Docker host: bind-mount absolute
    /// host paths straight into the agent container.
    Host,
    /// Host process itself runs inside a container: the workspace and
    /// session directories are named volumes shared with the sibling
    /// container, referenced by their in-container relative path.
    ContainerInContainer,
}

/// Everything needed to launch one agent container (SPEC_FULL.md §4.2),
/// combining the argv/env from [`executors::LaunchSpec`] with the mounts and
/// identity that only `services::ContainerRunner` knows how to wire up.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub launch: LaunchSpec,
    pub container_name: String,
    pub workspace_abs: PathBuf,
    pub session_dir_abs: PathBuf,
    pub workspace_rel: String,
    pub mount_mode: MountMode,
}

impl ContainerSpec {
    pub fn new(
        launch: LaunchSpec,
        task_id: Uuid,
        conv_id: Uuid,
        workspace_abs: PathBuf,
        session_dir_abs: PathBuf,
        workspace_rel: String,
        mount_mode: MountMode,
    ) -> Self {
        Self {
            launch,
            container_name: format!("xsha-task-{task_id}-conv-{conv_id}"),
            workspace_abs,
            session_dir_abs,
            workspace_rel,
            mount_mode,
        }
    }

    pub fn workdir(&self) -> String {
        match self.mount_mode {
            MountMode::Host => "/app".to_string(),
            MountMode::ContainerInContainer => format!("/app/{}", self.workspace_rel),
        }
    }

    /// User-visible command transcript persisted on `ExecutionLog.launch_command`:
    /// the CLI invocation that would reproduce this launch, with secret-looking
    /// env values redacted. The actually-launched process is never redacted.
    pub fn masked_transcript(&self, binary: &str) -> String {
        let mut parts = vec![binary.to_string(), "run".to_string(), "--rm".to_string(), "-i".to_string()];
        parts.push("--name".to_string());
        parts.push(self.container_name.clone());
        parts.push("-w".to_string());
        parts.push(self.workdir());
        for (key, value) in self.launch.masked_env() {
            parts.push("-e".to_string());
            parts.push(format!("{key}={value}"));
        }
        parts.push(self.launch.image.clone());
        parts.extend(self.launch.argv[1..].iter().cloned());
        parts.iter().map(|p| shlex::quote(p).into_owned()).collect::<Vec<_>>().join(" ")
    }
}

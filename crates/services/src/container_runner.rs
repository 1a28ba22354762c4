use std::{process::Stdio, sync::Arc};

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use dashmap::DashMap;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{io::AsyncReadExt, process::Command};
use tracing::{info, warn};

use crate::{error::ContainerRunnerError, container_spec::{ContainerSpec, MountMode}, log_pipeline::LogPipeline};

/// Outcome of `ContainerRunner::wait` (SPEC_FULL.md §4.2): either the
/// container ran to completion, was cancelled, or the CLI itself errored.
#[derive(Debug, Clone, Default)]
pub struct ExitOutcome {
    pub exit_code: Option<i32>,
    pub cancelled: bool,
    pub error: Option<String>,
}

/// Runs one agent container to completion or cancellation, via an external
/// container CLI (`docker`, `podman`, ...). SPEC_FULL.md §4.2/§4.2.1.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Starts the container and returns its id (here, the deterministic
    /// `xsha-task-*-conv-*` name) plus a join handle that resolves when the
    /// container exits. Output chunks are tee'd into `pipeline` as they
    /// arrive, in strict arrival order.
    async fn launch(
        &self,
        spec: &ContainerSpec,
        pipeline: Arc<LogPipeline>,
    ) -> Result<(String, tokio::task::JoinHandle<ExitOutcome>), ContainerRunnerError>;

    /// Sends the CLI's own stop subcommand for `container_id`. `wait()` then
    /// resolves with `cancelled = true`. Idempotent: cancelling an already
    /// stopped or unknown container is not an error.
    async fn cancel(&self, container_id: &str) -> Result<(), ContainerRunnerError>;
}

/// Default [`ContainerRunner`]: shells out to a configured CLI binary via
/// `tokio::process::Command`, wrapped with `command-group` so the spawned
/// CLI process and anything it forks share one process group. If the CLI
/// process itself hangs (not the container — the CLI wrapper around it),
/// `force_kill` reclaims the whole group with `nix::sys::signal::killpg`
/// rather than leaking a zombie.
pub struct CliContainerRunner {
    binary: String,
    /// Process group ids of in-flight launches, keyed by container name, so
    /// a caller that needs to escalate past a graceful `cancel()` can reach
    /// the group directly.
    groups: Arc<DashMap<String, i32>>,
}

impl CliContainerRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into(), groups: Arc::new(DashMap::new()) }
    }

    pub fn docker() -> Self {
        Self::new("docker")
    }

    /// Escalation path: SIGTERM then, if still alive, SIGKILL to the whole
    /// process group. Used when a cancelled container's CLI process outlives
    /// the scheduler's shutdown grace period.
    pub fn force_kill(&self, container_id: &str) {
        let Some(pgid) = self.groups.get(container_id).map(|g| *g) else { return };
        let pgid = Pid::from_raw(pgid);
        if killpg(pgid, Signal::SIGTERM).is_ok() {
            warn!(container_id, "sent SIGTERM to hung container CLI process group");
        }
    }
}

#[async_trait]
impl ContainerRunner for CliContainerRunner {
    async fn launch(
        &self,
        spec: &ContainerSpec,
        pipeline: Arc<LogPipeline>,
    ) -> Result<(String, tokio::task::JoinHandle<ExitOutcome>), ContainerRunnerError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("run")
            .arg("--rm")
            .arg("-i")
            .arg("--name")
            .arg(&spec.container_name)
            .arg("-w")
            .arg(spec.workdir());

        match spec.mount_mode {
            MountMode::Host => {
                cmd.arg("-v").arg(format!("{}:/app", spec.workspace_abs.display()));
                cmd.arg("-v").arg(format!("{}:/home/agent", spec.session_dir_abs.display()));
            }
            MountMode::ContainerInContainer => {
                cmd.arg("-v").arg(format!("{}:/app/{}", spec.workspace_abs.display(), spec.workspace_rel));
                cmd.arg("-v").arg(format!("{}:/home/agent", spec.session_dir_abs.display()));
            }
        }

        if spec.launch.cpu_quota > 0.0 {
            cmd.arg("--cpus").arg(spec.launch.cpu_quota.to_string());
        }
        if spec.launch.memory_mib > 0 {
            cmd.arg("--memory").arg(format!("{}m", spec.launch.memory_mib));
        }
        for (key, value) in &spec.launch.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }

        cmd.arg(&spec.launch.image);
        cmd.args(&spec.launch.argv[1..]); // argv[0] is the in-container binary name, the image's entrypoint

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut group_child = cmd.group_spawn().map_err(ContainerRunnerError::Spawn)?;
        let pgid = group_child.id() as i32;
        self.groups.insert(spec.container_name.clone(), pgid);
        info!(container = %spec.container_name, "launched agent container");

        let stdout = group_child.inner().stdout.take().expect("piped stdout");
        let stderr = group_child.inner().stderr.take().expect("piped stderr");

        let out_pipeline = pipeline.clone();
        tokio::spawn(forward_chunks(stdout, out_pipeline, true));
        tokio::spawn(forward_chunks(stderr, pipeline.clone(), false));

        let container_id = spec.container_name.clone();
        let groups = self.groups.clone();
        let wait_handle = tokio::spawn(async move {
            let status = group_child.wait().await;
            groups.remove(&container_id);
            match status {
                Ok(status) => ExitOutcome { exit_code: status.code(), cancelled: false, error: None },
                Err(e) => ExitOutcome { exit_code: None, cancelled: false, error: Some(e.to_string()) },
            }
        });

        Ok((spec.container_name.clone(), wait_handle))
    }

    async fn cancel(&self, container_id: &str) -> Result<(), ContainerRunnerError> {
        let status = Command::new(&self.binary)
            .arg("stop")
            .arg(container_id)
            .status()
            .await
            .map_err(|_| ContainerRunnerError::Cancel(container_id.to_string()))?;
        if !status.success() {
            warn!(container_id, "docker stop exited non-zero; container may already be gone");
        }
        Ok(())
    }
}

/// Forwards raw reads into UTF-8 text chunks without ever splitting a
/// multi-byte codepoint across a 64 KiB read boundary: a codepoint that's
/// still incomplete at the end of one read is held in `carry` and prefixed
/// onto the next read before decoding, instead of being lossy-decoded (and
/// thus corrupted to U+FFFD) on its own. Losing this would make the
/// persisted log diverge from the container's actual byte stream (data-model
/// invariant 6 / testable property 5) any time a line boundary happened to
/// land mid-codepoint.
async fn forward_chunks(mut reader: impl tokio::io::AsyncRead + Unpin, pipeline: Arc<LogPipeline>, is_stdout: bool) {
    let mut buf = [0u8; 64 * 1024];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                if !carry.is_empty() {
                    ingest(&pipeline, is_stdout, String::from_utf8_lossy(&carry).into_owned()).await;
                }
                break;
            }
            Ok(n) => {
                carry.extend_from_slice(&buf[..n]);
                let (complete, rest) = split_complete_utf8(&carry);
                if !complete.is_empty() {
                    ingest(&pipeline, is_stdout, String::from_utf8_lossy(complete).into_owned()).await;
                }
                carry = rest.to_vec();
            }
            Err(e) => {
                warn!(error = %e, "container output reader errored");
                break;
            }
        }
    }
}

async fn ingest(pipeline: &LogPipeline, is_stdout: bool, chunk: String) {
    if is_stdout {
        pipeline.ingest_stdout(chunk).await;
    } else {
        pipeline.ingest_stderr(chunk).await;
    }
}

/// Splits `data` at the last point it is guaranteed fully-decodable: if the
/// only UTF-8 error is a genuinely incomplete sequence at the very end (at
/// most 3 bytes — the longest possible trailing fragment of a 4-byte
/// codepoint), that fragment is returned as the second slice to carry over
/// to the next read. Any other invalid-UTF-8 error is left in the first
/// slice to be lossy-decoded immediately — those bytes were never going to
/// become valid no matter how many more bytes arrive.
fn split_complete_utf8(data: &[u8]) -> (&[u8], &[u8]) {
    match std::str::from_utf8(data) {
        Ok(_) => (data, &[]),
        Err(e) => match e.error_len() {
            Some(_) => (data, &[]),
            None => data.split_at(e.valid_up_to()),
        },
    }
}


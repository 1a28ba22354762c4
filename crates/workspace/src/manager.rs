use std::{path::{Path, PathBuf}, sync::Arc};

use db::models::{attachment::Attachment, project::Project, task::Task, task_conversation::TaskConversation};
use dashmap_like::KeyedMutexMap;
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use regex::Regex;
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{credential::CredentialResolver, error::WorkspaceError};

const ATTACHMENTS_DIR: &str = ".xsha/attachments";

#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    pub commit_sha: Option<String>,
    pub files_changed: usize,
}

/// Materialises and manages per-task filesystem state: clone/branch/stage
/// attachments/commit/push/diff, per SPEC_FULL.md §4.1.
///
/// Concurrent `prepare` calls on the same task are serialized by a per-task
/// mutex, mirroring the teacher's `DashMap<TaskId, Arc<Mutex<()>>>` lock-map
/// pattern used for workspace operations in `services::container`.
pub struct WorkspaceManager {
    workspace_base_dir: PathBuf,
    credential_resolver: Arc<dyn CredentialResolver>,
    task_locks: KeyedMutexMap<Uuid>,
}

impl WorkspaceManager {
    pub fn new(workspace_base_dir: PathBuf, credential_resolver: Arc<dyn CredentialResolver>) -> Self {
        Self {
            workspace_base_dir,
            credential_resolver,
            task_locks: KeyedMutexMap::new(),
        }
    }

    fn absolute(&self, rel: &str) -> PathBuf {
        self.workspace_base_dir.join(rel)
    }

    async fn remote_callbacks(&self, project: &Project) -> Result<RemoteCallbacks<'static>, WorkspaceError> {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(credential_ref) = project.credential_ref.clone() {
            let secret = self.credential_resolver.resolve(&credential_ref).await?;
            let protocol = project.protocol().unwrap_or(db::models::project::RepoProtocol::Https);
            callbacks.credentials(move |_url, username_from_url, _allowed_types| {
                use secrecy::ExposeSecret;
                match protocol {
                    db::models::project::RepoProtocol::Ssh => Cred::ssh_key_from_memory(
                        username_from_url.unwrap_or("git"),
                        None,
                        secret.expose_secret(),
                        None,
                    ),
                    db::models::project::RepoProtocol::Https => {
                        Cred::userpass_plaintext(username_from_url.unwrap_or("x-access-token"), secret.expose_secret())
                    }
                }
            });
        }
        Ok(callbacks)
    }

    /// `prepare(task) → absolute_path` (SPEC_FULL.md §4.1). Clones on first
    /// use, re-clones if the recorded path vanished from disk, then ensures
    /// the work branch exists (creating it from `start_branch` if needed).
    pub async fn prepare(
        &self,
        pool: &SqlitePool,
        task: &Task,
        project: &Project,
    ) -> Result<PathBuf, WorkspaceError> {
        let _guard = self.task_locks.lock(task.id).await;

        let rel_path = match &task.workspace_path {
            Some(existing) => existing.clone(),
            None => utils::text::workspace_rel_path(&project.slug(), task.id),
        };
        let absolute = self.absolute(&rel_path);

        if !absolute.exists() {
            info!(task_id = %task.id, path = %absolute.display(), "cloning project repo into workspace");
            self.clone_repo(project, &absolute).await?;
        } else if task.workspace_path.is_none() {
            // Directory exists but was never recorded — treat as stale scratch
            // space and re-clone fresh rather than reusing unknown contents.
            tokio::fs::remove_dir_all(&absolute).await.ok();
            self.clone_repo(project, &absolute).await?;
        }

        if task.workspace_path.is_none() {
            db::models::task::Task::set_workspace_path_if_unset(pool, task.id, &rel_path).await?;
        }

        self.fetch(&absolute, project).await?;

        let work_branch = match &task.work_branch {
            Some(existing) => existing.clone(),
            None => utils::text::work_branch_name(task.id, &task.title),
        };
        self.ensure_work_branch(&absolute, &work_branch, &task.start_branch)?;
        if task.work_branch.is_none() {
            db::models::task::Task::set_work_branch_if_unset(pool, task.id, &work_branch).await?;
        }

        Ok(absolute)
    }

    async fn clone_repo(&self, project: &Project, dest: &Path) -> Result<(), WorkspaceError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let callbacks = self.remote_callbacks(project).await?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks);
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_opts);
        builder.branch(&project.default_branch);
        builder.clone(&project.repo_url, dest)?;
        Ok(())
    }

    async fn fetch(&self, workspace_abs: &Path, project: &Project) -> Result<(), WorkspaceError> {
        let repo = Repository::open(workspace_abs)?;
        let callbacks = self.remote_callbacks(project).await?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks);
        let mut remote = repo.find_remote("origin")?;
        remote.fetch(&[&project.default_branch], Some(&mut fetch_opts), None)?;
        Ok(())
    }

    fn ensure_work_branch(&self, workspace_abs: &Path, work_branch: &str, start_branch: &str) -> Result<(), WorkspaceError> {
        let repo = Repository::open(workspace_abs)?;

        if let Ok(remote_branch) = repo.find_branch(&format!("origin/{work_branch}"), git2::BranchType::Remote) {
            let commit = remote_branch.get().peel_to_commit()?;
            let mut local = repo.branch(work_branch, &commit, true)?;
            local.set_upstream(Some(&format!("origin/{work_branch}")))?;
        } else if repo.find_branch(work_branch, git2::BranchType::Local).is_err() {
            let start_ref = repo
                .find_branch(start_branch, git2::BranchType::Local)
                .or_else(|_| repo.find_branch(&format!("origin/{start_branch}"), git2::BranchType::Local))?;
            let commit = start_ref.get().peel_to_commit()?;
            repo.branch(work_branch, &commit, false)?;
        }

        let obj = repo.revparse_single(&format!("refs/heads/{work_branch}"))?;
        repo.checkout_tree(&obj, None)?;
        repo.set_head(&format!("refs/heads/{work_branch}"))?;
        Ok(())
    }

    /// `stageAttachments(conv, workspaceAbs) → rewrittenPrompt`. Copies each
    /// attachment from `attachmentsBaseDir` into `<workspaceAbs>/.xsha/attachments/<id>`
    /// and substitutes `{{attachment:<id>}}` tokens with the in-container path.
    /// Per the §9 redesign note, unresolved tokens are a preflight error, not
    /// a silent pass-through.
    pub async fn stage_attachments(
        &self,
        conv: &TaskConversation,
        attachments: &[Attachment],
        attachments_base_dir: &Path,
        workspace_abs: &Path,
    ) -> Result<String, WorkspaceError> {
        let dest_dir = workspace_abs.join(ATTACHMENTS_DIR);
        tokio::fs::create_dir_all(&dest_dir).await?;

        for attachment in attachments {
            let src = attachments_base_dir.join(attachment.id.to_string());
            let dst = dest_dir.join(attachment.id.to_string());
            tokio::fs::copy(&src, &dst).await?;
        }

        let token_re = Regex::new(r"\{\{attachment:([0-9a-fA-F-]{36})\}\}").expect("static regex");
        let known: std::collections::HashSet<String> =
            attachments.iter().map(|a| a.id.to_string()).collect();

        let mut error: Option<String> = None;
        let rewritten = token_re.replace_all(&conv.prompt, |caps: &regex::Captures| {
            let id = &caps[1];
            if known.contains(id) {
                format!("/app/{ATTACHMENTS_DIR}/{id}")
            } else {
                error = Some(caps[0].to_string());
                caps[0].to_string()
            }
        });

        if let Some(token) = error {
            return Err(WorkspaceError::UnresolvedAttachmentToken(token));
        }

        Ok(rewritten.into_owned())
    }

    /// `clearAttachments(workspaceAbs)`. Idempotent: removing an already-absent
    /// directory is not an error.
    pub async fn clear_attachments(&self, workspace_abs: &Path) -> Result<(), WorkspaceError> {
        let dir = workspace_abs.join(ATTACHMENTS_DIR);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// `commit(workspaceAbs, message) → {commitSHA, filesChanged}`. A no-op
    /// (`commit_sha: None`) if nothing changed. Commit failures are reported
    /// to the caller as `Err`, but per SPEC_FULL.md §4.5/§7 the Executor
    /// treats them as a non-fatal warning, not an aborted run.
    pub fn commit(&self, workspace_abs: &Path, message: &str, author_name: &str, author_email: &str) -> Result<CommitOutcome, WorkspaceError> {
        let repo = Repository::open(workspace_abs)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let diff = repo.diff_tree_to_index(
            Some(&repo.head()?.peel_to_tree()?),
            Some(&index),
            None,
        )?;
        let files_changed = diff.deltas().len();
        if files_changed == 0 {
            debug!(path = %workspace_abs.display(), "nothing to commit");
            return Ok(CommitOutcome::default());
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let parent = repo.head()?.peel_to_commit()?;
        let sig = git2::Signature::now(author_name, author_email)?;
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;

        Ok(CommitOutcome {
            commit_sha: Some(commit_id.to_string()),
            files_changed,
        })
    }

    /// `pushBranch(workspaceAbs, branch)`. Explicit, API-invoked operation —
    /// the Executor's per-run algorithm never pushes on the agent's behalf.
    pub async fn push_branch(&self, workspace_abs: &Path, project: &Project, branch: &str) -> Result<(), WorkspaceError> {
        let repo = Repository::open(workspace_abs)?;
        let callbacks = self.remote_callbacks(project).await?;
        let mut push_opts = git2::PushOptions::new();
        push_opts.remote_callbacks(callbacks);
        let mut remote = repo.find_remote("origin")?;
        remote.push(&[format!("refs/heads/{branch}:refs/heads/{branch}")], Some(&mut push_opts))?;
        Ok(())
    }

    /// `diff(workspaceAbs, ref) → patch`. Read-only.
    pub fn diff(&self, workspace_abs: &Path, reference: &str) -> Result<String, WorkspaceError> {
        let repo = Repository::open(workspace_abs)?;
        let obj = repo.revparse_single(reference)?;
        let tree = obj.peel_to_tree()?;
        let diff = repo.diff_tree_to_workdir_with_index(Some(&tree), None)?;
        let mut patch = String::new();
        diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            if let Ok(content) = std::str::from_utf8(line.content()) {
                patch.push_str(content);
            }
            true
        })?;
        Ok(patch)
    }
}

/// Tiny `DashMap`-alike keyed lock map, avoiding a full `dashmap` dependency
/// for a single use site: a `Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>`
/// guards entry creation, then the per-key `tokio::sync::Mutex` itself guards
/// the critical section. Same shape as the teacher's per-task lock map in
/// `services::container`, just inlined since `workspace` has no other need
/// for `dashmap`.
mod dashmap_like {
    use std::{collections::HashMap, hash::Hash, sync::Arc};

    use tokio::sync::{Mutex, OwnedMutexGuard};

    pub struct KeyedMutexMap<K> {
        inner: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
    }

    impl<K: Eq + Hash + Clone> KeyedMutexMap<K> {
        pub fn new() -> Self {
            Self { inner: std::sync::Mutex::new(HashMap::new()) }
        }

        pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
            let entry = {
                let mut map = self.inner.lock().unwrap();
                map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
            };
            entry.lock_owned().await
        }
    }
}

pub use self::dashmap_like::KeyedMutexMap as TaskLockMap;

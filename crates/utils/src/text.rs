use uuid::Uuid;

/// First 8 hex characters of a UUID, used wherever a human-readable but
/// still-unique short id is needed (branch names, workspace directory names).
pub fn short_uuid(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Lowercase, collapse any run of non-alphanumeric characters to a single
/// hyphen, trim leading/trailing hyphens, and cap the length so the result is
/// safe as a path segment and a git branch/ref component.
pub fn git_branch_id(title: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_was_hyphen = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen && !out.is_empty() {
            out.push('-');
            last_was_hyphen = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.len() > max_len {
        out.truncate(max_len);
        while out.ends_with('-') {
            out.pop();
        }
    }
    if out.is_empty() {
        "task".to_string()
    } else {
        out
    }
}

/// Derive a task's work branch name: `<short_id>-<slugified_title>`.
pub fn work_branch_name(task_id: Uuid, title: &str) -> String {
    format!("{}-{}", short_uuid(task_id), git_branch_id(title, 40))
}

/// Derive the relative workspace directory for a task:
/// `<projectSlug>/<taskId>-<shortHash>`.
pub fn workspace_rel_path(project_slug: &str, task_id: Uuid) -> String {
    format!("{}/{}-{}", project_slug, task_id, short_uuid(task_id))
}

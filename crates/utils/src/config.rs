use std::{env, path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {source}")]
    Parse {
        var: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Whether the core itself is running inside a container, which changes how
/// `ContainerRunner::Launch` mounts the workspace (bind mount vs. named
/// volume). Modeled as a tri-state per the redesign in SPEC_FULL.md §9:
/// auto-detection via a sentinel file is a fallback, not the primary path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerInContainerMode {
    #[default]
    Auto,
    Force,
    Disable,
}

impl ContainerInContainerMode {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "force" => Ok(Self::Force),
            "disable" => Ok(Self::Disable),
            other => Err(ConfigError::Parse {
                var: "XSHA_CONTAINER_IN_CONTAINER_MODE",
                source: format!("expected auto|force|disable, got `{other}`").into(),
            }),
        }
    }

    /// Resolve against the sentinel-file heuristic only when `Auto`.
    pub fn resolve(self, sentinel_present: bool) -> bool {
        match self {
            Self::Auto => sentinel_present,
            Self::Force => true,
            Self::Disable => false,
        }
    }
}

/// Process-wide configuration, read once at startup and immutable thereafter.
/// Every field corresponds to a row in SPEC_FULL.md §6's configuration table.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_concurrent_tasks: usize,
    pub workspace_base_dir: PathBuf,
    pub dev_sessions_base_dir: PathBuf,
    pub attachments_base_dir: PathBuf,
    pub execution_timeout: Duration,
    pub shutdown_grace: Duration,
    pub parser_max_log_lines: usize,
    pub parser_timeout: Duration,
    pub parser_strict_validation: bool,
    pub container_in_container_mode: ContainerInContainerMode,
    pub database_url: String,
    /// Root for the append-only per-execution log files (SPEC_FULL.md §9 log
    /// storage duality redesign: `ExecutionLog.log_path` is a pointer here,
    /// not an inline column).
    pub logs_base_dir: PathBuf,
    /// Identity `WorkspaceManager::commit` signs commits with. The source
    /// data model has no per-project author fields (see DESIGN.md), so this
    /// is process-wide rather than per-project.
    pub git_author_name: String,
    pub git_author_email: String,
    /// Binary invoked by `CliContainerRunner`, e.g. `docker` or `podman`.
    pub container_runtime_binary: String,
}

fn env_or<T: std::str::FromStr>(
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::Parse { var, source: Box::new(e) }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load a `.env` file if present (never overriding already-set process
    /// env vars), then read every option from the environment, falling back
    /// to the documented default. Never panics; a malformed value surfaces as
    /// a `ConfigError` naming the offending variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let container_mode = match env::var("XSHA_CONTAINER_IN_CONTAINER_MODE") {
            Ok(raw) => ContainerInContainerMode::parse(&raw)?,
            Err(_) => ContainerInContainerMode::default(),
        };

        Ok(Config {
            max_concurrent_tasks: env_or("XSHA_MAX_CONCURRENT_TASKS", 5usize)?,
            workspace_base_dir: env_or::<String>("XSHA_WORKSPACE_BASE_DIR", "./data/workspaces".to_string())?
                .into(),
            dev_sessions_base_dir: env_or::<String>(
                "XSHA_DEV_SESSIONS_BASE_DIR",
                "./data/sessions".to_string(),
            )?
            .into(),
            attachments_base_dir: env_or::<String>(
                "XSHA_ATTACHMENTS_BASE_DIR",
                "./data/attachments".to_string(),
            )?
            .into(),
            execution_timeout: Duration::from_secs(env_or("XSHA_EXECUTION_TIMEOUT_SECS", 1800u64)?),
            shutdown_grace: Duration::from_secs(env_or("XSHA_SHUTDOWN_GRACE_SECS", 10u64)?),
            parser_max_log_lines: env_or("XSHA_PARSER_MAX_LOG_LINES", 1000usize)?,
            parser_timeout: Duration::from_secs(env_or("XSHA_PARSER_TIMEOUT_SECS", 30u64)?),
            parser_strict_validation: env_or("XSHA_PARSER_STRICT_VALIDATION", false)?,
            container_in_container_mode: container_mode,
            database_url: env_or::<String>(
                "DATABASE_URL",
                "sqlite://./data/xsha.db?mode=rwc".to_string(),
            )?,
            logs_base_dir: env_or::<String>("XSHA_LOGS_BASE_DIR", "./data/logs".to_string())?.into(),
            git_author_name: env_or::<String>("XSHA_GIT_AUTHOR_NAME", "xsha-agent".to_string())?,
            git_author_email: env_or::<String>(
                "XSHA_GIT_AUTHOR_EMAIL",
                "agent@xsha.local".to_string(),
            )?,
            container_runtime_binary: env_or::<String>(
                "XSHA_CONTAINER_RUNTIME_BINARY",
                "docker".to_string(),
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_mode_parses_known_values() {
        assert_eq!(ContainerInContainerMode::parse("auto").unwrap(), ContainerInContainerMode::Auto);
        assert_eq!(ContainerInContainerMode::parse("FORCE").unwrap(), ContainerInContainerMode::Force);
        assert!(ContainerInContainerMode::parse("nonsense").is_err());
    }

    #[test]
    fn container_mode_resolves() {
        assert!(ContainerInContainerMode::Force.resolve(false));
        assert!(!ContainerInContainerMode::Disable.resolve(true));
        assert!(ContainerInContainerMode::Auto.resolve(true));
        assert!(!ContainerInContainerMode::Auto.resolve(false));
    }
}

use std::collections::BTreeMap;

const REDACTED: &str = "***REDACTED***";

/// Key fragments (case-insensitive) that mark an environment variable as
/// secret material for the purposes of a user-visible command transcript.
/// This never touches free-form log output — only the env list attached to
/// a launch spec before it is persisted as a transcript.
const SECRET_KEY_FRAGMENTS: &[&str] = &["TOKEN", "KEY", "SECRET", "PASSWORD"];

pub fn is_secret_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SECRET_KEY_FRAGMENTS.iter().any(|frag| upper.contains(frag))
}

/// Produce a masked copy of an env map suitable for persisting as the
/// launch-command transcript. The real env map passed to the container is
/// never touched by this function.
pub fn mask_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            if is_secret_key(k) {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

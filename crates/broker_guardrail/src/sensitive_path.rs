//! `isSensitivePath` (spec.md §4.G L2). Deliberately conservative: when in
//! doubt this predicate says "sensitive" rather than attempting a fully
//! correct shell-grammar-aware resolution. It normalizes `./`, `../`,
//! newline continuations, and simple `{a,b}` brace groups before matching,
//! since those are the forms a command can use to reach a sensitive path
//! without naming it literally.

use std::path::{Path, PathBuf};

const EXACT_BASENAMES: &[&str] = &[
    ".envrc",
    ".bashrc",
    ".zshrc",
    ".bash_profile",
    ".zprofile",
    ".profile",
    ".bash_history",
    ".zsh_history",
    ".python_history",
    ".node_repl_history",
    ".npmrc",
    ".pypirc",
    ".netrc",
    ".docker/config.json",
    "environ",
    "cmdline",
];

const SENSITIVE_DIR_COMPONENTS: &[&str] =
    &[".ssh", ".gnupg", ".aws", ".azure", ".kube", "gcloud", ".cargo", ".gem", ".config"];

const BROWSER_PROFILE_MARKERS: &[&str] =
    &["Application Support/Google/Chrome", ".mozilla/firefox", "AppData/Local/Google/Chrome", "Library/Safari"];

const TEMP_DIR_PREFIXES: &[&str] = &["/tmp", "/var/tmp", "/private/tmp"];

fn has_basename(path: &str, name: &str) -> bool {
    path.rsplit('/').next().map(|b| b.eq_ignore_ascii_case(name)).unwrap_or(false)
}

fn is_dotenv(basename: &str) -> bool {
    basename == ".env" || basename.starts_with(".env.")
}

fn is_secrets_file(basename: &str) -> bool {
    let lower = basename.to_ascii_lowercase();
    lower.ends_with("secrets.json") || lower.ends_with("secrets.yaml") || lower.ends_with("secrets.yml")
}

/// Textually normalizes `raw` the way spec.md §9 Open Question 1 resolves:
/// strip `./`, collapse `../`, join newline-continued lines, and expand a
/// single top-level `{a,b,c}` brace group — never against the filesystem,
/// only against the literal sensitive-name list this module already knows.
pub fn normalize_path_like(raw: &str) -> Vec<String> {
    let joined: String = raw.replace("\\\n", " ").replace('\n', " ");
    let candidates = expand_braces(&joined);
    candidates
        .into_iter()
        .map(|c| {
            let mut parts: Vec<&str> = Vec::new();
            for seg in c.split('/') {
                match seg {
                    "." | "" => continue,
                    ".." => {
                        parts.pop();
                    }
                    other => parts.push(other),
                }
            }
            let mut out = parts.join("/");
            if c.starts_with('/') {
                out = format!("/{out}");
            }
            out
        })
        .collect()
}

fn expand_braces(s: &str) -> Vec<String> {
    if let (Some(open), Some(close)) = (s.find('{'), s.find('}')) {
        if open < close {
            let (prefix, rest) = s.split_at(open);
            let (inner, suffix) = rest[1..].split_at(rest[1..].find('}').unwrap_or(rest.len() - 1));
            let suffix = &suffix[1.min(suffix.len())..];
            return inner
                .split(',')
                .map(|opt| format!("{prefix}{opt}{suffix}"))
                .collect();
        }
    }
    vec![s.to_string()]
}

/// Best-effort symlink-resolved form of `path`: canonicalizes if the path
/// exists, otherwise falls back to a purely lexical normalization (the
/// command may reference a path that doesn't exist yet, e.g. before a
/// `Write`).
fn resolved_form(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        let s = path.to_string_lossy();
        let normalized = normalize_path_like(&s).into_iter().next().unwrap_or_default();
        PathBuf::from(normalized)
    })
}

/// Checks a single path form (already resolved or still lexical — callers
/// try both) against the static sensitive-name rules.
fn classify(path: &Path, broker_data_dir: &Path) -> bool {
    let s = path.to_string_lossy().to_string();

    if path.starts_with(broker_data_dir) {
        return true;
    }
    for prefix in TEMP_DIR_PREFIXES {
        if s.starts_with(prefix) {
            return true;
        }
    }
    let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if is_dotenv(basename) || is_secrets_file(basename) {
        return true;
    }
    if EXACT_BASENAMES.iter().any(|n| has_basename(&s, n)) {
        return true;
    }
    if path.components().any(|c| {
        let c = c.as_os_str().to_string_lossy();
        SENSITIVE_DIR_COMPONENTS.iter().any(|d| c.eq_ignore_ascii_case(d))
    }) {
        return true;
    }
    if BROWSER_PROFILE_MARKERS.iter().any(|m| s.contains(m)) {
        return true;
    }
    if s == "/proc/self/environ" || s == "/proc/self/cmdline" {
        return true;
    }
    false
}

/// Evaluates `path` both as given (so literal `/proc/self/...` references
/// are caught even though resolving that symlink would rewrite them to a
/// pid-specific path) and in its symlink-resolved form (so an indirect
/// route to a sensitive file via a symlink is still caught).
pub fn is_sensitive_path(path: &Path, broker_data_dir: &Path) -> bool {
    if let Ok(data_dir) = std::fs::canonicalize(broker_data_dir) {
        if let Ok(resolved) = std::fs::canonicalize(path) {
            if resolved.starts_with(&data_dir) {
                return true;
            }
        }
    }
    if classify(path, broker_data_dir) {
        return true;
    }
    classify(&resolved_form(path), broker_data_dir)
}

/// Checks every normalized candidate form of `raw` (a path-like string
/// taken from tool input, possibly referencing an env var) against
/// `is_sensitive_path`, expanding `CLAUDE_CONFIG_DIR`-style references
/// first if present in the environment.
pub fn is_sensitive_path_str(raw: &str, broker_data_dir: &Path) -> bool {
    let expanded = expand_known_env_vars(raw);
    normalize_path_like(&expanded).iter().any(|candidate| is_sensitive_path(Path::new(candidate), broker_data_dir))
}

fn expand_known_env_vars(raw: &str) -> String {
    let mut out = raw.to_string();
    for var in ["CLAUDE_CONFIG_DIR", "HOME", "XDG_CONFIG_HOME"] {
        if let Ok(value) = std::env::var(var) {
            out = out.replace(&format!("${var}"), &value);
            out = out.replace(&format!("${{{var}}}"), &value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_dotenv_and_secrets_files() {
        assert!(is_sensitive_path_str(".env", Path::new("/broker/data")));
        assert!(is_sensitive_path_str(".env.production", Path::new("/broker/data")));
        assert!(is_sensitive_path_str("config/secrets.yaml", Path::new("/broker/data")));
    }

    #[test]
    fn flags_ssh_and_aws_dirs() {
        assert!(is_sensitive_path_str("/home/user/.ssh/id_rsa", Path::new("/broker/data")));
        assert!(is_sensitive_path_str("/home/user/.aws/credentials", Path::new("/broker/data")));
    }

    #[test]
    fn flags_proc_self_environ() {
        assert!(is_sensitive_path_str("/proc/self/environ", Path::new("/broker/data")));
    }

    #[test]
    fn flags_broker_data_dir_itself() {
        assert!(is_sensitive_path_str("/broker/data/vault.json", Path::new("/broker/data")));
    }

    #[test]
    fn does_not_flag_ordinary_project_files() {
        assert!(!is_sensitive_path_str("/home/user/project/src/main.rs", Path::new("/broker/data")));
    }

    #[test]
    fn normalizes_dot_slash_and_dot_dot() {
        let normalized = normalize_path_like("./a/../.ssh/id_rsa");
        assert_eq!(normalized[0], ".ssh/id_rsa");
    }

    #[test]
    fn expands_simple_brace_groups() {
        let expanded = expand_braces("/home/user/.{ssh,aws}/config");
        assert_eq!(expanded, vec!["/home/user/.ssh/config".to_string(), "/home/user/.aws/config".to_string()]);
    }
}

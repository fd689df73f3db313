//! Input sanitization for container names and repository URLs.
//!
//! Everything that ends up in a runtime object name, a label, or a shell
//! command inside the container passes through here first.

use std::sync::LazyLock;

use dockyard_common::{DockyardError, MAX_NAME_LEN};
use regex::Regex;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid name regex"));

/// `git@host:owner/repo(.git)`
static SCP_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^git@([A-Za-z0-9.-]+):([A-Za-z0-9._/-]+)$").expect("valid scp url regex")
});

static REPO_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9._~/-]+$").expect("valid repo path regex"));

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '<', '>', '\\', '"', '\'', '\n', '\r', '\t', ' ', '*', '?',
    '{', '}', '[', ']', '!',
];

pub const DEFAULT_ALLOWED_GIT_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.org"];

/// Trim, strip path separators, and validate a container name.
pub fn sanitize_name(raw: &str) -> Result<String, DockyardError> {
    let trimmed = raw.trim();
    if trimmed.contains("..") {
        return Err(DockyardError::validation(
            "name",
            "must not contain path traversal sequences",
        ));
    }
    let name: String = trimmed.chars().filter(|c| *c != '/' && *c != '\\').collect();
    if name.is_empty() {
        return Err(DockyardError::validation("name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(DockyardError::validation(
            "name",
            format!("must be at most {} characters", MAX_NAME_LEN),
        ));
    }
    if !NAME_RE.is_match(&name) {
        return Err(DockyardError::validation(
            "name",
            "may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(name)
}

/// Validate a clone URL and return its canonical `https://host/path` form.
///
/// Credentials, query string and fragment are dropped. SCP-style
/// `git@host:owner/repo` is rewritten to https.
pub fn sanitize_repo_url(raw: &str, allowed_hosts: &[String]) -> Result<String, DockyardError> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(DockyardError::validation("repo_url", "must not be empty"));
    }

    let (host, path) = if let Some(caps) = SCP_URL_RE.captures(url) {
        (caps[1].to_string(), format!("/{}", &caps[2]))
    } else {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("git://"))
            .ok_or_else(|| {
                DockyardError::validation("repo_url", "only https:// and git:// URLs are allowed")
            })?;
        let rest = rest.split(['?', '#']).next().unwrap_or_default();
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        // Drop `user:token@`.
        let host = authority.rsplit('@').next().unwrap_or_default();
        let host = host.split(':').next().unwrap_or_default();
        (host.to_ascii_lowercase(), path.to_string())
    };

    if host.is_empty() {
        return Err(DockyardError::validation("repo_url", "missing host"));
    }
    if !allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(&host)) {
        return Err(DockyardError::validation(
            "repo_url",
            format!("host '{}' is not in the allowed list", host),
        ));
    }
    if path.contains(SHELL_METACHARACTERS) {
        return Err(DockyardError::validation(
            "repo_url",
            "contains shell metacharacters",
        ));
    }
    if path.contains("..") || !REPO_PATH_RE.is_match(&path) {
        return Err(DockyardError::validation(
            "repo_url",
            "must name a repository path",
        ));
    }
    let path = path.trim_end_matches('/');
    if path.trim_start_matches('/').is_empty() {
        return Err(DockyardError::validation(
            "repo_url",
            "must name a repository path",
        ));
    }

    Ok(format!("https://{}{}", host, path))
}

pub fn default_allowed_hosts() -> Vec<String> {
    DEFAULT_ALLOWED_GIT_HOSTS
        .iter()
        .map(|h| h.to_string())
        .collect()
}

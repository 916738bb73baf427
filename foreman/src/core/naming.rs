//! Deterministic names for tasks, branches, workspaces and sessions.
//!
//! Re-invoking foreman with the same description and mode must land on the same
//! names so that provisioning and session start attach instead of duplicating.

use sha2::{Digest, Sha256};

use crate::core::types::Mode;

/// Maximum length of the description-derived slug.
pub const SLUG_MAX_LEN: usize = 39;
/// Maximum length of a task id (slug plus hash suffix).
pub const TASK_ID_MAX_LEN: usize = 48;

const BRANCH_PREFIX: &str = "foreman/";
const SESSION_PREFIX: &str = "foreman-";

/// Lowercase `input`, collapse runs of non-alphanumerics into `-`, and cap the length.
///
/// Returns `"task"` when nothing usable remains.
pub fn slugify(input: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(max_len);
    let trimmed = slug.trim_end_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Derive a task id from the description and mode: `<slug>-<hash8>`.
pub fn derive_task_id(description: &str, mode: Mode) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(mode.as_str().as_bytes());
    let digest = hex::encode(hasher.finalize());
    let slug = slugify(description, SLUG_MAX_LEN);
    format!("{slug}-{}", &digest[..8])
}

/// Token that scopes completion signals to one dispatch of `task_id`.
///
/// `nonce` must differ between dispatches (the dispatch timestamp does).
pub fn run_token(task_id: &str, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(nonce.as_bytes());
    hex::encode(hasher.finalize())[..8].to_string()
}

/// Sanitize an operator-supplied task id into the same alphabet as derived ids.
pub fn sanitize_task_id(raw: &str) -> String {
    slugify(raw, TASK_ID_MAX_LEN)
}

pub fn branch_name(task_id: &str) -> String {
    format!("{BRANCH_PREFIX}{task_id}")
}

pub fn session_name(task_id: &str) -> String {
    format!("{SESSION_PREFIX}{task_id}")
}

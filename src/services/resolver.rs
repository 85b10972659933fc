//! Resolve a raw URL tail into a (ref, path) pair.
//!
//! Ref names may themselves contain slashes (`feature/auth`), so splitting on
//! the first `/` is wrong. Resolution matches the longest known ref that
//! prefixes the input on a segment boundary, then falls back to treating a
//! full 40-hex first segment as a detached commit sha.

use crate::error::AppError;

const DEFAULT_PATH: &str = "README.md";

/// A resolved ref name and file path within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub ref_name: String,
    pub path: String,
}

/// Resolve `raw` (e.g. `feature/auth/src/lib.rs`) against the known ref
/// names, with `head` as the default ref for an empty input.
///
/// Returns `None` when no ref matches and the first segment is not a full
/// commit sha; abbreviated shas are not resolved.
pub fn resolve_ref_and_path(refs: &[String], head: &str, raw: &str) -> Option<ResolvedPath> {
    let raw = raw.trim_matches('/');

    if raw.is_empty() {
        return Some(ResolvedPath {
            ref_name: head.to_string(),
            path: DEFAULT_PATH.to_string(),
        });
    }

    // Longest ref whose name prefixes the input on a segment boundary
    let mut best: Option<&str> = None;
    for name in refs {
        let matches = raw == name.as_str()
            || (raw.starts_with(name.as_str()) && raw.as_bytes().get(name.len()) == Some(&b'/'));
        if matches && best.map(|b| name.len() > b.len()).unwrap_or(true) {
            best = Some(name);
        }
    }

    if let Some(name) = best {
        let rest = raw[name.len()..].trim_start_matches('/');
        return Some(ResolvedPath {
            ref_name: name.to_string(),
            path: if rest.is_empty() {
                DEFAULT_PATH.to_string()
            } else {
                rest.to_string()
            },
        });
    }

    // Detached sha: full 40-hex first segment only
    let first = raw.split('/').next().unwrap_or(raw);
    if is_full_sha(first) {
        let rest = raw[first.len()..].trim_start_matches('/');
        return Some(ResolvedPath {
            ref_name: first.to_string(),
            path: if rest.is_empty() {
                DEFAULT_PATH.to_string()
            } else {
                rest.to_string()
            },
        });
    }

    None
}

/// Resolve or fail with a typed not-found error.
pub fn resolve_ref_and_path_checked(
    refs: &[String],
    head: &str,
    raw: &str,
) -> Result<ResolvedPath, AppError> {
    resolve_ref_and_path(refs, head, raw)
        .ok_or_else(|| AppError::not_found_with_id("ref", raw))
}

fn is_full_sha(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

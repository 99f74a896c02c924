//! Canonical path handling
//!
//! Every cache key and every path handed to a [`RemoteStore`](crate::remote::RemoteStore)
//! is absolute, slash-separated and carries no trailing slash (except root).

/// Root path
pub const ROOT: &str = "/";

/// Normalize a path to its canonical form
pub fn normalize(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == ROOT {
        return ROOT.to_string();
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        ROOT.to_string()
    } else {
        normalized
    }
}

/// Get the parent path of a given path
pub fn parent(path: &str) -> String {
    let normalized = normalize(path);
    if normalized == ROOT {
        return ROOT.to_string();
    }

    match normalized.rfind('/') {
        Some(0) | None => ROOT.to_string(),
        Some(pos) => normalized[..pos].to_string(),
    }
}

/// Get the last component of a path
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "";
    }

    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Join a child name onto a folder path
pub fn join(folder: &str, name: &str) -> String {
    let folder = normalize(folder);
    if folder == ROOT {
        normalize(name)
    } else {
        normalize(&format!("{}/{}", folder, name))
    }
}

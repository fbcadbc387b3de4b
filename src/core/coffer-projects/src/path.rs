//! Folder paths and secret-path globs.
//!
//! Folder paths are absolute and `/`-separated: `/`, `/app`, `/app/db`.
//! Policies and privileges select folders with globs where `*` matches within
//! one segment and `**` matches any number of segments.

use crate::ProjectError;

/// Longest glob accepted.
pub const MAX_GLOB_LEN: usize = 512;

/// Most `*`/`?` wildcards a glob may contain.
pub const MAX_GLOB_WILDCARDS: usize = 16;

/// Normalizes a folder path: leading `/`, no trailing `/`, no empty segments.
pub fn normalize(path: &str) -> Result<String, ProjectError> {
    let trimmed = path.trim();
    if !trimmed.starts_with('/') {
        return Err(ProjectError::Invalid(format!(
            "path '{}' must start with /",
            path
        )));
    }

    let mut segments = Vec::new();
    for segment in trimmed.split('/').skip(1) {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(ProjectError::Invalid(format!(
                "path '{}' contains a relative segment",
                path
            )));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ProjectError::Invalid(format!(
                "path segment '{}' contains invalid characters",
                segment
            )));
        }
        segments.push(segment);
    }

    Ok(format!("/{}", segments.join("/")))
}

/// Joins a parent folder path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Returns whether `path` is `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor == "/" || path == ancestor || path.starts_with(&format!("{}/", ancestor))
}

/// Checks that `pattern` is an absolute glob of bounded size and strips any
/// trailing `/`.
pub fn validate_glob(pattern: &str) -> Result<String, ProjectError> {
    let trimmed = pattern.trim();
    if !trimmed.starts_with('/') || trimmed.contains("//") {
        return Err(ProjectError::Invalid(format!(
            "secret path '{}' must be an absolute glob",
            pattern
        )));
    }
    if trimmed.len() > MAX_GLOB_LEN {
        return Err(ProjectError::Invalid(format!(
            "secret path glob is longer than {} characters",
            MAX_GLOB_LEN
        )));
    }
    let wildcards = trimmed.chars().filter(|c| *c == '*' || *c == '?').count();
    if wildcards > MAX_GLOB_WILDCARDS {
        return Err(ProjectError::Invalid(format!(
            "secret path glob has more than {} wildcards",
            MAX_GLOB_WILDCARDS
        )));
    }

    Ok(if trimmed.len() > 1 {
        trimmed.trim_end_matches('/').to_string()
    } else {
        trimmed.to_string()
    })
}

/// Matches a normalized path against a glob.
///
/// Runs in `O(pattern * path)` steps per level.
pub fn glob_matches(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    wildcard_match(
        &pattern,
        &path,
        |p| *p == "**",
        |p, s| match_segment(p.as_bytes(), s.as_bytes()),
    )
}

fn match_segment(pattern: &[u8], text: &[u8]) -> bool {
    wildcard_match(
        pattern,
        text,
        |p| *p == b'*',
        |p, c| *p == b'?' || p == c,
    )
}

/// Greedy wildcard matching with a single backtrack point: on a mismatch,
/// retry from the most recent star with one more element consumed by it.
fn wildcard_match<P, T>(
    pattern: &[P],
    text: &[T],
    is_star: impl Fn(&P) -> bool,
    matches: impl Fn(&P, &T) -> bool,
) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && is_star(&pattern[p]) {
            star = Some((p, t));
            p += 1;
        } else if p < pattern.len() && matches(&pattern[p], &text[t]) {
            p += 1;
            t += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, t));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(is_star)
}

/// Ranks a glob by specificity, higher is more specific.
///
/// Literal segments weigh more than wildcard segments, and deeper globs more
/// than shallow ones.
pub fn specificity(pattern: &str) -> usize {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s {
            "**" => 1,
            s if s.contains('*') || s.contains('?') => 2,
            _ => 4,
        })
        .sum()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("/app/").unwrap(), "/app");
        assert_eq!(normalize("//app//db").unwrap(), "/app/db");
        assert!(normalize("app").is_err());
        assert!(normalize("/app/../etc").is_err());
        assert!(normalize("/app db").is_err());
    }

    #[test]
    fn test_join_and_within() {
        assert_eq!(join("/", "app"), "/app");
        assert_eq!(join("/app", "db"), "/app/db");
        assert!(is_within("/app/db", "/app"));
        assert!(is_within("/app", "/"));
        assert!(!is_within("/application", "/app"));
    }

    #[test]
    fn test_glob_literal() {
        assert!(glob_matches("/", "/"));
        assert!(glob_matches("/app", "/app"));
        assert!(!glob_matches("/app", "/app/db"));
    }

    #[test]
    fn test_glob_single_star() {
        assert!(glob_matches("/app/*", "/app/db"));
        assert!(!glob_matches("/app/*", "/app/db/replica"));
        assert!(glob_matches("/svc-*", "/svc-billing"));
        assert!(!glob_matches("/svc-*", "/api"));
    }

    #[test]
    fn test_glob_double_star() {
        assert!(glob_matches("/**", "/"));
        assert!(glob_matches("/**", "/a/b/c"));
        assert!(glob_matches("/app/**", "/app"));
        assert!(glob_matches("/app/**/db", "/app/x/y/db"));
        assert!(!glob_matches("/app/**", "/other"));
    }

    #[test]
    fn test_specificity_orders_globs() {
        assert!(specificity("/app/db") > specificity("/app/*"));
        assert!(specificity("/app/*") > specificity("/app/**"));
        assert!(specificity("/app/**") > specificity("/**"));
    }

    #[test]
    fn test_glob_wildcards_mixed() {
        assert!(glob_matches("/a?c/**/*-db", "/abc/x/y/main-db"));
        assert!(!glob_matches("/a?c/**/*-db", "/abc/x/y/main"));
        assert!(glob_matches("/**/**/db", "/db"));
        assert!(glob_matches("/*a*b", "/xaab"));
        assert!(!glob_matches("/*a*b", "/xaabc"));
    }

    #[test]
    fn test_glob_adversarial_pattern_is_fast() {
        let pattern = "/*a*a*a*a*a*a*a*a*a*a*a*a*b";
        let path = format!("/{}", "a".repeat(40));
        let started = std::time::Instant::now();
        assert!(!glob_matches(pattern, &path));
        let deep = format!("/{}", vec!["x"; 40].join("/"));
        assert!(!glob_matches("/**/**/**/**/**/**/**/**/y", &deep));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_validate_glob() {
        assert_eq!(validate_glob("/app/").unwrap(), "/app");
        assert_eq!(validate_glob(" / ").unwrap(), "/");
        assert!(validate_glob("app/*").is_err());
        assert!(validate_glob("/app//db").is_err());
        assert!(validate_glob(&format!("/{}", "*a".repeat(17))).is_err());
        assert!(validate_glob(&format!("/{}", "a".repeat(MAX_GLOB_LEN))).is_err());
        assert!(validate_glob("/*a*a*a*a*a*a*a*a*a*a*a*a*b").is_ok());
    }
}

use once_cell::sync::Lazy;
use regex::Regex;

static REPO_PATTERNS: Lazy<[Regex; 4]> = Lazy::new(|| {
    [
        r"^https?://github\.com/([^/]+/[^/]+?)(?:\.git)?/?$",
        r"^git@github\.com:([^/]+/[^/]+?)(?:\.git)?$",
        r"^github\.com/([^/]+/[^/]+?)(?:\.git)?/?$",
        r"^([A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+)$",
    ]
    .map(|pattern| Regex::new(pattern).unwrap_or_else(|err| panic!("invalid pattern {pattern}: {err}")))
});

/// Normalizes a GitHub reference (`https://github.com/u/r.git`,
/// `git@github.com:u/r.git`, `github.com/u/r`, or bare `u/r`) to `u/r`.
pub fn parse_repo(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    REPO_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(input)
            .and_then(|captures| captures.get(1))
            .map(|repo| repo.as_str().to_string())
    })
}

/// The workspace selector is the first word of the SSH command, if any.
pub fn selector_from_command(command: &str) -> Option<String> {
    command.split_whitespace().next().and_then(parse_repo)
}

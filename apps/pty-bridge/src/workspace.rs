use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, warn};

/// Directory the terminal starts in, plus a user-facing note when the
/// requested repository could not be prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedWorkspace {
    pub dir: PathBuf,
    pub warning: Option<String>,
}

/// Resolves a workspace selector into a checked-out directory under `root`.
/// Clone and pull failures never abort startup; the terminal then opens in
/// `root` instead.
#[derive(Debug, Clone)]
pub struct WorkspacePreparer {
    root: PathBuf,
    git_base_url: String,
}

impl WorkspacePreparer {
    pub fn new(root: impl Into<PathBuf>, git_base_url: impl Into<String>) -> Self {
        let mut git_base_url = git_base_url.into();
        if !git_base_url.ends_with('/') {
            git_base_url.push('/');
        }
        Self {
            root: root.into(),
            git_base_url,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self, repo: Option<&str>) -> PreparedWorkspace {
        if let Err(err) = tokio::fs::create_dir_all(&self.root).await {
            warn!(root = %self.root.display(), error = %err, "failed to create workspace root");
        }

        let Some(repo) = repo.map(str::trim).filter(|repo| !repo.is_empty()) else {
            return self.fallback(None);
        };
        let Some(name) = repo_dir_name(repo) else {
            warn!(repo, "workspace selector has no usable directory name");
            return self.fallback(Some(format!("ignoring workspace selector `{repo}`")));
        };

        let dir = self.root.join(name);
        if tokio::fs::metadata(dir.join(".git")).await.is_ok() {
            info!(repo, dir = %dir.display(), "repository present; pulling latest");
            // A failed pull (detached HEAD, diverged branch, offline) still
            // leaves a usable checkout.
            if let Err(err) = run_git(&["pull", "--ff-only"], Some(&dir)).await {
                warn!(repo, error = %err, "git pull failed; continuing with existing checkout");
            }
            return PreparedWorkspace { dir, warning: None };
        }

        let url = self.clone_url(repo);
        info!(repo, url = %url, dir = %dir.display(), "cloning repository");
        let dir_arg = dir.to_string_lossy().into_owned();
        match run_git(&["clone", "--depth=1", &url, &dir_arg], None).await {
            Ok(()) => PreparedWorkspace { dir, warning: None },
            Err(err) => {
                warn!(repo, error = %err, "git clone failed; using default directory");
                self.fallback(Some(format!("Warning: failed to clone {repo}: {err}")))
            }
        }
    }

    /// `user/repo` shorthands resolve against the configured git host; full
    /// URLs pass through untouched.
    pub fn clone_url(&self, repo: &str) -> String {
        if repo.starts_with("http://")
            || repo.starts_with("https://")
            || repo.starts_with("git@")
            || repo.starts_with("file://")
        {
            repo.to_string()
        } else {
            format!("{}{}", self.git_base_url, repo)
        }
    }

    fn fallback(&self, warning: Option<String>) -> PreparedWorkspace {
        PreparedWorkspace {
            dir: self.root.clone(),
            warning,
        }
    }
}

/// Last path segment without a `.git` suffix (`user/repo.git` → `repo`).
pub fn repo_dir_name(repo: &str) -> Option<String> {
    let last = repo
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()?
        .trim_end_matches(".git");
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}

async fn run_git(args: &[&str], cwd: Option<&Path>) -> anyhow::Result<()> {
    let mut command = Command::new("git");
    command.args(args).env("GIT_TERMINAL_PROMPT", "0");
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command.output().await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = stderr.lines().last().unwrap_or("").trim().to_string();
    anyhow::bail!("git {} exited with {}: {}", args[0], output.status, detail)
}

use crate::config::GitConfig;
use crate::image::name::strip_scheme;
use log::debug;
use regex::Regex;
use reqwest::Url;
use std::process::{ExitStatus, Output, Stdio};
use std::sync::LazyLock;
use thiserror::Error;
use tokio::process::Command;

const REMOTE_PREFIX: &str = "refs/remotes/origin/";

static USERINFO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"://[^/@\s]+@").expect("valid regex"));

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid git path {0:?}")]
    InvalidPath(String),

    #[error("git {command} failed with exit code {status}: {stderr}")]
    Git {
        command: &'static str,
        status: ExitStatus,
        stderr: String,
    },

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Lists the branches of a remote repository, for branch pickers.
#[derive(Debug, Clone)]
pub struct GitBranchEnumerator {
    config: GitConfig,
}

impl GitBranchEnumerator {
    pub fn new(config: GitConfig) -> Self {
        Self { config }
    }

    /// Clone URL for `git_path` (e.g. `git.example.com/team/app.git`) with the
    /// service credentials embedded.
    pub fn clone_url(&self, git_path: &str) -> Result<Url, Error> {
        let invalid = || Error::InvalidPath(git_path.to_string());
        let mut url = Url::parse(&format!("{}://{}", self.config.scheme, strip_scheme(git_path))).map_err(|_| invalid())?;
        if !self.config.username.is_empty() {
            url.set_username(&self.config.username).map_err(|_| invalid())?;
            url.set_password(Some(&self.config.password)).map_err(|_| invalid())?;
        }
        Ok(url)
    }

    /// Shallow clone without a checkout into a scratch directory, then read the remote branch names.
    /// Branches come back sorted.
    pub async fn list_branches(&self, git_path: &str) -> Result<Vec<String>, Error> {
        let url = self.clone_url(git_path)?;
        let scratch = tempfile::tempdir()?;
        debug!("Listing branches of {git_path}");

        let output = Command::new("git")
            .arg("clone")
            .arg("--quiet")
            .arg("--depth")
            .arg("1")
            .arg("--no-checkout")
            .arg("--no-single-branch")
            .arg(url.as_str())
            .arg(scratch.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await?;
        self.check("clone", &output)?;

        let output = Command::new("git")
            .arg("-C")
            .arg(scratch.path())
            .arg("for-each-ref")
            .arg("--format=%(refname)")
            .arg(REMOTE_PREFIX)
            .stdin(Stdio::null())
            .output()
            .await?;
        self.check("for-each-ref", &output)?;

        let branches = remote_branches(&String::from_utf8_lossy(&output.stdout));
        debug!("{} branches found in {git_path}", branches.len());
        Ok(branches)
    }

    fn check(&self, command: &'static str, output: &Output) -> Result<(), Error> {
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Git {
                command,
                status: output.status,
                stderr: redact(String::from_utf8_lossy(&output.stderr).trim()),
            })
        }
    }
}

/// Git echoes the remote URL, credentials included, in its errors.
fn redact(text: &str) -> String {
    USERINFO.replace_all(text, "://***@").into_owned()
}

/// Short branch names from `refs/remotes/origin/*` reference names, one per line.
pub fn remote_branches(refs: &str) -> Vec<String> {
    let mut branches: Vec<String> = refs
        .lines()
        .filter_map(|line| line.trim().strip_prefix(REMOTE_PREFIX))
        .filter(|branch| !branch.is_empty() && *branch != "HEAD")
        .map(str::to_string)
        .collect();
    branches.sort();
    branches.dedup();
    branches
}

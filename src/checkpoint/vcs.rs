//! Git-backed version control snapshot.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::testing::GitOperations;

/// Runs the `git` binary against a working tree.
#[derive(Debug, Clone)]
pub struct RealGitOperations {
    project_dir: PathBuf,
}

impl RealGitOperations {
    #[must_use]
    pub fn new(project_dir: PathBuf) -> Self {
        Self { project_dir }
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.project_dir)
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }
}

impl GitOperations for RealGitOperations {
    fn get_commit_hash(&self) -> Result<String> {
        let output = self.git(&["rev-parse", "HEAD"])?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            // No repository or no commits yet.
            Ok(String::new())
        }
    }

    fn get_branch(&self) -> Result<String> {
        let output = self.git(&["branch", "--show-current"])?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            bail!("Not in a git repository")
        }
    }

    fn get_modified_files(&self) -> Result<Vec<String>> {
        let output = self.git(&["status", "--porcelain"])?;
        if !output.status.success() {
            return Ok(Vec::new());
        }

        // "XY path" or "XY old -> new" for renames
        let files = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| {
                let path = &line[3..];
                path.rsplit_once(" -> ")
                    .map_or(path, |(_, new)| new)
                    .to_string()
            })
            .collect();
        Ok(files)
    }
}

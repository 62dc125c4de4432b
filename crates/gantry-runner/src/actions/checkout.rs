use super::{Action, ActionInput, ActionOutput};
use gantry_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

/// Directories never copied into a workspace.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// Places the project source into the instance workspace.
///
/// With a `repository` input the repository is cloned; otherwise the local
/// source tree is copied.
pub struct CheckoutAction;

impl Default for CheckoutAction {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckoutAction {
    pub fn new() -> Self {
        Self
    }

    fn clone_repository(
        &self,
        repo: &str,
        ref_name: Option<&str>,
        dest: &Path,
        input: &ActionInput,
    ) -> Result<ActionOutput> {
        info!(repository = %repo, dest = %dest.display(), "Cloning repository");

        let output = Command::new("git")
            .args(["clone", "--quiet", repo])
            .arg(dest)
            .current_dir(&input.workspace)
            .output()
            .map_err(|e| Error::ActionFailed(format!("Failed to execute git clone: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(ActionOutput::failure(format!(
                "git clone failed: {}",
                stderr.trim()
            )));
        }

        if let Some(ref_name) = ref_name {
            let output = Command::new("git")
                .args(["checkout", "--quiet", ref_name])
                .current_dir(dest)
                .output()
                .map_err(|e| {
                    Error::ActionFailed(format!("Failed to execute git checkout: {}", e))
                })?;

            if !output.status.success() {
                return Ok(ActionOutput::failure(format!(
                    "git checkout {} failed",
                    ref_name
                )));
            }
        }

        Ok(ActionOutput::success().with_log(format!("Cloned {} into {}", repo, dest.display())))
    }
}

impl Action for CheckoutAction {
    fn name(&self) -> &str {
        "checkout"
    }

    fn execute(&self, input: &ActionInput) -> Result<ActionOutput> {
        let dest = match input.relative_path("path")? {
            Some(path) => input.workspace.join(path),
            None => input.workspace.clone(),
        };

        if let Some(repo) = input.input("repository") {
            return self.clone_repository(repo, input.input("ref"), &dest, input);
        }

        if !input.source_dir.is_dir() {
            return Ok(ActionOutput::failure(format!(
                "Source directory {} does not exist",
                input.source_dir.display()
            )));
        }

        info!(
            source = %input.source_dir.display(),
            dest = %dest.display(),
            "Copying source tree"
        );
        std::fs::create_dir_all(&dest)?;
        // Canonical forms, so `./gantry-artifacts` and friends match however
        // they were spelled.
        let excluded: Vec<PathBuf> = input
            .protected_dirs
            .iter()
            .chain(std::iter::once(&dest))
            .filter_map(|dir| dir.canonicalize().ok())
            .collect();
        let files = copy_tree(&input.source_dir, &dest, &excluded)?;

        Ok(ActionOutput::success().with_log(format!(
            "Checked out {} files from {}",
            files,
            input.source_dir.display()
        )))
    }
}

fn copy_tree(from: &Path, to: &Path, excluded: &[PathBuf]) -> Result<usize> {
    std::fs::create_dir_all(to)?;
    let mut copied = 0;

    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        let file_type = entry.file_type()?;
        let target = to.join(&name);

        if file_type.is_dir() {
            let path = entry.path();
            if SKIPPED_DIRS.iter().any(|skip| name == *skip) || is_excluded(&path, excluded) {
                continue;
            }
            copied += copy_tree(&path, &target, excluded)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

fn is_excluded(dir: &Path, excluded: &[PathBuf]) -> bool {
    dir.canonicalize()
        .map(|dir| excluded.contains(&dir))
        .unwrap_or(false)
}

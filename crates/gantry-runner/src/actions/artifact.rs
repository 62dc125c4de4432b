use super::{Action, ActionInput, ActionOutput};
use gantry_core::ids::ArtifactId;
use gantry_core::run::Artifact;
use gantry_core::{Error, Result};
use std::path::Path;
use tracing::info;

/// Copies a file or directory out of the workspace into the artifact store
/// so it survives environment teardown.
///
/// Inputs: `name` (required) and `path` (required, relative to the
/// workspace). Neither may leave its directory.
pub struct UploadArtifactAction;

impl Default for UploadArtifactAction {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadArtifactAction {
    pub fn new() -> Self {
        Self
    }
}

impl Action for UploadArtifactAction {
    fn name(&self) -> &str {
        "upload-artifact"
    }

    fn execute(&self, input: &ActionInput) -> Result<ActionOutput> {
        let name = input.required_path("name")?;
        let path = input.required_path("path")?;

        let source = input.workspace.join(path);
        if !source.exists() {
            return Ok(ActionOutput::failure(format!(
                "Artifact path {} does not exist",
                path.display()
            )));
        }

        let dest = input.artifacts_dir.join(name);
        if dest.exists() {
            return Ok(ActionOutput::failure(format!(
                "Artifact {} already exists",
                name.display()
            )));
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let size_bytes = copy_recursive(&source, &dest).map_err(|e| {
            Error::ActionFailed(format!("Failed to store artifact {}: {}", name.display(), e))
        })?;

        let name = name.to_string_lossy().into_owned();
        info!(artifact = %name, dest = %dest.display(), size_bytes, "Stored artifact");

        let mut output = ActionOutput::success().with_log(format!(
            "Uploaded artifact {} ({} bytes)",
            name, size_bytes
        ));
        output.artifacts.push(Artifact {
            id: ArtifactId::new(),
            name,
            path: dest,
            size_bytes,
        });
        Ok(output)
    }
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<u64> {
    if from.is_file() {
        return std::fs::copy(from, to);
    }

    std::fs::create_dir_all(to)?;
    let mut total = 0;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        total += copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(total)
}

//! Locating and loading pipeline files.

use anyhow::{Context, Result, bail};
use gantry_core::pipeline::PipelineDefinition;
use std::path::{Path, PathBuf};

/// Standard locations searched when no path is given, in order.
pub const CANDIDATES: &[&str] = &[
    "gantry.yaml",
    "gantry.yml",
    ".gantry/pipeline.yaml",
    ".gantry/pipeline.yml",
    ".gantry.yaml",
    ".gantry.yml",
];

/// Find the pipeline file, either `path` or the first standard location
/// present under `root`.
pub fn find_pipeline_file(root: &Path, path: Option<&str>) -> Result<PathBuf> {
    if let Some(p) = path {
        let path = PathBuf::from(p);
        if !path.exists() {
            bail!("Pipeline file not found: {}", path.display());
        }
        return Ok(path);
    }

    CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.exists())
        .with_context(|| {
            format!(
                "No pipeline file found in {} (looked for {})",
                root.display(),
                CANDIDATES.join(", ")
            )
        })
}

/// Parse a pipeline definition from YAML.
pub fn load_pipeline(path: &Path) -> Result<PipelineDefinition> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_pipeline(&content).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_pipeline(content: &str) -> Result<PipelineDefinition> {
    Ok(serde_yaml::from_str(content)?)
}

/// Directory the checkout action copies from: the repository holding the
/// pipeline file.
pub fn source_dir_for(pipeline_path: &Path) -> PathBuf {
    let mut dir = pipeline_path.parent().filter(|p| !p.as_os_str().is_empty());
    if dir.and_then(Path::file_name).is_some_and(|name| name == ".gantry") {
        dir = dir.and_then(Path::parent).filter(|p| !p.as_os_str().is_empty());
    }
    dir.unwrap_or(Path::new(".")).to_path_buf()
}

use super::{Action, ActionInput, ActionOutput};
use gantry_core::Result;
use std::process::Command;
use tracing::{debug, info};

/// Verifies a language runtime of the requested version is on `PATH`.
///
/// Inputs: `language` (required) and `version`. Candidate binaries are
/// tried in order: `<language><version>` then `<language>`.
pub struct SetupRuntimeAction;

impl Default for SetupRuntimeAction {
    fn default() -> Self {
        Self::new()
    }
}

impl SetupRuntimeAction {
    pub fn new() -> Self {
        Self
    }

    fn candidates(language: &str, version: Option<&str>) -> Vec<String> {
        let mut candidates = Vec::new();
        if let Some(version) = version {
            candidates.push(format!("{}{}", language, version));
        }
        candidates.push(language.to_string());
        candidates
    }
}

impl Action for SetupRuntimeAction {
    fn name(&self) -> &str {
        "setup-runtime"
    }

    fn execute(&self, input: &ActionInput) -> Result<ActionOutput> {
        let language = input.required("language")?;
        let version = input.input("version");

        info!(language = %language, version = ?version, "Setting up runtime");

        for binary in Self::candidates(language, version) {
            let output = match Command::new(&binary)
                .arg("--version")
                .envs(&input.env)
                .output()
            {
                Ok(output) => output,
                Err(e) => {
                    debug!(binary = %binary, error = %e, "Runtime candidate not found");
                    continue;
                }
            };

            if !output.status.success() {
                continue;
            }

            // Some tools print their version on stderr.
            let reported = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let reported = if reported.is_empty() {
                String::from_utf8_lossy(&output.stderr).trim().to_string()
            } else {
                reported
            };

            if let Some(version) = version
                && !reported.contains(version)
            {
                debug!(binary = %binary, reported = %reported, "Runtime version mismatch");
                continue;
            }

            return Ok(ActionOutput::success().with_log(format!("Using {}: {}", binary, reported)));
        }

        Ok(ActionOutput::failure(match version {
            Some(v) => format!("No {} {} runtime found on PATH", language, v),
            None => format!("No {} runtime found on PATH", language),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn input(pairs: &[(&str, &str)]) -> ActionInput {
        ActionInput {
            inputs: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            env: BTreeMap::new(),
            workspace: std::env::temp_dir(),
            source_dir: std::env::temp_dir(),
            artifacts_dir: std::env::temp_dir(),
            protected_dirs: Vec::new(),
            step_name: "setup".to_string(),
        }
    }

    #[test]
    fn test_candidate_order() {
        assert_eq!(
            SetupRuntimeAction::candidates("python", Some("3.9")),
            vec!["python3.9".to_string(), "python".to_string()]
        );
        assert_eq!(
            SetupRuntimeAction::candidates("node", None),
            vec!["node".to_string()]
        );
    }

    #[test]
    fn test_missing_runtime_fails() {
        let output = SetupRuntimeAction::new()
            .execute(&input(&[("language", "gantry-no-such-tool")]))
            .unwrap();
        assert!(!output.success);
    }

    #[test]
    fn test_language_is_required() {
        assert!(SetupRuntimeAction::new().execute(&input(&[])).is_err());
    }
}

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("interpolation pattern is valid")
    })
}

/// Context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Pipeline and job variables
    pub variables: BTreeMap<String, String>,
    /// Matrix values for the current job instance
    pub matrix: BTreeMap<String, String>,
}

impl InterpolationContext {
    /// Create a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_matrix(matrix: BTreeMap<String, String>) -> Self {
        Self {
            variables: BTreeMap::new(),
            matrix,
        }
    }

    /// Interpolate variables in a string.
    ///
    /// Supports:
    /// - `${{ variable }}` - direct variable lookup
    /// - `${{ env.VAR }}` - same lookup as `${{ VAR }}`; the process
    ///   environment is never consulted
    /// - `${{ matrix.key }}` - matrix value
    ///
    /// Unknown expressions resolve to the empty string.
    pub fn interpolate(&self, input: &str) -> String {
        if !input.contains("${{") {
            return input.to_string();
        }

        expression_pattern()
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self.variables.get(var_name).cloned().unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        self.variables.get(expr).cloned().unwrap_or_default()
    }
}

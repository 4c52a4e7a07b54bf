//! Assembles the workflow document(s) a `submit` invocation sends to the
//! coordinator (§6.4 `submit --file <path>|--smiles <string> --workflow
//! <name>|--workflow-file <path>`). Workflow documents are opaque to the
//! rest of this crate (§1) — this module only knows the handful of fields
//! `bespoke_shared::documents::WorkflowDocument` itself reads.

use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{CliError, CliResult};

/// The only built-in workflow template name this CLI ships (§6.4 doesn't
/// specify a registry of named templates, so `default` is the one name
/// recognized without `--workflow-file`).
const DEFAULT_TEMPLATE: &str = "default";

fn default_template() -> Value {
    Value::Object(Map::new())
}

fn load_template(workflow_name: Option<&str>, workflow_file: Option<&Path>) -> CliResult<Value> {
    if let Some(path) = workflow_file {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CliError::UserError(format!("cannot read workflow template {}: {e}", path.display())))?;
        return serde_json::from_str(&raw)
            .map_err(|e| CliError::UserError(format!("workflow template {} is not valid JSON: {e}", path.display())));
    }
    match workflow_name {
        None | Some(DEFAULT_TEMPLATE) => Ok(default_template()),
        Some(other) => Err(CliError::UserError(format!(
            "unknown workflow template '{other}' (only '{DEFAULT_TEMPLATE}' is bundled; pass --workflow-file for a custom one)"
        ))),
    }
}

/// Builds the list of workflow documents to submit. `--file` loads one
/// already-complete workflow document (or a JSON array of several) and
/// ignores the template flags. `--smiles` starts from the chosen template
/// and overlays the molecule.
pub(crate) fn build_workflows(
    file: Option<&Path>,
    smiles: Option<&str>,
    workflow_name: Option<&str>,
    workflow_file: Option<&Path>,
) -> CliResult<Vec<Value>> {
    if let Some(path) = file {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CliError::UserError(format!("cannot read workflow file {}: {e}", path.display())))?;
        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|e| CliError::UserError(format!("workflow file {} is not valid JSON: {e}", path.display())))?;
        return Ok(match parsed {
            Value::Array(items) => items,
            other => vec![other],
        });
    }

    let smiles = smiles.ok_or_else(|| CliError::UserError("one of --file or --smiles is required".into()))?;
    let mut template = load_template(workflow_name, workflow_file)?;
    let obj = template
        .as_object_mut()
        .ok_or_else(|| CliError::UserError("workflow template must be a JSON object".into()))?;
    obj.insert("smiles".to_string(), Value::String(smiles.to_string()));
    Ok(vec![template])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smiles_with_default_template() {
        let docs = build_workflows(None, Some("CC"), None, None).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["smiles"], Value::String("CC".to_string()));
    }

    #[test]
    fn unknown_template_name_is_a_user_error() {
        let err = build_workflows(None, Some("CC"), Some("exotic"), None).unwrap_err();
        assert!(matches!(err, CliError::UserError(_)));
    }

    #[test]
    fn neither_file_nor_smiles_is_a_user_error() {
        let err = build_workflows(None, None, None, None).unwrap_err();
        assert!(matches!(err, CliError::UserError(_)));
    }
}

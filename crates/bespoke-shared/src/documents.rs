//! Opaque typed documents (§9 "Dynamic typing in the source is replaced by
//! explicit typed documents"): newtypes around `serde_json::Value` so
//! validation attaches to a type rather than being scattered ad hoc. The
//! *contents* of these documents remain opaque to this crate (§1 "the
//! schemas describing a workflow and its results" are an external
//! collaborator) — only the handful of fields the executor itself reads
//! (§9 Design Notes) are inspected here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExecutorError, ExecutorResult};

/// The full fitting plan submitted by a client (§3 "Submission").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument(pub Value);

impl WorkflowDocument {
    /// Declared validation run at ingress (§4.1): must be a JSON object, and
    /// if present, `qc_failure_tolerance` must be a number in `[0.0, 1.0]`.
    /// Everything else passes through untouched.
    pub fn validate(&self) -> ExecutorResult<()> {
        let obj = self
            .0
            .as_object()
            .ok_or_else(|| ExecutorError::InvalidSchema("workflow document must be a JSON object".into()))?;

        if let Some(tolerance) = obj.get("qc_failure_tolerance") {
            let t = tolerance.as_f64().ok_or_else(|| {
                ExecutorError::InvalidSchema("qc_failure_tolerance must be a number".into())
            })?;
            if !(0.0..=1.0).contains(&t) {
                return Err(ExecutorError::InvalidSchema(
                    "qc_failure_tolerance must be in [0.0, 1.0]".into(),
                ));
            }
        }
        Ok(())
    }

    /// The QC stage's acceptance threshold (§4.2 step 4): absent means "any
    /// failure fails the stage" (§9's Open Question resolution — no
    /// tolerance is ever inferred when the workflow is silent).
    pub fn qc_failure_tolerance(&self) -> Option<f64> {
        self.0.get("qc_failure_tolerance").and_then(|v| v.as_f64())
    }

    /// The parent molecule a workflow fits a force field to (§4.2 step 2
    /// "parent-molecule"). Read as `smiles` when present, falling back to a
    /// `parent_molecule` field for workflows that pass a richer structure
    /// than a SMILES string; `Value::Null` when neither is set, which still
    /// hashes deterministically.
    pub fn parent_molecule(&self) -> Value {
        self.field("smiles").or_else(|| self.field("parent_molecule")).unwrap_or(Value::Null)
    }

    /// The fragmentation engine's configuration (§4.2 step 2 "fragmenter-spec").
    pub fn fragmenter_spec(&self) -> Value {
        self.field("fragmenter").unwrap_or(Value::Null)
    }

    /// One entry per required QC computation (§4.2 step 2 "for each output
    /// of Fragmentation, one task per required QC computation"): each entry
    /// is expected to carry `method`, `basis`, `program`, `calculation_kind`,
    /// and an opaque `keywords` object, but this crate only forwards them —
    /// it never validates their contents (§1, §9).
    pub fn qc_specs(&self) -> Vec<Value> {
        self.field("qc_specs")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    /// The optimizer's starting point (§4.2 step 2 "initial-ff").
    pub fn initial_ff(&self) -> Value {
        self.field("initial_ff").unwrap_or(Value::Null)
    }

    /// The optimizer's hyperparameters (§4.2 step 2 "hyperparameters").
    pub fn hyperparameters(&self) -> Value {
        self.field("hyperparameters").unwrap_or(Value::Null)
    }

    /// The fitting targets folded into the optimization fingerprint and
    /// input alongside the QC results (§4.2 step 2 "sorted(targets +
    /// qc-results)").
    pub fn targets(&self) -> Vec<Value> {
        self.field("targets").and_then(|v| v.as_array().cloned()).unwrap_or_default()
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.0.get(name).cloned()
    }
}

/// The input document handed to a stage executor (§4.4 `StageExecutor`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput(pub Value);

/// The output document a stage executor returns on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput(pub Value);

/// Reads the one field the orchestrator needs out of an otherwise opaque
/// Fragmentation stage output: the list of fragments each QC task is
/// generated from (§4.2 step 2). By convention a fragmenter executor
/// returns `{"fragments": [{"canonical": "...", ...}, ...]}`; a missing or
/// malformed `fragments` array is treated as zero fragments rather than an
/// error, since the stage already succeeded by the time this is read.
pub fn fragments_of(output: &Value) -> Vec<Value> {
    output.get("fragments").and_then(|v| v.as_array().cloned()).unwrap_or_default()
}

/// The canonical identifier of one fragment, read out of a Fragmentation
/// output entry (§4.2 step 2 "fragment-canonical").
pub fn fragment_canonical(fragment: &Value) -> Value {
    fragment.get("canonical").cloned().unwrap_or_else(|| fragment.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_object_workflow() {
        let doc = WorkflowDocument(json!([1, 2, 3]));
        assert!(doc.validate().is_err());
    }

    #[test]
    fn accepts_missing_tolerance() {
        let doc = WorkflowDocument(json!({"smiles": "CC"}));
        assert!(doc.validate().is_ok());
        assert_eq!(doc.qc_failure_tolerance(), None);
    }

    #[test]
    fn rejects_out_of_range_tolerance() {
        let doc = WorkflowDocument(json!({"qc_failure_tolerance": 1.5}));
        assert!(doc.validate().is_err());
    }

    #[test]
    fn accepts_valid_tolerance() {
        let doc = WorkflowDocument(json!({"qc_failure_tolerance": 0.5}));
        assert!(doc.validate().is_ok());
        assert_eq!(doc.qc_failure_tolerance(), Some(0.5));
    }

    #[test]
    fn parent_molecule_prefers_smiles() {
        let doc = WorkflowDocument(json!({"smiles": "CC", "parent_molecule": {"x": 1}}));
        assert_eq!(doc.parent_molecule(), json!("CC"));
    }

    #[test]
    fn parent_molecule_falls_back_when_smiles_absent() {
        let doc = WorkflowDocument(json!({"parent_molecule": {"x": 1}}));
        assert_eq!(doc.parent_molecule(), json!({"x": 1}));
    }

    #[test]
    fn qc_specs_defaults_to_empty() {
        let doc = WorkflowDocument(json!({"smiles": "CC"}));
        assert!(doc.qc_specs().is_empty());
    }

    #[test]
    fn qc_specs_round_trip() {
        let doc = WorkflowDocument(json!({"qc_specs": [{"method": "b3lyp"}]}));
        assert_eq!(doc.qc_specs(), vec![json!({"method": "b3lyp"})]);
    }

    #[test]
    fn fragments_of_reads_conventional_shape() {
        let output = json!({"fragments": [{"canonical": "CC"}, {"canonical": "CO"}]});
        let fragments = fragments_of(&output);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragment_canonical(&fragments[0]), json!("CC"));
    }

    #[test]
    fn fragments_of_missing_key_is_empty() {
        assert!(fragments_of(&json!({})).is_empty());
    }
}

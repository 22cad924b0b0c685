//! Handoff contracts between phases
//!
//! A phase declares the fields it needs (`input_contract`) and the fields it
//! promises (`output_contract`). Validation is pure and fails closed: the
//! executor never runs a handler whose input does not validate.

use crate::phase::{Payload, Phase};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field carrying the correlation id inside a payload.
pub const CORRELATION_FIELD: &str = "correlation_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    /// Required fields absent or null, in contract order.
    pub missing_fields: Vec<String>,
    /// The payload carries another operation's correlation id.
    pub mismatched_correlation: bool,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            missing_fields: Vec::new(),
            mismatched_correlation: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HandoffContractValidator;

impl HandoffContractValidator {
    pub fn new() -> Self {
        Self
    }

    /// Check `upstream_output` against the phase's input contract.
    pub fn validate(
        &self,
        phase: &Phase,
        upstream_output: &Payload,
        correlation_id: &str,
    ) -> ValidationResult {
        let missing_fields = missing(&phase.input_contract, upstream_output);
        let mismatched_correlation = match upstream_output.get(CORRELATION_FIELD) {
            None | Some(Value::Null) => false,
            Some(Value::String(id)) => id != correlation_id,
            Some(_) => true,
        };

        ValidationResult {
            valid: missing_fields.is_empty() && !mismatched_correlation,
            missing_fields,
            mismatched_correlation,
        }
    }

    /// Fields of the output contract the phase did not produce.
    pub fn validate_output(&self, phase: &Phase, output: &Payload) -> Vec<String> {
        missing(&phase.output_contract, output)
    }
}

fn missing(contract: &[String], payload: &Payload) -> Vec<String> {
    contract
        .iter()
        .filter(|field| matches!(payload.get(field.as_str()), None | Some(Value::Null)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseOutput;
    use serde_json::json;

    fn phase(requires: &[&str]) -> Phase {
        Phase::from_fn("store", |_ctx, _input| async { Ok(PhaseOutput::ok(Payload::new())) })
            .requires(requires.iter().copied())
            .produces(["stored_id"])
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_all_present() {
        let validator = HandoffContractValidator::new();
        let result = validator.validate(
            &phase(&["rows", "schema"]),
            &payload(json!({ "rows": 10, "schema": "v2", "extra": true })),
            "corr_a",
        );
        assert_eq!(result, ValidationResult::ok());
    }

    #[test]
    fn test_lists_exactly_missing() {
        let validator = HandoffContractValidator::new();
        let result = validator.validate(
            &phase(&["rows", "schema", "checksum"]),
            &payload(json!({ "rows": 10, "checksum": null })),
            "corr_a",
        );
        assert!(!result.valid);
        assert_eq!(result.missing_fields, vec!["schema".to_string(), "checksum".to_string()]);
        assert!(!result.mismatched_correlation);
    }

    #[test]
    fn test_correlation_mismatch() {
        let validator = HandoffContractValidator::new();
        let p = phase(&["rows"]);

        let foreign = payload(json!({ "rows": 1, "correlation_id": "corr_other" }));
        let result = validator.validate(&p, &foreign, "corr_a");
        assert!(!result.valid);
        assert!(result.mismatched_correlation);
        assert!(result.missing_fields.is_empty());

        let own = payload(json!({ "rows": 1, "correlation_id": "corr_a" }));
        assert!(validator.validate(&p, &own, "corr_a").valid);

        let malformed = payload(json!({ "rows": 1, "correlation_id": 42 }));
        assert!(validator.validate(&p, &malformed, "corr_a").mismatched_correlation);
    }

    #[test]
    fn test_output_contract() {
        let validator = HandoffContractValidator::new();
        let p = phase(&[]);
        assert_eq!(validator.validate_output(&p, &Payload::new()), vec!["stored_id".to_string()]);
        assert!(validator
            .validate_output(&p, &payload(json!({ "stored_id": "doc-1" })))
            .is_empty());
    }
}

//! Claim code extraction and allow-list checks.

use std::collections::BTreeSet;

use serde_json::Value as JsonValue;

use crate::reference_cache::CodeSet;

/// Outcome of checking a claim's codes against the cached allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeValidation {
    Valid,
    /// Codes present in the claim but absent from the allow-list (sorted).
    UnknownCodes(Vec<String>),
    /// No allow-list was cached for the key (absent or expired).
    AllowListMissing,
}

impl CodeValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, CodeValidation::Valid)
    }

    pub fn describe(&self) -> String {
        match self {
            CodeValidation::Valid => "valid".to_string(),
            CodeValidation::UnknownCodes(codes) => format!("unknown codes: {}", codes.join(", ")),
            CodeValidation::AllowListMissing => "no cached allow-list".to_string(),
        }
    }
}

fn is_code_field(key: &str) -> bool {
    key == "code" || key.ends_with("_code") || key.ends_with("Code")
}

/// Codes carried by a claim payload.
///
/// A code is the string value (or each string of an array value) of any
/// field named `code` or ending in `_code` / `Code`, at any depth. The `ians`
/// list is never a code source.
pub fn extract_codes(claim: &JsonValue) -> BTreeSet<String> {
    let mut codes = BTreeSet::new();
    collect(claim, &mut codes);
    codes
}

fn collect(value: &JsonValue, codes: &mut BTreeSet<String>) {
    match value {
        JsonValue::Object(map) => {
            for (key, value) in map {
                if key == "ians" {
                    continue;
                }
                if is_code_field(key) {
                    match value {
                        JsonValue::String(s) => {
                            codes.insert(s.clone());
                        }
                        JsonValue::Array(items) if items.iter().all(JsonValue::is_string) => {
                            codes.extend(items.iter().filter_map(JsonValue::as_str).map(str::to_string));
                        }
                        other => collect(other, codes),
                    }
                } else {
                    collect(value, codes);
                }
            }
        }
        JsonValue::Array(items) => items.iter().for_each(|item| collect(item, codes)),
        _ => {}
    }
}

pub fn validate_claim(claim: &JsonValue, allow_list: Option<&CodeSet>) -> CodeValidation {
    let Some(allow_list) = allow_list else {
        return CodeValidation::AllowListMissing;
    };

    let unknown: Vec<String> = extract_codes(claim)
        .into_iter()
        .filter(|code| !allow_list.contains(code))
        .collect();

    if unknown.is_empty() {
        CodeValidation::Valid
    } else {
        CodeValidation::UnknownCodes(unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_nested_code_fields_but_not_ians() {
        let claim = json!({
            "ians": ["A1"],
            "test_code": "TM-1",
            "sample": {"typeCode": "ST-2", "label": "x"},
            "panels": [{"code": "P-1"}, {"code": "P-2"}],
            "qa_lab_code": ["LAB-1", "LAB-2"],
            "count": 3
        });
        let codes: Vec<String> = extract_codes(&claim).into_iter().collect();
        assert_eq!(codes, vec!["LAB-1", "LAB-2", "P-1", "P-2", "ST-2", "TM-1"]);
    }

    #[test]
    fn validation_reports_unknown_codes() {
        let allow: CodeSet = ["TM-1".to_string()].into_iter().collect();
        let claim = json!({"test_code": "TM-1", "sample_code": "ST-9"});

        assert_eq!(
            validate_claim(&claim, Some(&allow)),
            CodeValidation::UnknownCodes(vec!["ST-9".to_string()])
        );
        assert!(validate_claim(&json!({"test_code": "TM-1"}), Some(&allow)).is_valid());
        assert_eq!(validate_claim(&claim, None), CodeValidation::AllowListMissing);
    }

    #[test]
    fn claim_without_codes_is_valid() {
        let allow = CodeSet::new();
        assert!(validate_claim(&json!({"ians": ["A1"], "note": "n"}), Some(&allow)).is_valid());
    }
}

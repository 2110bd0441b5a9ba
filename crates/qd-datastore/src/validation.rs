//! Name rules for datasets, sample identities and parameters.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

pub const DATASET_NAME_MIN: usize = 2;
pub const DATASET_NAME_MAX: usize = 100;
pub const IDENTIFIER_MAX: usize = 30;

lazy_static! {
    static ref DATASET_NAME_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_\-.,:()\[\]*+&/ =@<>'%?|]*$").expect("dataset name pattern");
    static ref IDENTIFIER_RE: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9_\-.,:()\[\]* ]*$").expect("identifier pattern");
    static ref TABLE_NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_]+$").expect("table name pattern");
}

pub fn validate_dataset_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if !(DATASET_NAME_MIN..=DATASET_NAME_MAX).contains(&len) {
        return Err(Error::InvalidName(format!(
            "dataset name '{}' must be {} to {} characters long (got {})",
            name, DATASET_NAME_MIN, DATASET_NAME_MAX, len
        )));
    }
    if name.contains('{') || name.contains('}') {
        return Err(Error::InvalidName(format!(
            "dataset name '{}' may not contain braces",
            name
        )));
    }
    if !DATASET_NAME_RE.is_match(name) {
        return Err(Error::InvalidName(format!(
            "dataset name '{}' contains unsupported characters",
            name
        )));
    }
    Ok(())
}

/// Validates a project, setup or sample name. `kind` is used in the message.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    let len = value.chars().count();
    if len == 0 || len > IDENTIFIER_MAX {
        return Err(Error::InvalidName(format!(
            "{} '{}' must be 1 to {} characters long",
            kind, value, IDENTIFIER_MAX
        )));
    }
    if !IDENTIFIER_RE.is_match(value) {
        return Err(Error::InvalidName(format!(
            "{} '{}' must start with a letter and use only letters, digits and _-.,:()[]* or space",
            kind, value
        )));
    }
    Ok(())
}

pub fn validate_parameter_name(name: &str) -> Result<()> {
    validate_identifier("parameter name", name)
}

/// Legacy per-dataset parameter tables are addressed by name in SQL text.
pub(crate) fn validate_table_name(name: &str) -> Result<()> {
    if TABLE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidData(format!("refusing unsafe table name '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ===== Dataset names =====

    #[test]
    fn test_dataset_name_length_bounds() {
        assert!(validate_dataset_name("a").is_err());
        assert!(validate_dataset_name("ab").is_ok());
        assert!(validate_dataset_name(&"x".repeat(100)).is_ok());
        assert!(validate_dataset_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_dataset_name_rejects_brace() {
        let err = validate_dataset_name("ramsey {scan}").unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)));
    }

    #[test]
    fn test_dataset_name_accepts_punctuation() {
        assert!(validate_dataset_name("vP1 sweep (B=0.5T) | run #2").is_err());
        assert!(validate_dataset_name("vP1 sweep (B=0.5T) | run 2").is_ok());
        assert!(validate_dataset_name("Rabi 50% @ 12.3GHz").is_ok());
    }

    // ===== Identifiers =====

    #[test]
    fn test_identifier_rules() {
        assert!(validate_identifier("sample", "SQ21_1").is_ok());
        assert!(validate_identifier("sample", "1abc").is_err());
        assert!(validate_identifier("sample", "").is_err());
        assert!(validate_identifier("sample", &"a".repeat(31)).is_err());
        assert!(validate_identifier("project", "six{dot}").is_err());
    }

    #[test]
    fn test_table_name_rules() {
        assert!(validate_table_name("ramsey_1612345_abc").is_ok());
        assert!(validate_table_name("x; DROP TABLE y").is_err());
    }

    proptest! {
        #[test]
        fn test_names_with_braces_never_validate(prefix in "[a-z]{1,40}", suffix in "[a-z]{0,40}") {
            let name = format!("{}{{{}", prefix, suffix);
            prop_assert!(validate_dataset_name(&name).is_err());
        }

        #[test]
        fn test_alphanumeric_names_in_range_validate(name in "[A-Za-z0-9_]{2,100}") {
            prop_assert!(validate_dataset_name(&name).is_ok());
        }
    }
}

//! Error Classifier
//!
//! Classifies validation and engine errors into a taxonomy used to phrase
//! corrective hints for the next attempt.

use crate::execution::{ExecutionError, ExecutionErrorKind};
use crate::validator::{RejectionReason, ValidationError};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref MISSING_COLUMN: Regex = Regex::new(
        r#"(?i)(?:no such column:\s*([\w."]+)|column\s+"?([\w.]+)"?\s+does not exist)"#
    )
    .unwrap();
    static ref MISSING_TABLE: Regex = Regex::new(
        r#"(?i)(?:no such table:\s*([\w."]+)|relation\s+"?([\w.]+)"?\s+does not exist)"#
    )
    .unwrap();
}

/// SQL error classification taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlErrorClass {
    UnknownColumn,
    UnknownTable,
    SyntaxError,
    TypeMismatch,
    AmbiguousColumn,
    InvalidAggregation,
    UnknownFunction,
    Forbidden,
    MultipleStatements,
    DuplicateColumn,
    Timeout,
    Other,
}

impl fmt::Display for SqlErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlErrorClass::UnknownColumn => write!(f, "UnknownColumn"),
            SqlErrorClass::UnknownTable => write!(f, "UnknownTable"),
            SqlErrorClass::SyntaxError => write!(f, "SyntaxError"),
            SqlErrorClass::TypeMismatch => write!(f, "TypeMismatch"),
            SqlErrorClass::AmbiguousColumn => write!(f, "AmbiguousColumn"),
            SqlErrorClass::InvalidAggregation => write!(f, "InvalidAggregation"),
            SqlErrorClass::UnknownFunction => write!(f, "UnknownFunction"),
            SqlErrorClass::Forbidden => write!(f, "Forbidden"),
            SqlErrorClass::MultipleStatements => write!(f, "MultipleStatements"),
            SqlErrorClass::DuplicateColumn => write!(f, "DuplicateColumn"),
            SqlErrorClass::Timeout => write!(f, "Timeout"),
            SqlErrorClass::Other => write!(f, "Other"),
        }
    }
}

/// Error classifier
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a validator rejection; the first reason decides.
    pub fn classify_rejection(&self, error: &ValidationError) -> SqlErrorClass {
        match error.reasons.first() {
            Some(RejectionReason::MultipleStatements) => SqlErrorClass::MultipleStatements,
            Some(RejectionReason::Unparseable(_)) | Some(RejectionReason::Empty) => SqlErrorClass::SyntaxError,
            Some(RejectionReason::UnlistedFunction(_)) => SqlErrorClass::UnknownFunction,
            Some(_) => SqlErrorClass::Forbidden,
            None => SqlErrorClass::Other,
        }
    }

    pub fn classify_execution(&self, error: &ExecutionError) -> SqlErrorClass {
        match error.kind {
            ExecutionErrorKind::Timeout => SqlErrorClass::Timeout,
            ExecutionErrorKind::ResultShape if error.message.contains("duplicate") => {
                SqlErrorClass::DuplicateColumn
            }
            _ => self.classify_message(&error.message),
        }
    }

    /// Pattern matching on engine error messages
    pub fn classify_message(&self, message: &str) -> SqlErrorClass {
        let error_msg = message.to_lowercase();

        if error_msg.contains("ambiguous") && error_msg.contains("column") {
            return SqlErrorClass::AmbiguousColumn;
        }

        if MISSING_COLUMN.is_match(message) {
            return SqlErrorClass::UnknownColumn;
        }

        if MISSING_TABLE.is_match(message) {
            return SqlErrorClass::UnknownTable;
        }

        if error_msg.contains("no such function") || (error_msg.contains("function") && error_msg.contains("does not exist")) {
            return SqlErrorClass::UnknownFunction;
        }

        if error_msg.contains("aggregate") || error_msg.contains("group by") {
            return SqlErrorClass::InvalidAggregation;
        }

        if error_msg.contains("syntax error") || error_msg.contains("incomplete input") {
            return SqlErrorClass::SyntaxError;
        }

        if error_msg.contains("datatype mismatch")
            || error_msg.contains("invalid input syntax")
            || error_msg.contains("operator does not exist")
            || error_msg.contains("cannot cast")
        {
            return SqlErrorClass::TypeMismatch;
        }

        SqlErrorClass::Other
    }

    /// Identifier named by an unknown-column error, if any.
    pub fn missing_column(&self, message: &str) -> Option<String> {
        extract_name(&MISSING_COLUMN, message)
    }

    pub fn missing_table(&self, message: &str) -> Option<String> {
        extract_name(&MISSING_TABLE, message)
    }
}

fn extract_name(pattern: &Regex, message: &str) -> Option<String> {
    let caps = pattern.captures(message)?;
    let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
    // keep the column part of qualified names
    let name = raw.trim_matches('"').rsplit('.').next().unwrap_or(raw);
    Some(name.trim_matches('"').to_string())
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_unknown_column_both_dialects() {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify_message("no such column: usage"), SqlErrorClass::UnknownColumn);
        assert_eq!(
            classifier.classify_message(r#"column "b.usage" does not exist"#),
            SqlErrorClass::UnknownColumn
        );
        assert_eq!(classifier.missing_column("no such column: b.usage").as_deref(), Some("usage"));
        assert_eq!(
            classifier.missing_column(r#"column "heigth" does not exist"#).as_deref(),
            Some("heigth")
        );
    }

    #[test]
    fn test_classify_table_and_syntax() {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify_message("no such table: building"), SqlErrorClass::UnknownTable);
        assert_eq!(
            classifier.classify_message(r#"near "FORM": syntax error"#),
            SqlErrorClass::SyntaxError
        );
        assert_eq!(
            classifier.classify_message("misuse of aggregate: COUNT()"),
            SqlErrorClass::InvalidAggregation
        );
    }

    #[test]
    fn test_classify_rejections_and_timeouts() {
        let classifier = ErrorClassifier::new();
        let rejection = ValidationError {
            reasons: vec![RejectionReason::MultipleStatements, RejectionReason::ForbiddenKeyword("DROP".into())],
        };
        assert_eq!(classifier.classify_rejection(&rejection), SqlErrorClass::MultipleStatements);

        let timeout = ExecutionError::timeout(std::time::Duration::from_secs(1));
        assert_eq!(classifier.classify_execution(&timeout), SqlErrorClass::Timeout);

        let dup = ExecutionError::result_shape("duplicate output column name count");
        assert_eq!(classifier.classify_execution(&dup), SqlErrorClass::DuplicateColumn);
    }
}

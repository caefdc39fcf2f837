//! Extraction of integer fields from device output lines.

use crate::config::ParserConfig;
use crate::record::Record;
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

/// Template printed by the firmware in single-value mode.
pub const SINGLE_VALUE_PATTERN: &str = r"Numero aleatorio: ([^,\s]+)";

/// Template printed by the firmware in three-value mode.
pub const TRIPLE_VALUE_PATTERN: &str = r"Numeros aleatorios: ([^,\s]+), ([^,\s]+), ([^,\s]+)";

/// Errors building a parser from configuration.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("Invalid line pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Pattern has {groups} capture groups but arity is {arity}")]
    ArityMismatch { groups: usize, arity: usize },

    #[error("No built-in pattern for arity {0}; set parser.line_pattern")]
    MissingPattern(usize),
}

/// Result of parsing one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Record(Record),
    /// The template is not present; ordinary noise on the wire.
    Unmatched,
    /// The template is present but a field is not an integer.
    Malformed { line: String, field: String },
}

/// Matches lines against one template with a fixed number of fields.
#[derive(Debug, Clone)]
pub struct RecordParser {
    pattern: Regex,
    arity: usize,
}

impl RecordParser {
    pub fn new(pattern: &str, arity: usize) -> Result<Self, ParserError> {
        let pattern = Regex::new(pattern)?;
        // captures_len counts the implicit whole-match group
        let groups = pattern.captures_len() - 1;
        if groups != arity {
            return Err(ParserError::ArityMismatch { groups, arity });
        }
        Ok(Self { pattern, arity })
    }

    pub fn from_config(config: &ParserConfig) -> Result<Self, ParserError> {
        let pattern = match (&config.line_pattern, config.expected_arity) {
            (Some(pattern), _) => pattern.as_str(),
            (None, 1) => SINGLE_VALUE_PATTERN,
            (None, 3) => TRIPLE_VALUE_PATTERN,
            (None, arity) => return Err(ParserError::MissingPattern(arity)),
        };
        Self::new(pattern, config.expected_arity)
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Parse a line. The record is stamped once extraction has finished,
    /// not when the line arrived.
    pub fn parse(&self, line: &str) -> ParseOutcome {
        let extracted = self.extract(line);
        Self::finish(line, extracted, Utc::now())
    }

    /// Parse a line with an explicit capture time.
    pub fn parse_at(&self, line: &str, captured_at: DateTime<Utc>) -> ParseOutcome {
        Self::finish(line, self.extract(line), captured_at)
    }

    fn finish(line: &str, extracted: Extracted, captured_at: DateTime<Utc>) -> ParseOutcome {
        match extracted {
            Extracted::Fields(fields) => ParseOutcome::Record(Record::new(fields, captured_at)),
            Extracted::Unmatched => ParseOutcome::Unmatched,
            Extracted::Malformed(field) => ParseOutcome::Malformed {
                line: line.to_string(),
                field,
            },
        }
    }

    fn extract(&self, line: &str) -> Extracted {
        let Some(captures) = self.pattern.captures(line) else {
            return Extracted::Unmatched;
        };

        let mut fields = Vec::with_capacity(self.arity);
        for group in captures.iter().skip(1) {
            // Optional groups that did not participate count as malformed
            let Some(text) = group.map(|m| m.as_str()) else {
                return Extracted::Malformed(String::new());
            };
            // Fields are non-negative decimal integers; signs are rejected
            let digits = text.trim();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Extracted::Malformed(text.to_string());
            }
            match digits.parse::<i64>() {
                Ok(value) => fields.push(value),
                Err(_) => return Extracted::Malformed(text.to_string()),
            }
        }
        Extracted::Fields(fields)
    }
}

enum Extracted {
    Fields(Vec<i64>),
    Unmatched,
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn single() -> RecordParser {
        RecordParser::new(SINGLE_VALUE_PATTERN, 1).unwrap()
    }

    fn triple() -> RecordParser {
        RecordParser::new(TRIPLE_VALUE_PATTERN, 3).unwrap()
    }

    fn fields(outcome: ParseOutcome) -> Vec<i64> {
        match outcome {
            ParseOutcome::Record(record) => record.fields().to_vec(),
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[test]
    fn test_single_value_line() {
        assert_eq!(fields(single().parse("Numero aleatorio: 42")), vec![42]);
    }

    #[test]
    fn test_triple_value_line() {
        assert_eq!(
            fields(triple().parse("Numeros aleatorios: 1, 2, 3")),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_template_embedded_in_noise() {
        assert_eq!(
            fields(triple().parse("[boot 12] Numeros aleatorios: 10, 20, 30 ok")),
            vec![10, 20, 30]
        );
    }

    #[test]
    fn test_garbage_is_unmatched() {
        assert_eq!(single().parse("garbage"), ParseOutcome::Unmatched);
        assert_eq!(triple().parse("garbage"), ParseOutcome::Unmatched);
        assert_eq!(triple().parse(""), ParseOutcome::Unmatched);
    }

    #[test]
    fn test_single_template_does_not_match_triple_line() {
        assert_eq!(
            single().parse("Numeros aleatorios: 1, 2, 3"),
            ParseOutcome::Unmatched
        );
    }

    #[test]
    fn test_non_numeric_field_is_malformed() {
        match single().parse("Numero aleatorio: abc") {
            ParseOutcome::Malformed { line, field } => {
                assert_eq!(line, "Numero aleatorio: abc");
                assert_eq!(field, "abc");
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_and_signed_fields_are_malformed() {
        for (line, expected) in [("Numero aleatorio: -5", "-5"), ("Numero aleatorio: +7", "+7")] {
            match single().parse(line) {
                ParseOutcome::Malformed { field, .. } => assert_eq!(field, expected),
                other => panic!("expected malformed for {:?}, got {:?}", line, other),
            }
        }

        assert!(matches!(
            triple().parse("Numeros aleatorios: -1, 2, 3"),
            ParseOutcome::Malformed { field, .. } if field == "-1"
        ));
        assert!(matches!(
            triple().parse("Numeros aleatorios: 1, 2, 3.5"),
            ParseOutcome::Malformed { field, .. } if field == "3.5"
        ));
    }

    #[test]
    fn test_leading_zeros_are_accepted() {
        assert_eq!(fields(single().parse("Numero aleatorio: 007")), vec![7]);
    }

    #[test]
    fn test_out_of_range_field_is_malformed() {
        let outcome = single().parse("Numero aleatorio: 99999999999999999999999");
        assert!(matches!(outcome, ParseOutcome::Malformed { .. }));
    }

    #[test]
    fn test_parse_at_uses_given_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        match single().parse_at("Numero aleatorio: 5", ts) {
            ParseOutcome::Record(record) => assert_eq!(record.captured_at(), ts),
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[test]
    fn test_arity_mismatch_is_rejected() {
        let err = RecordParser::new(SINGLE_VALUE_PATTERN, 3).unwrap_err();
        assert!(matches!(err, ParserError::ArityMismatch { groups: 1, arity: 3 }));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        assert!(matches!(
            RecordParser::new("(unclosed", 1),
            Err(ParserError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_from_config_builtin_and_custom() {
        let config = ParserConfig {
            expected_arity: 1,
            line_pattern: None,
        };
        assert_eq!(RecordParser::from_config(&config).unwrap().arity(), 1);

        let config = ParserConfig {
            expected_arity: 2,
            line_pattern: None,
        };
        assert!(matches!(
            RecordParser::from_config(&config),
            Err(ParserError::MissingPattern(2))
        ));

        let config = ParserConfig {
            expected_arity: 2,
            line_pattern: Some(r"temp=(\S+) hum=(\S+)".to_string()),
        };
        let parser = RecordParser::from_config(&config).unwrap();
        assert_eq!(fields(parser.parse("temp=21 hum=40")), vec![21, 40]);
    }
}

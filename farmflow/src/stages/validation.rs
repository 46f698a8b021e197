//! Input validation and normalization.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use super::{Stage, StageFlow};
use crate::context::{ProcessingContext, StageKind, ValidationResult};
use crate::core::FarmerRecord;
use crate::errors::{ErrorCode, StageError};

static PHONE_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[6-9]\d{9}$"));

static EMAIL_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$"));

/// Accepted gender values, lower-case.
pub const GENDERS: [&str; 3] = ["male", "female", "other"];

const DATE_FORMAT: &str = "%Y-%m-%d";

fn pattern(compiled: &'static Result<Regex, regex::Error>) -> Result<&'static Regex, StageError> {
    compiled.as_ref().map_err(|e| {
        StageError::new(ErrorCode::Internal, format!("invalid built-in pattern: {e}"), false)
    })
}

/// Strips separators and a leading country or trunk prefix from a phone number.
#[must_use]
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    if let Some(rest) = digits.strip_prefix("+91") {
        return rest.to_string();
    }
    if digits.len() == 12 && digits.starts_with("91") {
        return digits[2..].to_string();
    }
    if digits.len() == 11 && digits.starts_with('0') {
        return digits[1..].to_string();
    }
    digits
}

/// Checks required fields and formats; every violation is non-retryable.
///
/// On success the record is passed on normalized: names and email trimmed,
/// phone reduced to ten digits, gender lower-cased.
#[derive(Debug, Clone, Default)]
pub struct ValidationStage {
    timeout: Duration,
}

impl ValidationStage {
    /// Creates a new validation stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates and normalizes one record.
    pub fn validate(&self, record: FarmerRecord) -> Result<(FarmerRecord, ValidationResult), StageError> {
        let phone_pattern = pattern(&PHONE_PATTERN)?;
        let email_pattern = pattern(&EMAIL_PATTERN)?;

        let mut record = record;
        let mut violations = Vec::new();

        record.first_name = record.first_name.trim().to_string();
        record.last_name = record.last_name.trim().to_string();
        if record.first_name.is_empty() {
            violations.push("first name is required".to_string());
        }
        if record.last_name.is_empty() {
            violations.push("last name is required".to_string());
        }

        let phone = normalize_phone(&record.phone_number);
        if record.phone_number.trim().is_empty() {
            violations.push("phone number is required".to_string());
        } else if !phone_pattern.is_match(&phone) {
            violations.push(format!(
                "invalid phone number format '{}': expected 10 digits starting with 6-9",
                record.phone_number.trim()
            ));
        }
        record.phone_number = phone;

        record.email = record
            .email
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty());
        if let Some(email) = &record.email {
            if !email_pattern.is_match(email) {
                violations.push(format!("invalid email address '{email}'"));
            }
        }

        record.gender = record
            .gender
            .map(|gender| gender.trim().to_lowercase())
            .filter(|gender| !gender.is_empty());
        if let Some(gender) = &record.gender {
            if !GENDERS.contains(&gender.as_str()) {
                violations.push(format!(
                    "invalid gender '{gender}': expected one of {}",
                    GENDERS.join(", ")
                ));
            }
        }

        record.date_of_birth = record
            .date_of_birth
            .map(|dob| dob.trim().to_string())
            .filter(|dob| !dob.is_empty());
        if let Some(dob) = &record.date_of_birth {
            match NaiveDate::parse_from_str(dob, DATE_FORMAT) {
                Ok(date) if date > Utc::now().date_naive() => {
                    violations.push(format!("date of birth '{dob}' is in the future"));
                }
                Ok(_) => {}
                Err(_) => violations.push(format!("invalid date of birth '{dob}': expected YYYY-MM-DD")),
            }
        }

        if !violations.is_empty() {
            return Err(StageError::validation(violations.join("; ")));
        }

        let result = ValidationResult {
            normalized_phone: record.phone_number.clone(),
            normalized_gender: record.gender.clone(),
        };
        Ok((record, result))
    }
}

#[async_trait]
impl Stage for ValidationStage {
    fn name(&self) -> &str {
        StageKind::Validation.as_str()
    }

    fn can_retry(&self) -> bool {
        false
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn process(
        &self,
        ctx: &mut ProcessingContext,
        record: FarmerRecord,
    ) -> Result<StageFlow, StageError> {
        let (record, result) = self.validate(record)?;
        ctx.set_validation(result);
        Ok(StageFlow::Continue(record))
    }
}

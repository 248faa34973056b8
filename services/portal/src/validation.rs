//! Input validation utilities

use regex::Regex;
use std::sync::OnceLock;

/// Longest operator note accepted
pub const MAX_NOTE_LEN: usize = 1000;

/// Validate an identifier that becomes an MQTT topic segment
pub fn validate_identifier(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} is required", field));
    }

    static IDENTIFIER_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = IDENTIFIER_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_.:-]{1,64}$").expect("Failed to compile identifier regex")
    });

    if !regex.is_match(value) {
        return Err(format!(
            "{} must be 1-64 characters of letters, digits, '_', '.', ':' or '-'",
            field
        ));
    }

    Ok(())
}

/// Validate a hold amount in cents
pub fn validate_amount(amount_cents: i64) -> Result<(), String> {
    if amount_cents <= 0 {
        return Err(format!("amount_cents must be positive, got {}", amount_cents));
    }
    Ok(())
}

/// Validate a final amount reported by the charger
pub fn validate_final_amount(amount_cents: i64) -> Result<(), String> {
    if amount_cents < 0 {
        return Err(format!("final amount must not be negative, got {}", amount_cents));
    }
    Ok(())
}

/// Validate an operator note
pub fn validate_note(note: &str) -> Result<(), String> {
    if note.chars().count() > MAX_NOTE_LEN {
        return Err(format!("Note must be at most {} characters long", MAX_NOTE_LEN));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("charger_id", "c1").is_ok());
        assert!(validate_identifier("charger_id", "garage-left.2:a_b").is_ok());
        assert!(validate_identifier("charger_id", &"x".repeat(64)).is_ok());

        assert!(validate_identifier("charger_id", "").is_err());
        assert!(validate_identifier("charger_id", &"x".repeat(65)).is_err());
        // Topic wildcards and separators would escape the namespace
        assert!(validate_identifier("charger_id", "c/1").is_err());
        assert!(validate_identifier("charger_id", "+").is_err());
        assert!(validate_identifier("charger_id", "#").is_err());
        assert!(validate_identifier("charger_id", "c 1").is_err());
    }

    #[test]
    fn test_validate_amounts() {
        assert!(validate_amount(1).is_ok());
        assert!(validate_amount(0).is_err());
        assert!(validate_amount(-5).is_err());

        assert!(validate_final_amount(0).is_ok());
        assert!(validate_final_amount(-1).is_err());
    }

    #[test]
    fn test_validate_note() {
        assert!(validate_note("").is_ok());
        assert!(validate_note(&"n".repeat(MAX_NOTE_LEN)).is_ok());
        assert!(validate_note(&"n".repeat(MAX_NOTE_LEN + 1)).is_err());
    }
}

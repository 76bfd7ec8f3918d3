use crate::validation::ValidationError;

const MAX_VAL_BYTES: usize = 128;
const FORBIDDEN_PUNCTUATION: &[char] = &[
    '.', ',', ':', ';', '#', '_', '\'', '>', '`', '<', '!', '\\', '|', '^',
];

/// Label values are short ASCII tags such as `spam` or `dmca-violation`. A
/// single leading `!` marks a system-level value (`!hide`, `!warn`); the rest
/// of the value follows the ordinary rules.
pub fn validate_val(val: &str) -> Result<(), ValidationError> {
    if val.is_empty() {
        return Err(ValidationError::new("label value cannot be empty"));
    }
    if val.len() > MAX_VAL_BYTES {
        return Err(ValidationError::new(format!(
            "label value is too long ({} bytes, {MAX_VAL_BYTES} max)",
            val.len()
        )));
    }
    if val.chars().any(char::is_whitespace) {
        return Err(ValidationError::new(
            "label value cannot contain whitespace",
        ));
    }
    if !val.is_ascii() {
        return Err(ValidationError::new(
            "label value must contain only ASCII characters",
        ));
    }

    let name = val.strip_prefix('!').unwrap_or(val);
    if name.is_empty() {
        return Err(ValidationError::new(
            "system label marker \"!\" must be followed by a value",
        ));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_PUNCTUATION.contains(c)) {
        return Err(ValidationError::new(format!(
            "label value contains disallowed punctuation '{c}'"
        )));
    }

    Ok(())
}

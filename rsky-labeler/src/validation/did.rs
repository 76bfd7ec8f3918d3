use crate::validation::ValidationError;

// Constraints applied to label `src` values and `did:` subjects:
//   - starts "did:" (lower-case)
//   - at least three ":"-separated segments
//   - method is 2 to 32 lower-case ASCII letters
//   - method-specific identifier (every segment after the method, re-joined
//     with ":") is non-empty, at most 512 chars, and has no whitespace or any
//     of <>{}[]|\^`

const MAX_IDENTIFIER_LEN: usize = 512;
const FORBIDDEN_CHARS: &[char] = &['<', '>', '{', '}', '[', ']', '|', '\\', '^', '`'];

pub fn validate_did(did: &str) -> Result<(), ValidationError> {
    if did.is_empty() {
        return Err(ValidationError::new("DID cannot be empty"));
    }
    if !did.starts_with("did:") {
        return Err(ValidationError::new("DID must start with \"did:\""));
    }

    let parts: Vec<&str> = did.split(':').collect();
    if parts.len() < 3 {
        return Err(ValidationError::new(
            "DID requires prefix, method, and method-specific identifier",
        ));
    }

    let method = parts[1];
    if !(2..=32).contains(&method.len()) || !method.bytes().all(|b| b.is_ascii_lowercase()) {
        return Err(ValidationError::new(format!(
            "DID method must be 2-32 lower-case letters, got \"{method}\""
        )));
    }

    let identifier = parts[2..].join(":");
    if identifier.is_empty() {
        return Err(ValidationError::new(
            "DID method-specific identifier cannot be empty",
        ));
    }
    if identifier
        .chars()
        .any(|c| c.is_whitespace() || FORBIDDEN_CHARS.contains(&c))
    {
        return Err(ValidationError::new(
            "DID method-specific identifier contains forbidden characters",
        ));
    }
    if identifier.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::new(format!(
            "DID method-specific identifier is too long ({MAX_IDENTIFIER_LEN} chars max)"
        )));
    }

    Ok(())
}

use crate::validation::did::validate_did;
use crate::validation::ValidationError;
use lazy_static::lazy_static;
use regex::Regex;

const MAX_AT_URI_LEN: usize = 8 * 1024;
const MAX_HANDLE_LEN: usize = 253;
const MAX_NSID_LEN: usize = 253 + 1 + 63;
const MAX_SEGMENT_LEN: usize = 63;

lazy_static! {
    // Everything before an optional "#fragment"
    static ref AT_URI_CHARS: Regex = Regex::new(r"^[a-zA-Z0-9._~:@!$&'()*+,;=%/-]*$").unwrap();

    static ref FRAGMENT_CHARS: Regex =
        Regex::new(r"^/[a-zA-Z0-9._~:@!$&'()*+,;=\[\]/\\-]*$").unwrap();

    static ref RECORD_KEY: Regex = Regex::new(r"^[a-zA-Z0-9._:~-]{1,512}$").unwrap();
}

/// A syntactically valid `at://` locator broken into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtUri {
    pub authority: String,
    pub collection: Option<String>,
    pub rkey: Option<String>,
    pub fragment: Option<String>,
}

/// Validates a label subject: either a bare `did:` account identifier or an
/// `at://` content locator.
pub fn validate_uri(uri: &str) -> Result<(), ValidationError> {
    if uri.is_empty() {
        return Err(ValidationError::new("URI cannot be empty"));
    }
    if uri.starts_with("did:") {
        validate_did(uri)
    } else if uri.starts_with("at://") {
        parse_at_uri(uri).map(|_| ())
    } else {
        Err(ValidationError::new(
            "URI must start with either did: or at://",
        ))
    }
}

#[deprecated(note = "use validate_uri, which also accepts bare DID subjects")]
pub fn validate_at_uri(uri: &str) -> Result<(), ValidationError> {
    if uri.is_empty() {
        return Err(ValidationError::new("URI cannot be empty"));
    }
    if !uri.starts_with("at://") {
        return Err(ValidationError::new("URI must start with at://"));
    }
    parse_at_uri(uri).map(|_| ())
}

// AT-URI constraints:
//   - ASCII only, no whitespace; 8KB hard limit
//   - "at://" then an authority which is a DID or a handle
//   - optionally "/" and an NSID collection
//   - optionally, after a collection, "/" and a record key
//   - optionally "#" and a fragment which is a JSON pointer (starts with "/")
pub fn parse_at_uri(uri: &str) -> Result<AtUri, ValidationError> {
    if uri.len() > MAX_AT_URI_LEN {
        return Err(ValidationError::new("AT-URI is far too long"));
    }

    let (path_part, fragment) = match uri.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (uri, None),
    };
    if fragment.is_some_and(|f| f.contains('#')) {
        return Err(ValidationError::new(
            "AT-URI can have at most one \"#\", separating fragment out",
        ));
    }
    if !AT_URI_CHARS.is_match(path_part) {
        return Err(ValidationError::new(
            "Disallowed characters in AT-URI (ASCII)",
        ));
    }

    let rest = path_part
        .strip_prefix("at://")
        .ok_or_else(|| ValidationError::new("AT-URI must start with \"at://\""))?;
    let segments: Vec<&str> = rest.split('/').collect();

    let authority = segments[0];
    if authority.is_empty() {
        return Err(ValidationError::new("AT-URI requires an authority"));
    }
    if authority.starts_with("did:") {
        validate_did(authority).map_err(|e| {
            ValidationError::new(format!(
                "AT-URI authority is not a valid DID: {}",
                e.reason()
            ))
        })?;
    } else {
        validate_handle(authority)?;
    }

    if segments.len() > 3 {
        return Err(ValidationError::new(
            "AT-URI path can have at most two parts, and no trailing slash",
        ));
    }

    let collection = match segments.get(1) {
        Some(collection) if collection.is_empty() => {
            return Err(ValidationError::new(
                "AT-URI can not have a slash after authority without a path segment",
            ))
        }
        Some(collection) => {
            validate_nsid(collection)?;
            Some(collection.to_string())
        }
        None => None,
    };

    let rkey = match segments.get(2) {
        Some(rkey) if rkey.is_empty() => {
            return Err(ValidationError::new(
                "AT-URI can not have a slash after collection, unless record key is provided",
            ))
        }
        Some(rkey) => {
            if *rkey == "." || *rkey == ".." || !RECORD_KEY.is_match(rkey) {
                return Err(ValidationError::new(format!(
                    "AT-URI record key is invalid: \"{rkey}\""
                )));
            }
            Some(rkey.to_string())
        }
        None => None,
    };

    if let Some(fragment) = fragment {
        if !FRAGMENT_CHARS.is_match(fragment) {
            return Err(ValidationError::new(
                "AT-URI fragment must be non-empty and start with slash",
            ));
        }
    }

    Ok(AtUri {
        authority: authority.to_string(),
        collection,
        rkey,
        fragment: fragment.map(str::to_string),
    })
}

fn validate_handle(handle: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| {
        ValidationError::new(format!(
            "AT-URI authority must be a valid handle or DID: {reason}"
        ))
    };

    if !handle
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return Err(invalid("disallowed characters in handle"));
    }
    if handle.len() > MAX_HANDLE_LEN {
        return Err(invalid("handle is too long (253 chars max)"));
    }

    let labels: Vec<&str> = handle.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid("handle domain needs at least two parts"));
    }
    for label in &labels {
        if label.is_empty() {
            return Err(invalid("handle parts can not be empty"));
        }
        if label.len() > MAX_SEGMENT_LEN {
            return Err(invalid("handle part too long (max 63 chars)"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("handle parts can not start or end with hyphens"));
        }
    }
    let tld = labels[labels.len() - 1];
    if !tld.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(invalid("handle final component (TLD) must start with ASCII letter"));
    }
    Ok(())
}

// NSID: a reversed domain authority followed by a name that starts with a
// letter and is otherwise alphanumeric, e.g. app.bsky.feed.post
fn validate_nsid(nsid: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| {
        ValidationError::new(format!("AT-URI collection is not a valid NSID: {reason}"))
    };

    if !nsid
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return Err(invalid("disallowed characters"));
    }
    if nsid.len() > MAX_NSID_LEN {
        return Err(invalid("NSID is too long (317 chars max)"));
    }

    let parts: Vec<&str> = nsid.split('.').collect();
    if parts.len() < 3 {
        return Err(invalid("NSID needs at least three parts"));
    }
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            return Err(invalid("NSID parts can not be empty"));
        }
        if part.len() > MAX_SEGMENT_LEN {
            return Err(invalid("NSID part too long (max 63 chars)"));
        }
        if i < last {
            if part.starts_with('-') || part.ends_with('-') {
                return Err(invalid("NSID authority parts can not start or end with hyphen"));
            }
            if i == 0 && part.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(invalid("NSID first part may not start with a digit"));
            }
        } else if !part.starts_with(|c: char| c.is_ascii_alphabetic())
            || !part.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(invalid(
                "NSID name part must be alphanumeric and start with a letter",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_valid(uri: &str) {
        validate_uri(uri).unwrap_or_else(|e| panic!("expected {uri} to be valid: {e}"));
    }

    fn expect_invalid(uri: &str) {
        assert!(validate_uri(uri).is_err(), "expected {uri} to be invalid");
    }

    #[test]
    fn test_did_subjects() {
        expect_valid("did:plc:7iza6de2dwap2sbkpav7c6c6");
        expect_valid("did:web:example.com");
        expect_invalid("did:plc:");
        expect_invalid("did:x:abc");
    }

    #[test]
    fn test_at_uri_subjects() {
        expect_valid("at://did:web:example.com/app.bsky.feed.post/abc");
        expect_valid("at://did:plc:7iza6de2dwap2sbkpav7c6c6/app.bsky.feed.post/3jwdwj2ctlk26");
        expect_valid("at://alice.bsky.social");
        expect_valid("at://alice.bsky.social/app.bsky.actor.profile/self");
        expect_valid("at://did:plc:abc123/app.bsky.feed.post");
        expect_valid("at://did:plc:abc123/app.bsky.feed.post/abc#/text");

        expect_invalid("at://");
        expect_invalid("at:///app.bsky.feed.post");
        expect_invalid("at://did:plc:abc123/");
        expect_invalid("at://did:plc:abc123/app.bsky.feed.post/");
        expect_invalid("at://did:plc:abc123/app.bsky.feed.post/abc/extra");
        expect_invalid("at://did:plc:abc123/post/abc");
        expect_invalid("at://did:plc:abc123/app.bsky.feed.post/a b");
        expect_invalid("at://did:plc:abc123/app.bsky.feed.post/..");
        expect_invalid("at://did:plc:abc123#");
        expect_invalid("at://did:plc:abc123#nope");
        expect_invalid("at://localhost/app.bsky.feed.post/abc");
        expect_invalid("at://-bad-.example.com");
        expect_invalid(&format!("at://did:plc:abc123/app.bsky.feed.post/{}", "a".repeat(513)));
    }

    #[test]
    fn test_unknown_scheme() {
        let err = validate_uri("https://example.com").unwrap_err();
        assert_eq!(err.reason(), "URI must start with either did: or at://");
        let err = validate_uri("").unwrap_err();
        assert_eq!(err.reason(), "URI cannot be empty");
    }

    #[test]
    #[allow(deprecated)]
    fn test_at_uri_only_variant() {
        assert!(validate_at_uri("at://did:plc:abc123/app.bsky.feed.post/abc").is_ok());
        let err = validate_at_uri("did:plc:abc123").unwrap_err();
        assert_eq!(err.reason(), "URI must start with at://");
    }

    #[test]
    fn test_parse_parts() {
        let parsed = parse_at_uri("at://did:plc:abc123/app.bsky.feed.post/xyz#/embed").unwrap();
        assert_eq!(parsed.authority, "did:plc:abc123");
        assert_eq!(parsed.collection.as_deref(), Some("app.bsky.feed.post"));
        assert_eq!(parsed.rkey.as_deref(), Some("xyz"));
        assert_eq!(parsed.fragment.as_deref(), Some("/embed"));

        let parsed = parse_at_uri("at://bob.test").unwrap();
        assert_eq!(parsed.authority, "bob.test");
        assert!(parsed.collection.is_none());
        assert!(parsed.rkey.is_none());
    }
}

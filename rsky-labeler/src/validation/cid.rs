use crate::validation::ValidationError;
use lexicon_cid::Cid;

/// Accepts legacy base58 CIDv0 strings (`Qm...`) and base32 multibase CIDv1
/// strings (`b...`) whose version, codec and multihash all decode.
pub fn validate_cid(cid: &str) -> Result<(), ValidationError> {
    if cid.is_empty() {
        return Err(ValidationError::new("CID cannot be empty"));
    }
    if !cid.starts_with('Q') && !cid.starts_with('b') {
        return Err(ValidationError::new(
            "CID must start with \"Q\" (CIDv0) or \"b\" (base32 CIDv1)",
        ));
    }
    Cid::try_from(cid)
        .map(|_| ())
        .map_err(|e| ValidationError::new(format!("invalid CID \"{cid}\": {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexicon_cid::multihash::Multihash;
    use sha2::{Digest, Sha256};

    const SHA2_256: u64 = 0x12;
    const DAG_CBOR: u64 = 0x71;

    fn digest(data: &[u8]) -> Multihash<64> {
        let hash = Sha256::digest(data);
        Multihash::<64>::wrap(SHA2_256, hash.as_slice()).unwrap()
    }

    #[test]
    fn test_accepts_v1_and_v0() {
        let v1 = Cid::new_v1(DAG_CBOR, digest(b"label")).to_string();
        assert!(v1.starts_with('b'));
        validate_cid(&v1).unwrap();

        let v0 = Cid::new_v0(digest(b"label")).unwrap().to_string();
        assert!(v0.starts_with("Qm"));
        validate_cid(&v0).unwrap();
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(validate_cid("").unwrap_err().reason(), "CID cannot be empty");
        assert!(validate_cid("zb2rhe5P4gXftAwvA4eXQ5HJwsER2owDyS9sKaQRRVQPn93bA").is_err());
        assert!(validate_cid("bafy").is_err());
        assert!(validate_cid("bafyreinotarealcid").is_err());
        assert!(validate_cid("Qmnope").is_err());

        let v1 = Cid::new_v1(DAG_CBOR, digest(b"label")).to_string();
        let truncated = &v1[..v1.len() - 4];
        assert!(validate_cid(truncated).is_err());
    }
}

//! Content digest and unique-name derivation

use sha2::{Digest, Sha256};

use crate::types::VerifyKey;

/// Hex SHA-256 of the submitted source bytes
pub fn code_hash(raw_code: &str) -> String {
    hex::encode(Sha256::digest(raw_code.as_bytes()))
}

/// `{class_name}_{submitter}_{code_hash}`
pub fn unique_name(class_name: &str, submitter: &VerifyKey, code_hash: &str) -> String {
    format!("{}_{}_{}", class_name, submitter, code_hash)
}

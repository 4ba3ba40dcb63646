/*!
 * Checksums for part bodies, part plans and assembled uploads
 */

use crate::types::{PartDescriptor, PartResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// Base64 SHA-256 of a part body, as sent alongside the upload-part call
pub fn part_checksum(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Hex SHA-256 over a part plan
///
/// Two plans hash equal exactly when they have the same parts in the same
/// order, which is how a resume token is tied to its payload.
pub fn plan_checksum(parts: &[PartDescriptor]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(format!("{}:{}:{}\n", part.index, part.offset, part.length).as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Checksum-of-checksums for a completed upload, suffixed with the part count
///
/// `results` must be in ascending part order.
pub fn composite_checksum(results: &[PartResult]) -> String {
    let mut hasher = Sha256::new();
    for result in results {
        hasher.update(result.checksum.as_bytes());
    }
    format!("{}-{}", STANDARD.encode(hasher.finalize()), results.len())
}

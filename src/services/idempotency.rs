use sha2::{Digest, Sha256};

/// Derive a stable fingerprint for a scan submission from the image URL and
/// OCR text. Two jobs with the same key are the same submission: the second
/// one short-circuits by copying the first one's resolution result.
pub fn compute_key(image_url: &str, ocr_text: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_url.as_bytes());
    hasher.update(b"|");
    hasher.update(ocr_text.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

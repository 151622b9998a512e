//! Archive record envelope parsing.
//!
//! A fetched byte range holds one gzip-compressed archive record: an
//! envelope-header block, a protocol-header block, and the payload, separated
//! by blank lines (double CRLF). This is the most security-sensitive boundary
//! in the pipeline: the bytes come straight off the open web and must never
//! be able to crash the process, only to be rejected.

use flate2::read::GzDecoder;
use std::io::Read;
use thiserror::Error;

const BLOCK_DELIMITER: &[u8] = b"\r\n\r\n";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The record body was not a valid gzip member.
    #[error("envelope decompression failed: {0}")]
    Decompress(String),

    /// Fewer than 3 blocks were recoverable after decompression.
    #[error("envelope is missing blocks (expected header, header, payload)")]
    Truncated,
}

/// Extracts the payload block from a raw archive record.
///
/// Decompresses `raw`, splits on the first two blank-line delimiters, and
/// returns the third block verbatim. Anything that does not decompress into
/// at least 3 blocks is malformed; the caller skips the candidate.
pub fn extract(raw: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut decoder = GzDecoder::new(raw);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| EnvelopeError::Decompress(e.to_string()))?;

    let first = find_delimiter(&decompressed, 0).ok_or(EnvelopeError::Truncated)?;
    let second = find_delimiter(&decompressed, first + BLOCK_DELIMITER.len())
        .ok_or(EnvelopeError::Truncated)?;
    Ok(decompressed[second + BLOCK_DELIMITER.len()..].to_vec())
}

fn find_delimiter(data: &[u8], from: usize) -> Option<usize> {
    if from > data.len() {
        return None;
    }
    data[from..]
        .windows(BLOCK_DELIMITER.len())
        .position(|window| window == BLOCK_DELIMITER)
        .map(|i| from + i)
}

//! Notification body parsing
//!
//! Application servers send `version=<n>` as the request body. Whitespace
//! around the `=` is allowed and the pair may appear anywhere in the body;
//! the first well-formed occurrence wins.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("no version found in body")]
    Missing,

    #[error("version does not fit in 64 bits")]
    Overflow,
}

const KEY: &str = "version";

/// Extract the version number from a notification body
pub fn extract_version(body: &str) -> Result<u64, VersionError> {
    let mut search_from = 0;

    while let Some(offset) = body[search_from..].find(KEY) {
        let start = search_from + offset + KEY.len();
        if let Some(digits) = digits_after_equals(&body[start..]) {
            return digits.parse::<u64>().map_err(|_| VersionError::Overflow);
        }
        search_from = start;
    }

    Err(VersionError::Missing)
}

fn digits_after_equals(rest: &str) -> Option<&str> {
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(&rest[..end])
    }
}

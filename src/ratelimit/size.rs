//! Declared request size guard.

use tracing::warn;

use crate::error::PayloadTooLarge;

const MB: u64 = 1024 * 1024;

/// Named body size ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SizeBucket {
    OneMb,
    FiveMb,
    #[default]
    TenMb,
    FiftyMb,
}

impl SizeBucket {
    /// Parse a bucket name such as `5mb` (case-insensitive).
    ///
    /// Unknown names fall back to `10mb`.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "1mb" => SizeBucket::OneMb,
            "5mb" => SizeBucket::FiveMb,
            "10mb" => SizeBucket::TenMb,
            "50mb" => SizeBucket::FiftyMb,
            other => {
                warn!(bucket = %other, "Unknown size bucket, using 10mb");
                SizeBucket::TenMb
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SizeBucket::OneMb => "1mb",
            SizeBucket::FiveMb => "5mb",
            SizeBucket::TenMb => "10mb",
            SizeBucket::FiftyMb => "50mb",
        }
    }

    pub fn max_bytes(&self) -> u64 {
        match self {
            SizeBucket::OneMb => MB,
            SizeBucket::FiveMb => 5 * MB,
            SizeBucket::TenMb => 10 * MB,
            SizeBucket::FiftyMb => 50 * MB,
        }
    }
}

/// Reject a declared `Content-Length` above the bucket.
///
/// A missing or unparsable header is treated as zero and accepted.
pub fn check_content_length(
    content_length: Option<&str>,
    bucket: SizeBucket,
) -> Result<(), PayloadTooLarge> {
    let declared = content_length
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let limit = bucket.max_bytes();
    if declared > limit {
        return Err(PayloadTooLarge::new(bucket.name(), declared, limit));
    }
    Ok(())
}

//! Input resolution: turn a user-supplied path, URL or byte buffer into an
//! [`InputDocument`] with a known format.
//!
//! Every check here runs before extraction. A missing, oversized or
//! unsupported file is rejected immediately and the pipeline never starts.

use crate::document::FormatHint;
use crate::error::DocIntelError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Document bytes ready for the Extraction Adapter.
#[derive(Debug, Clone)]
pub struct InputDocument {
    /// File name or URL, used in error messages.
    pub name: String,
    pub bytes: Vec<u8>,
    pub format: FormatHint,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a local path or HTTP(S) URL to validated document bytes.
pub async fn resolve_input(
    input: &str,
    max_bytes: u64,
    download_timeout_secs: u64,
) -> Result<InputDocument, DocIntelError> {
    if input.trim().is_empty() {
        return Err(DocIntelError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_url(input, max_bytes, download_timeout_secs).await
    } else {
        read_local(input, max_bytes).await
    }
}

/// Validate in-memory bytes (size, then format).
pub fn from_bytes(bytes: Vec<u8>, name: &str, max_bytes: u64) -> Result<InputDocument, DocIntelError> {
    check_size(name, bytes.len() as u64, max_bytes)?;
    let format = detect_format(&bytes, name)?;
    Ok(InputDocument {
        name: name.to_string(),
        bytes,
        format,
    })
}

/// Detect the format from magic bytes, falling back to the file extension.
pub fn detect_format(bytes: &[u8], name: &str) -> Result<FormatHint, DocIntelError> {
    if bytes.is_empty() {
        return Err(DocIntelError::CorruptFile {
            name: name.to_string(),
            detail: "file is empty".into(),
        });
    }
    if let Some(format) = FormatHint::sniff(bytes) {
        return Ok(format);
    }
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    FormatHint::from_extension(ext).ok_or_else(|| {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        DocIntelError::UnsupportedFormat {
            name: name.to_string(),
            detail: format!("unrecognised content (first bytes {magic:?})"),
        }
    })
}

fn check_size(name: &str, size: u64, limit: u64) -> Result<(), DocIntelError> {
    if size > limit {
        return Err(DocIntelError::FileTooLarge {
            name: name.to_string(),
            size,
            limit,
        });
    }
    Ok(())
}

async fn read_local(path_str: &str, max_bytes: u64) -> Result<InputDocument, DocIntelError> {
    let path = PathBuf::from(path_str);

    let meta = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(DocIntelError::PermissionDenied { path });
        }
        Err(_) => return Err(DocIntelError::FileNotFound { path }),
    };
    if !meta.is_file() {
        return Err(DocIntelError::InvalidInput {
            input: path_str.to_string(),
        });
    }
    check_size(path_str, meta.len(), max_bytes)?;

    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            DocIntelError::PermissionDenied { path: path.clone() }
        } else {
            DocIntelError::FileNotFound { path: path.clone() }
        }
    })?;

    let format = detect_format(&bytes, path_str)?;
    debug!("Resolved local {} document: {}", format, path.display());
    Ok(InputDocument {
        name: path_str.to_string(),
        bytes,
        format,
    })
}

async fn download_url(url: &str, max_bytes: u64, timeout_secs: u64) -> Result<InputDocument, DocIntelError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| DocIntelError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            DocIntelError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            DocIntelError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(DocIntelError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    if let Some(len) = response.content_length() {
        check_size(url, len, max_bytes)?;
    }

    let name = extract_filename(url);
    let bytes = response
        .bytes()
        .await
        .map_err(|e| DocIntelError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .to_vec();

    check_size(url, bytes.len() as u64, max_bytes)?;
    let format = detect_format(&bytes, &name)?;
    info!("Downloaded {} bytes ({})", bytes.len(), format);

    Ok(InputDocument {
        name: url.to_string(),
        bytes,
        format,
    })
}

/// Last path segment of the URL when it looks like a file name.
fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded".to_string()
}

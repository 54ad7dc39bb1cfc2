//! Post-download verification of local files.
//!
//! Checks are lenient: the service legitimately serves renditions whose size
//! differs from the declared one, so only drastic deviations count as
//! corruption.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use super::set_file_mtime;
use crate::api::{DownloadInfo, RemoteFile};

/// Bytes read from the head and tail of a file to confirm it is readable.
const PROBE_LEN: u64 = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub exists: bool,
    pub size_valid: bool,
    /// SHA-256 hex digest, computed only when verification is enabled.
    pub hash: Option<String>,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn is_complete(&self) -> bool {
        self.exists && self.size_valid && self.errors.is_empty()
    }

    /// Empty or truncated files. These trigger cleanup and a re-download
    /// rather than being accepted.
    pub fn has_serious_errors(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.contains("empty") || e.contains("incomplete"))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IntegrityChecker {
    verify_integrity: bool,
    preserve_timestamps: bool,
    chunk_size: usize,
}

impl IntegrityChecker {
    pub fn new(verify_integrity: bool, preserve_timestamps: bool, chunk_size: usize) -> Self {
        Self {
            verify_integrity,
            preserve_timestamps,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn verify_enabled(&self) -> bool {
        self.verify_integrity
    }

    /// Streaming SHA-256 of the file, as lowercase hex.
    pub fn calculate_file_hash(&self, path: &Path) -> std::io::Result<String> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn verify_download_integrity(&self, info: &DownloadInfo) -> IntegrityReport {
        let path = &info.local_path;
        let mut report = IntegrityReport::default();

        let actual_size = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                report.errors.push("File does not exist".to_string());
                return report;
            }
        };
        report.exists = true;

        match info.expected_size {
            Some(expected) if expected > 0 => {
                let ratio = actual_size as f64 / expected as f64;
                if actual_size == expected || (0.8..=1.2).contains(&ratio) {
                    report.size_valid = true;
                } else if info.is_video_file() && ratio < 0.1 {
                    tracing::debug!(
                        "Accepting video preview for {}: {} vs {}",
                        path.display(),
                        actual_size,
                        expected
                    );
                    report.size_valid = true;
                } else if !(0.1..=10.0).contains(&ratio) {
                    tracing::debug!(
                        "Significant size mismatch for {}: {} vs {}",
                        path.display(),
                        actual_size,
                        expected
                    );
                    report.errors.push("File size mismatch".to_string());
                } else {
                    report.size_valid = true;
                }
            }
            _ => report.size_valid = true,
        }

        if self.verify_integrity {
            match self.calculate_file_hash(path) {
                Ok(hash) => report.hash = Some(hash),
                Err(e) => report.errors.push(format!("Hash calculation failed: {e}")),
            }
        }

        if actual_size == 0 {
            report.errors.push("File is empty".to_string());
        } else if let Err(e) = probe_readable(path, actual_size, &mut report.errors) {
            report.errors.push(format!("File appears corrupted: {e}"));
        }

        report
    }

    /// Problems with a file already on disk whose expected size is unknown.
    /// Empty means the file looks fine.
    pub fn check_existing_file(&self, path: &Path) -> Vec<String> {
        let mut errors = Vec::new();
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() == 0 => errors.push("File is empty".to_string()),
            Ok(meta) => {
                if let Err(e) = probe_readable(path, meta.len(), &mut errors) {
                    errors.push(format!("File appears corrupted: {e}"));
                }
            }
            Err(e) => errors.push(format!("File is unreadable: {e}")),
        }
        errors
    }

    pub fn is_file_complete(&self, info: &DownloadInfo) -> bool {
        self.verify_download_integrity(info).is_complete()
    }

    /// Missing files are always fetched; `force` re-fetches existing ones.
    pub fn should_redownload(&self, info: &DownloadInfo, force: bool) -> bool {
        if !info.local_path.exists() {
            return true;
        }
        if force {
            tracing::debug!("Force overwrite enabled for {}", info.local_path.display());
            return true;
        }
        if !self.is_file_complete(info) {
            tracing::debug!(
                "Existing file incomplete, will re-download: {}",
                info.local_path.display()
            );
            return true;
        }
        false
    }

    /// Stamp the file with the capture time, falling back to upload time.
    pub fn preserve_file_timestamp(&self, path: &Path, file: &RemoteFile) -> bool {
        if !self.preserve_timestamps {
            return true;
        }
        let Some(ts) = file.file_timestamp() else {
            tracing::debug!("No timestamp available for {}", path.display());
            return true;
        };
        match set_file_mtime(path, ts.timestamp()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Could not preserve timestamp on {}: {}", path.display(), e);
                false
            }
        }
    }
}

/// Read the first and last [`PROBE_LEN`] bytes, noting short reads.
fn probe_readable(path: &Path, size: u64, errors: &mut Vec<String>) -> std::io::Result<()> {
    let mut file = File::open(path)?;
    let head_len = size.min(PROBE_LEN) as usize;
    let mut head = vec![0u8; head_len];
    if read_up_to(&mut file, &mut head)? != head_len {
        errors.push("File read incomplete".to_string());
    }
    if size > PROBE_LEN {
        file.seek(SeekFrom::End(-(PROBE_LEN as i64)))?;
        let mut tail = vec![0u8; PROBE_LEN as usize];
        if read_up_to(&mut file, &mut tail)? != tail.len() {
            errors.push("File end read incomplete".to_string());
        }
    }
    Ok(())
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

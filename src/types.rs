//! Shared output records, scan statistics and cancellation plumbing

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which engine produced a recovered file.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEngine {
    Fat32,
    Ntfs,
    Signature,
}

impl SourceEngine {
    pub fn label(&self) -> &'static str {
        match self {
            SourceEngine::Fat32 => "fat32",
            SourceEngine::Ntfs => "ntfs",
            SourceEngine::Signature => "signature",
        }
    }
}

/// One recovered file. Immutable once emitted by an engine; the orchestrator
/// only merges, deduplicates and reports these.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecoveredFileRecord {
    pub name: String,
    /// Path of the written output file, relative to the output directory.
    pub output_path: String,
    pub source: SourceEngine,
    /// Absolute byte offset of the first content byte on the device.
    pub start_offset: u64,
    /// Start cluster when the file came from filesystem metadata.
    pub start_cluster: Option<u64>,
    /// Size claimed by the metadata (or estimated by the carver).
    pub declared_size: u64,
    /// Bytes actually written to the output file.
    pub recovered_bytes: u64,
    /// recovered_bytes / declared_size, in percent.
    pub completeness: f32,
    pub is_deleted: bool,
    pub cluster_aligned: bool,
    pub category: String,
    pub description: String,
}

impl RecoveredFileRecord {
    /// Deduplication key: two finds of the same on-disk file collapse when
    /// they start at the same byte and claim the same size.
    pub fn dedup_key(&self) -> (u64, u64) {
        (self.start_offset, self.declared_size)
    }
}

/// Per-run skip/partial counters, surfaced in the summary report instead of
/// being raised as errors.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScanStatistics {
    pub bytes_scanned: u64,
    pub records_scanned: u64,
    pub clusters_scanned: u64,
    pub corrupt_structures_skipped: u64,
    pub chain_cycles_truncated: u64,
    pub incomplete_recoveries: u64,
    pub write_failures: u64,
    pub deep_scan_rescues: u64,
    pub aligned_hits: u64,
    pub total_hits: u64,
}

impl ScanStatistics {
    pub fn merge(&mut self, other: &ScanStatistics) {
        self.bytes_scanned += other.bytes_scanned;
        self.records_scanned += other.records_scanned;
        self.clusters_scanned += other.clusters_scanned;
        self.corrupt_structures_skipped += other.corrupt_structures_skipped;
        self.chain_cycles_truncated += other.chain_cycles_truncated;
        self.incomplete_recoveries += other.incomplete_recoveries;
        self.write_failures += other.write_failures;
        self.deep_scan_rescues += other.deep_scan_rescues;
        self.aligned_hits += other.aligned_hits;
        self.total_hits += other.total_hits;
    }

    pub fn alignment_ratio(&self) -> f32 {
        if self.total_hits == 0 {
            0.0
        } else {
            self.aligned_hits as f32 * 100.0 / self.total_hits as f32
        }
    }
}

/// Aggregate result of one recovery operation.
#[derive(Serialize, Deserialize, Debug)]
pub struct RecoveryReport {
    pub mode: String,
    pub volume_label: Option<String>,
    pub total_files: usize,
    pub total_recovered_bytes: u64,
    pub records: Vec<RecoveredFileRecord>,
    pub stats: ScanStatistics,
    pub scan_duration_ms: u64,
}

/// Cooperative cancellation flag, checked at window/record/cluster
/// boundaries. Cloning shares the flag.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Coarse category label for an extension, used to group output files and
/// summary counts.
pub fn categorize_extension(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "tiff" | "ico" | "psd" => "Images",
        "mp4" | "avi" | "mkv" | "mov" | "wmv" | "flv" | "webm" | "m4v" => "Videos",
        "mp3" | "wav" | "flac" | "aac" | "ogg" | "wma" | "m4a" => "Audio",
        "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "txt" | "rtf" | "odt"
        | "xml" | "html" | "htm" => "Documents",
        "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" | "iso" => "Archives",
        "exe" | "dll" | "msi" | "sys" => "Executables",
        "sql" | "db" | "sqlite" | "mdb" => "Databases",
        _ => "Other",
    }
}

/// Human-readable type name for an extension.
pub fn describe_extension(ext: &str) -> String {
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => "JPEG Image".to_string(),
        "png" => "PNG Image".to_string(),
        "gif" => "GIF Image".to_string(),
        "bmp" => "Bitmap Image".to_string(),
        "pdf" => "PDF Document".to_string(),
        "doc" | "docx" => "Word Document".to_string(),
        "xls" | "xlsx" => "Excel Spreadsheet".to_string(),
        "mp3" => "MP3 Audio".to_string(),
        "mp4" => "MP4 Video".to_string(),
        "zip" => "ZIP Archive".to_string(),
        "exe" => "Windows Executable".to_string(),
        "" => "File".to_string(),
        other => format!("{} File", other.to_uppercase()),
    }
}

/// Format file size for reports.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

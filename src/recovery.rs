//! Recovery orchestrator
//! Dispatches to the metadata engines or the signature carver, merges and
//! deduplicates their results, and owns the human-readable summary report.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::block_source::BlockSource;
use crate::carver::{self, CarveOptions, ScanDirection};
use crate::error::{RecoveryError, Result};
use crate::fat32::{self, Fat32Options};
use crate::ntfs::{self, NtfsOptions};
use crate::signatures::build_lookup;
use crate::types::{
    format_size, CancelToken, RecoveredFileRecord, RecoveryReport, ScanStatistics, SourceEngine,
};

pub const SUMMARY_FILENAME: &str = "recovery_summary.txt";

/// Requested recovery strategy. Auto probes the boot sector and picks the
/// matching metadata engine, falling back to signature carving.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Auto,
    Fat32,
    Ntfs,
    Signature,
}

impl RecoveryMode {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryMode::Auto => "auto",
            RecoveryMode::Fat32 => "fat32",
            RecoveryMode::Ntfs => "ntfs",
            RecoveryMode::Signature => "signature",
        }
    }

    pub fn parse(s: &str) -> Option<RecoveryMode> {
        match s.to_lowercase().as_str() {
            "auto" => Some(RecoveryMode::Auto),
            "fat32" => Some(RecoveryMode::Fat32),
            "ntfs" => Some(RecoveryMode::Ntfs),
            "signature" | "carve" => Some(RecoveryMode::Signature),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecoveryOptions {
    pub mode: RecoveryMode,
    pub carve: CarveOptions,
    pub fat32: Fat32Options,
    pub ntfs: NtfsOptions,
    pub scan_direction: ScanDirection,
}

impl Default for RecoveryMode {
    fn default() -> Self {
        RecoveryMode::Auto
    }
}

/// Filesystem verdict from probing the boot sector and the MBR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedFilesystem {
    Fat32,
    Ntfs,
    Unknown,
}

pub fn detect_filesystem(source: &mut dyn BlockSource) -> DetectedFilesystem {
    if ntfs::find_boot_sector(source).is_ok() {
        return DetectedFilesystem::Ntfs;
    }
    if fat32::find_boot_sector(source).is_ok() {
        return DetectedFilesystem::Fat32;
    }
    DetectedFilesystem::Unknown
}

/// Run one recovery operation end to end. Engines never raise localized
/// problems past this point; a missing boot sector downgrades to carving,
/// and only an unreadable device surfaces as a failure.
pub fn run_recovery(
    source: &mut dyn BlockSource,
    output_dir: &Path,
    options: &RecoveryOptions,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(u64, &str),
) -> Result<RecoveryReport> {
    let started = std::time::Instant::now();
    std::fs::create_dir_all(output_dir)?;

    let mode = match options.mode {
        RecoveryMode::Auto => match detect_filesystem(source) {
            DetectedFilesystem::Ntfs => RecoveryMode::Ntfs,
            DetectedFilesystem::Fat32 => RecoveryMode::Fat32,
            DetectedFilesystem::Unknown => {
                info!("no recognizable filesystem, using signature carving");
                RecoveryMode::Signature
            }
        },
        other => other,
    };

    let mut records: Vec<RecoveredFileRecord> = Vec::new();
    let mut stats = ScanStatistics::default();
    let mut volume_label = None;

    match mode {
        RecoveryMode::Fat32 => match fat32::recover(source, output_dir, &options.fat32, cancel, progress) {
            Ok(outcome) => {
                volume_label = Some(outcome.volume_label);
                stats.merge(&outcome.stats);
                records.extend(outcome.records);
            }
            Err(RecoveryError::NoValidBootSector { fs }) => {
                warn!("no valid {} boot sector, falling back to carving", fs);
                let (carved, carve_stats) = run_carving(source, output_dir, options, cancel, progress)?;
                stats.merge(&carve_stats);
                records.extend(carved);
            }
            Err(e) => return Err(e),
        },
        RecoveryMode::Ntfs => match ntfs::recover(source, output_dir, &options.ntfs, cancel, progress) {
            Ok(outcome) => {
                stats.merge(&outcome.stats);
                records.extend(outcome.records);
            }
            Err(RecoveryError::NoValidBootSector { fs }) => {
                warn!("no valid {} boot sector, falling back to carving", fs);
                let (carved, carve_stats) = run_carving(source, output_dir, options, cancel, progress)?;
                stats.merge(&carve_stats);
                records.extend(carved);
            }
            Err(e) => return Err(e),
        },
        RecoveryMode::Signature => {
            let (carved, carve_stats) = run_carving(source, output_dir, options, cancel, progress)?;
            stats.merge(&carve_stats);
            records.extend(carved);
        }
        RecoveryMode::Auto => unreachable!("auto resolved above"),
    }

    let records = merge_records(records);
    let total_recovered_bytes = records.iter().map(|r| r.recovered_bytes).sum();

    let report = RecoveryReport {
        mode: mode.label().to_string(),
        volume_label,
        total_files: records.len(),
        total_recovered_bytes,
        records,
        stats,
        scan_duration_ms: started.elapsed().as_millis() as u64,
    };

    write_summary(source, output_dir, &report)?;
    Ok(report)
}

fn run_carving(
    source: &mut dyn BlockSource,
    output_dir: &Path,
    options: &RecoveryOptions,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(u64, &str),
) -> Result<(Vec<RecoveredFileRecord>, ScanStatistics)> {
    let lookup = build_lookup();
    carver::carve(
        source,
        output_dir,
        &lookup,
        &options.carve,
        options.scan_direction,
        cancel,
        progress,
    )
}

/// Collapse duplicate finds across engines and passes. Two records are the
/// same file when they start at the same device byte and claim the same
/// size; the first occurrence wins.
pub fn merge_records(records: Vec<RecoveredFileRecord>) -> Vec<RecoveredFileRecord> {
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    let mut merged = Vec::with_capacity(records.len());
    for record in records {
        if record.start_offset == 0 || seen.insert(record.dedup_key()) {
            merged.push(record);
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// Summary report
// ---------------------------------------------------------------------------

/// Names for the MBR partition-type codes that show up on recovered media.
pub fn partition_type_name(type_code: u8) -> &'static str {
    match type_code {
        0x00 => "empty",
        0x01 => "FAT12",
        0x04 => "FAT16 (<32MB)",
        0x05 => "extended",
        0x06 => "FAT16",
        0x07 => "NTFS/exFAT",
        0x0B => "FAT32 (CHS)",
        0x0C => "FAT32 (LBA)",
        0x0E => "FAT16 (LBA)",
        0x0F => "extended (LBA)",
        0x82 => "Linux swap",
        0x83 => "Linux",
        0x8E => "Linux LVM",
        0xA5 => "FreeBSD",
        0xAF => "Apple HFS/HFS+",
        0xEE => "GPT protective",
        0xEF => "EFI system",
        _ => "unknown",
    }
}

/// Parse the MBR partition table for the report header. Purely informative;
/// the engines do their own boot-sector discovery.
fn mbr_partition_lines(source: &mut dyn BlockSource) -> Vec<String> {
    let mut lines = Vec::new();
    let Ok(mbr) = source.read_at(0, 512) else {
        return lines;
    };
    if mbr.len() < 512 || mbr[510] != 0x55 || mbr[511] != 0xAA {
        return lines;
    }

    for i in 0..4 {
        let entry = &mbr[446 + i * 16..446 + (i + 1) * 16];
        let type_code = entry[4];
        let sectors = u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]);
        if type_code == 0 || sectors == 0 {
            continue;
        }
        let start_lba = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);
        lines.push(format!(
            "  partition {}: type 0x{:02X} ({}), start LBA {}, {} sectors ({}){}",
            i + 1,
            type_code,
            partition_type_name(type_code),
            start_lba,
            sectors,
            format_size(sectors as u64 * 512),
            if entry[0] == 0x80 { ", active" } else { "" },
        ));
    }
    lines
}

/// Append this run's results to `recovery_summary.txt` in the output
/// directory. The file accumulates across composed engine runs.
fn write_summary(
    source: &mut dyn BlockSource,
    output_dir: &Path,
    report: &RecoveryReport,
) -> Result<()> {
    let path = output_dir.join(SUMMARY_FILENAME);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| RecoveryError::ReportWrite(format!("{}: {}", path.display(), e)))?;

    let mut text = String::new();
    text.push_str("==============================\n");
    text.push_str("File Recovery Summary\n");
    text.push_str("==============================\n");
    text.push_str(&format!(
        "Time: {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    text.push_str(&format!("Mode: {}\n", report.mode));
    if let Some(label) = &report.volume_label {
        if !label.is_empty() {
            text.push_str(&format!("Volume label: {}\n", label));
        }
    }
    text.push_str(&format!("Files recovered: {}\n", report.total_files));
    text.push_str(&format!(
        "Total recovered: {}\n",
        format_size(report.total_recovered_bytes)
    ));
    text.push_str(&format!("Duration: {} ms\n", report.scan_duration_ms));

    let partitions = mbr_partition_lines(source);
    if !partitions.is_empty() {
        text.push_str("\nPartition table:\n");
        for line in &partitions {
            text.push_str(line);
            text.push('\n');
        }
    }

    // Alignment statistics only mean something for signature hits.
    if report.stats.total_hits > 0 {
        text.push_str("\nAlignment statistics:\n");
        text.push_str(&format!(
            "  cluster-aligned hits: {} of {} ({:.2}%)\n",
            report.stats.aligned_hits,
            report.stats.total_hits,
            report.stats.alignment_ratio()
        ));
    }

    text.push_str("\nSkip counters:\n");
    text.push_str(&format!(
        "  corrupt structures skipped: {}\n",
        report.stats.corrupt_structures_skipped
    ));
    text.push_str(&format!(
        "  chain cycles truncated: {}\n",
        report.stats.chain_cycles_truncated
    ));
    text.push_str(&format!(
        "  incomplete recoveries: {}\n",
        report.stats.incomplete_recoveries
    ));
    text.push_str(&format!(
        "  write failures: {}\n",
        report.stats.write_failures
    ));
    text.push_str(&format!(
        "  deep scan rescues: {}\n",
        report.stats.deep_scan_rescues
    ));

    let mut by_category: Vec<(String, usize)> = Vec::new();
    for record in &report.records {
        match by_category.iter_mut().find(|(c, _)| *c == record.category) {
            Some((_, count)) => *count += 1,
            None => by_category.push((record.category.clone(), 1)),
        }
    }
    by_category.sort_by(|a, b| b.1.cmp(&a.1));

    text.push_str("\nFiles by category:\n");
    for (category, count) in &by_category {
        text.push_str(&format!("  {}: {}\n", category, count));
    }

    text.push_str("\nFile listing:\n");
    for (index, record) in report.records.iter().enumerate() {
        text.push_str(&format!(
            "{:5}. {} ({}, offset {:#x}, {}, via {}, {:.1}% complete, aligned: {}{})\n",
            index + 1,
            record.name,
            format_size(record.recovered_bytes),
            record.start_offset,
            record.description,
            record.source.label(),
            record.completeness,
            if record.cluster_aligned { "yes" } else { "no" },
            if record.is_deleted { ", deleted" } else { "" },
        ));
    }

    let forced = report
        .records
        .iter()
        .filter(|r| r.is_deleted && r.source == SourceEngine::Fat32)
        .count();
    if forced > 0 {
        text.push_str(&format!(
            "\nNote: {} deleted files were read as contiguous cluster runs because \
their allocation chains are gone. On fragmented volumes the bytes beyond \
the reported completeness percentage may belong to other files.\n",
            forced
        ));
    }
    text.push('\n');

    file.write_all(text.as_bytes())
        .map_err(|e| RecoveryError::ReportWrite(format!("{}: {}", path.display(), e)))?;
    Ok(())
}

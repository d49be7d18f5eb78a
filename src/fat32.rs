//! FAT32 metadata engine
//! Locates and validates a FAT32 boot sector, reads the FAT, walks the
//! directory tree for live and deleted entries, reconstructs cluster chains
//! and falls back to signature-scoped deep scanning and a whole-volume
//! orphan-directory pass when the metadata is inconsistent.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::block_source::{sanitize_filename, save_recovered_file, BlockSource};
use crate::carver::{estimate_size, CarveOptions};
use crate::error::{RecoveryError, Result};
use crate::signatures::{build_lookup, FileSignature};
use crate::types::{
    categorize_extension, describe_extension, CancelToken, RecoveredFileRecord, ScanStatistics,
    SourceEngine,
};

const SECTOR: usize = 512;
const DIR_ENTRY_SIZE: usize = 32;
const DELETED_MARKER: u8 = 0xE5;
const ATTR_LONG_NAME: u8 = 0x0F;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_VOLUME_ID: u8 = 0x08;

/// End-of-chain threshold after 28-bit masking.
const FAT32_EOC: u32 = 0x0FFF_FFF8;
const FAT32_MASK: u32 = 0x0FFF_FFFF;

/// MBR partition type codes probed for a FAT boot sector. FAT16 codes are
/// included because large FAT16-labelled partitions are sometimes FAT32.
const FAT_PARTITION_TYPES: [u8; 8] = [0x0B, 0x0C, 0x1B, 0x1C, 0x06, 0x0E, 0x16, 0x1E];

/// Parsed BIOS Parameter Block plus the partition's byte offset.
#[derive(Debug, Clone)]
pub struct Fat32BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub sectors_per_fat: u32,
    pub root_cluster: u32,
    pub total_sectors: u64,
    pub volume_label: String,
    pub partition_offset: u64,
}

impl Fat32BootSector {
    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    pub fn fat1_offset(&self) -> u64 {
        self.partition_offset + self.reserved_sectors as u64 * self.bytes_per_sector as u64
    }

    pub fn fat_size_bytes(&self) -> u64 {
        self.sectors_per_fat as u64 * self.bytes_per_sector as u64
    }

    pub fn fat2_offset(&self) -> u64 {
        self.fat1_offset() + self.fat_size_bytes()
    }

    pub fn data_offset(&self) -> u64 {
        self.fat1_offset() + self.num_fats as u64 * self.fat_size_bytes()
    }

    pub fn total_clusters(&self) -> u64 {
        let fat_sectors = self.num_fats as u64 * self.sectors_per_fat as u64;
        let data_sectors = self
            .total_sectors
            .saturating_sub(self.reserved_sectors as u64)
            .saturating_sub(fat_sectors);
        data_sectors / self.sectors_per_cluster as u64
    }

    /// Absolute byte offset of a data cluster. Cluster numbering starts at 2.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + (cluster as u64 - 2) * self.cluster_size() as u64
    }
}

/// Pure classification of a 512-byte buffer: same bytes, same verdict.
pub fn is_fat32_boot_sector(buf: &[u8]) -> bool {
    if buf.len() < 512 || buf[510] != 0x55 || buf[511] != 0xAA {
        return false;
    }

    let bytes_per_sector = u16::from_le_bytes([buf[11], buf[12]]);
    let sectors_per_cluster = buf[13];
    let reserved_sectors = u16::from_le_bytes([buf[14], buf[15]]);
    let num_fats = buf[16];

    let plausible = matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096)
        && sectors_per_cluster.is_power_of_two()
        && sectors_per_cluster <= 128
        && reserved_sectors > 0
        && num_fats > 0;
    if !plausible {
        return false;
    }

    // Explicit filesystem label string.
    if buf[82..90].windows(5).any(|w| w == b"FAT32") {
        return true;
    }

    // FAT32-specific field signature: 16-bit FAT size is zero, 32-bit FAT
    // size and root cluster are set.
    let sectors_per_fat_16 = u16::from_le_bytes([buf[22], buf[23]]);
    let sectors_per_fat_32 = u32::from_le_bytes([buf[36], buf[37], buf[38], buf[39]]);
    let root_cluster = u32::from_le_bytes([buf[44], buf[45], buf[46], buf[47]]);
    if sectors_per_fat_16 == 0 && sectors_per_fat_32 > 0 && root_cluster >= 2 {
        return true;
    }

    // Last resort: the cluster count decides the FAT variant.
    let total_sectors_16 = u16::from_le_bytes([buf[19], buf[20]]) as u64;
    let total_sectors_32 = u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]) as u64;
    let total_sectors = if total_sectors_32 != 0 {
        total_sectors_32
    } else {
        total_sectors_16
    };
    if total_sectors > 0 && sectors_per_fat_32 > 0 {
        let fat_sectors = num_fats as u64 * sectors_per_fat_32 as u64;
        let data_sectors = total_sectors
            .saturating_sub(reserved_sectors as u64)
            .saturating_sub(fat_sectors);
        if data_sectors / sectors_per_cluster as u64 >= 65525 {
            return true;
        }
    }

    false
}

/// Parse a validated boot sector. Returns None when the geometry fails the
/// structural invariants even though the signature checks passed.
pub fn parse_boot_sector(buf: &[u8], partition_offset: u64) -> Option<Fat32BootSector> {
    if !is_fat32_boot_sector(buf) {
        return None;
    }

    let total_sectors_16 = u16::from_le_bytes([buf[19], buf[20]]) as u64;
    let total_sectors_32 = u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]) as u64;

    let boot = Fat32BootSector {
        bytes_per_sector: u16::from_le_bytes([buf[11], buf[12]]),
        sectors_per_cluster: buf[13],
        reserved_sectors: u16::from_le_bytes([buf[14], buf[15]]),
        num_fats: buf[16],
        sectors_per_fat: u32::from_le_bytes([buf[36], buf[37], buf[38], buf[39]]),
        root_cluster: u32::from_le_bytes([buf[44], buf[45], buf[46], buf[47]]),
        total_sectors: if total_sectors_32 != 0 {
            total_sectors_32
        } else {
            total_sectors_16
        },
        volume_label: String::from_utf8_lossy(&buf[71..82]).trim().to_string(),
        partition_offset,
    };

    if boot.sectors_per_fat == 0 || boot.root_cluster < 2 {
        return None;
    }
    if boot.cluster_size() == 0 || boot.cluster_size() > 64 * 1024 {
        return None;
    }
    if boot.data_offset() <= boot.fat1_offset() {
        return None;
    }

    Some(boot)
}

/// Boot-sector discovery: raw offset 0 first, then every FAT-typed MBR
/// partition entry.
pub fn find_boot_sector(source: &mut dyn BlockSource) -> Result<Fat32BootSector> {
    let sector0 = source.read_at(0, SECTOR)?;
    if let Some(boot) = parse_boot_sector(&sector0, 0) {
        info!("FAT32 boot sector at offset 0");
        return Ok(boot);
    }

    if sector0.len() >= 512 && sector0[510] == 0x55 && sector0[511] == 0xAA {
        for i in 0..4 {
            let entry = &sector0[446 + i * 16..446 + (i + 1) * 16];
            let partition_type = entry[4];
            if partition_type == 0 || !FAT_PARTITION_TYPES.contains(&partition_type) {
                continue;
            }
            let start_lba = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]) as u64;
            if start_lba == 0 {
                continue;
            }

            debug!(
                "probing MBR partition {} (type {:#04x}, start LBA {})",
                i + 1,
                partition_type,
                start_lba
            );
            let candidate = source.read_at(start_lba * SECTOR as u64, SECTOR)?;
            if let Some(boot) = parse_boot_sector(&candidate, start_lba * SECTOR as u64) {
                info!("FAT32 boot sector in partition {} at LBA {}", i + 1, start_lba);
                return Ok(boot);
            }
        }
    }

    Err(RecoveryError::NoValidBootSector { fs: "FAT32" })
}

/// Read FAT1 and decode it into 28-bit-masked entries. A short read pads the
/// remainder with the end-of-chain sentinel instead of failing.
pub fn read_fat_table(source: &mut dyn BlockSource, boot: &Fat32BootSector) -> Result<Vec<u32>> {
    let fat_bytes = boot.fat_size_bytes() as usize;
    let data = source.read_at(boot.fat1_offset(), fat_bytes)?;
    if data.len() < fat_bytes {
        warn!(
            "short FAT read: expected {} bytes, got {}",
            fat_bytes,
            data.len()
        );
    }

    let entry_count = fat_bytes / 4;
    let mut fat = Vec::with_capacity(entry_count);
    for chunk in data.chunks_exact(4) {
        fat.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) & FAT32_MASK);
    }
    fat.resize(entry_count, FAT32_EOC);
    Ok(fat)
}

/// Follow a cluster chain through the FAT. Terminates on end-of-chain,
/// out-of-range entries, self-reference and revisitation; the returned
/// sequence stops before any repeated cluster. The flag reports whether a
/// cycle forced the truncation.
pub fn chain_clusters(fat: &[u32], start: u32, limit: usize) -> (Vec<u32>, bool) {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut cluster = start;

    while cluster >= 2 && cluster < FAT32_EOC && (cluster as usize) < fat.len() {
        if !visited.insert(cluster) {
            return (chain, true);
        }
        chain.push(cluster);
        if chain.len() >= limit {
            return (chain, true);
        }

        let next = fat[cluster as usize];
        if next == cluster {
            return (chain, true);
        }
        cluster = next;
    }

    (chain, false)
}

// ---------------------------------------------------------------------------
// Directory entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DirEntryFields {
    attributes: u8,
    start_cluster: u32,
    size: u32,
}

fn entry_fields(slot: &[u8]) -> DirEntryFields {
    let cluster_low = u16::from_le_bytes([slot[26], slot[27]]) as u32;
    let cluster_high = u16::from_le_bytes([slot[20], slot[21]]) as u32;
    DirEntryFields {
        attributes: slot[11],
        start_cluster: (cluster_high << 16) | cluster_low,
        size: u32::from_le_bytes([slot[28], slot[29], slot[30], slot[31]]),
    }
}

/// Checksum over the 11 short-name bytes, stored in every long-name slot.
fn sfn_checksum(slot: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for &b in &slot[..11] {
        sum = (sum >> 1).wrapping_add((sum & 1) << 7).wrapping_add(b);
    }
    sum
}

/// Decode an 8.3 short name. 0x05 in the first byte stands in for a real
/// 0xE5; unprintable bytes become underscores.
fn parse_short_name(slot: &[u8]) -> Option<String> {
    let mut name = String::new();
    for (i, &b) in slot[0..8].iter().enumerate() {
        let b = if i == 0 && b == 0x05 { 0xE5 } else { b };
        if b == 0x20 {
            break;
        }
        if (0x21..=0x7E).contains(&b) {
            name.push(b as char);
        } else {
            name.push('_');
        }
    }
    if name.is_empty() {
        return None;
    }

    let mut ext = String::new();
    for &b in &slot[8..11] {
        if b == 0x20 {
            break;
        }
        if (0x21..=0x7E).contains(&b) {
            ext.push(b as char);
        } else {
            ext.push('_');
        }
    }

    Some(if ext.is_empty() {
        name
    } else {
        format!("{}.{}", name, ext)
    })
}

#[derive(Debug, Clone)]
struct LfnFragment {
    sequence: u8,
    is_last: bool,
    checksum: u8,
    chars: Vec<u16>,
}

fn parse_lfn_slot(slot: &[u8]) -> Option<LfnFragment> {
    if slot[11] & 0x0F != ATTR_LONG_NAME {
        return None;
    }

    let mut chars = Vec::with_capacity(13);
    // 13 UTF-16 units per slot: 5 at offset 1, 6 at 14, 2 at 28.
    for range in [(1usize, 11usize), (14, 26), (28, 32)] {
        for i in (range.0..range.1).step_by(2) {
            let unit = u16::from_le_bytes([slot[i], slot[i + 1]]);
            if unit == 0x0000 || unit == 0xFFFF {
                return Some(LfnFragment {
                    sequence: slot[0] & 0x3F,
                    is_last: slot[0] & 0x40 != 0,
                    checksum: slot[13],
                    chars,
                });
            }
            chars.push(unit);
        }
    }

    Some(LfnFragment {
        sequence: slot[0] & 0x3F,
        is_last: slot[0] & 0x40 != 0,
        checksum: slot[13],
        chars,
    })
}

/// Reconstruct the long name for the short entry at `entry_offset` by walking
/// the preceding slots. On disk the fragment holding the first 13 characters
/// sits immediately before the short entry, so the backward walk collects
/// ordinals 1, 2, ... in order. Any checksum or sequence violation rejects
/// the whole chain and the caller falls back to the 8.3 name.
fn long_name_at(cluster_data: &[u8], entry_offset: usize) -> Option<String> {
    let sfn = &cluster_data[entry_offset..entry_offset + DIR_ENTRY_SIZE];
    let checksum = sfn_checksum(sfn);

    let mut fragments: Vec<LfnFragment> = Vec::new();
    let mut offset = entry_offset;
    let mut expected_seq = 1u8;

    while offset >= DIR_ENTRY_SIZE {
        offset -= DIR_ENTRY_SIZE;
        let slot = &cluster_data[offset..offset + DIR_ENTRY_SIZE];
        let Some(fragment) = parse_lfn_slot(slot) else {
            break;
        };
        if fragment.checksum != checksum || fragment.sequence != expected_seq {
            return None;
        }
        let is_last = fragment.is_last;
        fragments.push(fragment);
        if is_last {
            return assemble_long_name(&fragments);
        }
        expected_seq = expected_seq.checked_add(1)?;
        if expected_seq > 20 {
            return None;
        }
    }

    None
}

/// Long-name reconstruction for a deleted entry. The deletion marker has
/// destroyed every slot's first byte (the sequence/flag byte), so ordinals
/// are assigned by position and validation rests on the preserved checksum
/// byte matching the placeholder-restored short entry.
fn deleted_long_name_at(cluster_data: &[u8], entry_offset: usize) -> Option<String> {
    let mut restored = [0u8; DIR_ENTRY_SIZE];
    restored.copy_from_slice(&cluster_data[entry_offset..entry_offset + DIR_ENTRY_SIZE]);
    restored[0] = b'_';
    let checksum = sfn_checksum(&restored);

    let mut fragments: Vec<LfnFragment> = Vec::new();
    let mut offset = entry_offset;

    while offset >= DIR_ENTRY_SIZE && fragments.len() < 20 {
        offset -= DIR_ENTRY_SIZE;
        let slot = &cluster_data[offset..offset + DIR_ENTRY_SIZE];
        if slot[0] != DELETED_MARKER || slot[11] & 0x0F != ATTR_LONG_NAME {
            break;
        }
        let fragment = parse_lfn_slot(slot)?;
        if fragment.checksum != checksum {
            return None;
        }
        fragments.push(fragment);
    }

    if fragments.is_empty() {
        None
    } else {
        assemble_long_name(&fragments)
    }
}

fn assemble_long_name(fragments: &[LfnFragment]) -> Option<String> {
    let units: Vec<u16> = fragments.iter().flat_map(|f| f.chars.clone()).collect();
    let name = String::from_utf16_lossy(&units);
    let name = sanitize_filename(&name);
    if name == "unnamed" {
        None
    } else {
        Some(name)
    }
}

/// Restore a deleted entry's short name; the first byte is gone for good, so
/// a placeholder stands in.
fn restore_deleted_short_name(slot: &[u8]) -> String {
    let mut restored = [0u8; DIR_ENTRY_SIZE];
    restored.copy_from_slice(&slot[..DIR_ENTRY_SIZE]);
    restored[0] = b'_';
    parse_short_name(&restored).unwrap_or_else(|| {
        let fields = entry_fields(slot);
        format!("deleted_{:08x}", fields.start_cluster)
    })
}

fn extension_of(name: &str) -> String {
    name.rsplit('.')
        .next()
        .filter(|ext| ext.len() <= 10 && *ext != name)
        .unwrap_or("")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Tuning knobs for a FAT32 recovery pass.
#[derive(Clone, Debug)]
pub struct Fat32Options {
    /// Cluster cap for forced contiguous reads of deleted files, so a mangled
    /// size field cannot run the read off the volume.
    pub force_read_limit: u32,
    /// Run the whole-volume orphan-directory cluster pass.
    pub orphan_scan: bool,
    /// Run signature deep scans for deleted entries whose start cluster was
    /// zeroed or whose forced read produced nothing.
    pub deep_scan: bool,
    /// Byte cap for a whole-data-region deep scan.
    pub deep_scan_span: u64,
}

impl Default for Fat32Options {
    fn default() -> Self {
        Fat32Options {
            force_read_limit: 2048,
            orphan_scan: true,
            deep_scan: true,
            deep_scan_span: 1024 * 1024 * 1024,
        }
    }
}

/// Result of one FAT32 recovery pass.
#[derive(Serialize, Deserialize, Debug)]
pub struct Fat32Outcome {
    pub volume_label: String,
    pub records: Vec<RecoveredFileRecord>,
    pub stats: ScanStatistics,
}

/// A deleted entry that could not be recovered by direct cluster reads and
/// is queued for signature deep scanning.
struct DeepScanCandidate {
    name: String,
    start_cluster: u32,
    size: u32,
}

struct Fat32Engine<'a> {
    source: &'a mut dyn BlockSource,
    boot: Fat32BootSector,
    fat: Vec<u32>,
    output_dir: &'a Path,
    options: &'a Fat32Options,
    records: Vec<RecoveredFileRecord>,
    stats: ScanStatistics,
    /// Dedup keys of everything recovered so far: (start byte offset,
    /// declared size).
    seen: HashSet<(u64, u64)>,
    deep_scan_queue: Vec<DeepScanCandidate>,
}

/// Run a full FAT32 recovery against `source`, writing output files under
/// `output_dir`. Only discovery failures propagate; corrupt directory
/// clusters, broken chains and failed writes are counted and skipped.
pub fn recover(
    source: &mut dyn BlockSource,
    output_dir: &Path,
    options: &Fat32Options,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(u64, &str),
) -> Result<Fat32Outcome> {
    let boot = find_boot_sector(source)?;
    info!(
        "FAT32 volume '{}': cluster size {}, {} clusters, root at {}",
        boot.volume_label,
        boot.cluster_size(),
        boot.total_clusters(),
        boot.root_cluster
    );

    let fat = read_fat_table(source, &boot)?;
    let volume_label = boot.volume_label.clone();

    let mut engine = Fat32Engine {
        source,
        boot,
        fat,
        output_dir,
        options,
        records: Vec::new(),
        stats: ScanStatistics::default(),
        seen: HashSet::new(),
        deep_scan_queue: Vec::new(),
    };

    engine.walk_directory_tree(cancel, progress);

    if options.deep_scan && !engine.deep_scan_queue.is_empty() {
        engine.run_deep_scans(cancel, progress);
    }

    if options.orphan_scan {
        engine.scan_orphan_clusters(cancel, progress);
    }

    Ok(Fat32Outcome {
        volume_label,
        records: engine.records,
        stats: engine.stats,
    })
}

impl<'a> Fat32Engine<'a> {
    /// Walk the directory tree from the root cluster with an explicit
    /// worklist. A global visited set guarantees no directory cluster is
    /// processed twice even across cross-linked subtrees.
    fn walk_directory_tree(&mut self, cancel: &CancelToken, progress: &mut dyn FnMut(u64, &str)) {
        let mut worklist: Vec<(u32, PathBuf)> = vec![(self.boot.root_cluster, PathBuf::new())];
        let mut visited_dirs: HashSet<u32> = HashSet::new();
        let mut dirs_done = 0u64;

        while let Some((start_cluster, rel_path)) = worklist.pop() {
            if cancel.is_cancelled() {
                return;
            }

            let mut cluster = start_cluster;
            'chain: while cluster >= 2
                && cluster < FAT32_EOC
                && (cluster as usize) < self.fat.len()
            {
                if !visited_dirs.insert(cluster) {
                    self.stats.chain_cycles_truncated += 1;
                    break;
                }

                let data = match self
                    .source
                    .read_at(self.boot.cluster_offset(cluster), self.boot.cluster_size() as usize)
                {
                    Ok(d) if !d.is_empty() => d,
                    Ok(_) => break,
                    Err(e) => {
                        warn!("unreadable directory cluster {}: {}", cluster, e);
                        self.stats.corrupt_structures_skipped += 1;
                        break;
                    }
                };
                self.stats.clusters_scanned += 1;

                for slot_index in 0..data.len() / DIR_ENTRY_SIZE {
                    let offset = slot_index * DIR_ENTRY_SIZE;
                    let slot = &data[offset..offset + DIR_ENTRY_SIZE];

                    if slot[0] == 0x00 {
                        break 'chain;
                    }
                    if slot[11] & 0x0F == ATTR_LONG_NAME {
                        continue;
                    }

                    if slot[0] == DELETED_MARKER {
                        self.handle_deleted_entry(&data, offset, &rel_path);
                        continue;
                    }

                    if slot[11] & ATTR_VOLUME_ID != 0 {
                        continue;
                    }

                    let fields = entry_fields(slot);
                    let name = long_name_at(&data, offset)
                        .or_else(|| parse_short_name(slot).map(|n| sanitize_filename(&n)));
                    let Some(name) = name else { continue };
                    if name == "." || name == ".." {
                        continue;
                    }

                    if fields.attributes & ATTR_DIRECTORY != 0 {
                        if fields.start_cluster >= 2 {
                            worklist.push((fields.start_cluster, rel_path.join(&name)));
                        } else {
                            debug!("directory {} has invalid start cluster", name);
                            self.stats.corrupt_structures_skipped += 1;
                        }
                    } else if fields.size > 0 {
                        self.recover_live_file(&name, &fields, &rel_path);
                    }
                }

                let next = self.fat[cluster as usize];
                if next == cluster {
                    self.stats.chain_cycles_truncated += 1;
                    break;
                }
                cluster = next;
            }

            dirs_done += 1;
            if dirs_done % 64 == 0 {
                progress(
                    dirs_done,
                    &format!("directory walk: {} files recovered", self.records.len()),
                );
            }
        }
    }

    fn handle_deleted_entry(&mut self, cluster_data: &[u8], offset: usize, rel_path: &Path) {
        let slot = &cluster_data[offset..offset + DIR_ENTRY_SIZE];
        let fields = entry_fields(slot);

        // Deleted subdirectories are not descended into: their chains are as
        // unreliable as their FAT entries.
        if fields.attributes & ATTR_DIRECTORY != 0 {
            return;
        }
        if fields.size == 0 {
            return;
        }

        let name = deleted_long_name_at(cluster_data, offset)
            .unwrap_or_else(|| restore_deleted_short_name(slot));

        if fields.start_cluster < 2 {
            debug!(
                "deleted entry {} has zeroed start cluster, queueing deep scan",
                name
            );
            self.deep_scan_queue.push(DeepScanCandidate {
                name,
                start_cluster: fields.start_cluster,
                size: fields.size,
            });
            return;
        }

        let key = (
            self.boot.cluster_offset(fields.start_cluster),
            fields.size as u64,
        );
        if !self.seen.insert(key) {
            return;
        }

        // The FAT entries for deleted clusters were reset by the delete
        // operation, so the stored size is treated as authoritative and the
        // clusters are read as one contiguous run.
        let data = self.force_read_contiguous(fields.start_cluster, fields.size as u64);
        if data.is_empty() {
            self.seen.remove(&key);
            self.deep_scan_queue.push(DeepScanCandidate {
                name,
                start_cluster: fields.start_cluster,
                size: fields.size,
            });
            return;
        }

        let dir = self.output_dir.join("DELETED_FILES").join(rel_path);
        self.emit_record(&name, &dir, &data, fields.size as u64, Some(fields.start_cluster), true);
    }

    fn recover_live_file(&mut self, name: &str, fields: &DirEntryFields, rel_path: &Path) {
        if fields.start_cluster < 2 {
            // Live entry with a bad start cluster is treated like a deleted
            // one and routed through the deep scan.
            self.deep_scan_queue.push(DeepScanCandidate {
                name: name.to_string(),
                start_cluster: fields.start_cluster,
                size: fields.size,
            });
            return;
        }

        let key = (
            self.boot.cluster_offset(fields.start_cluster),
            fields.size as u64,
        );
        if !self.seen.insert(key) {
            return;
        }

        let (data, cycled) = self.read_chain(fields.start_cluster, fields.size as u64);
        if cycled {
            self.stats.chain_cycles_truncated += 1;
        }
        if data.is_empty() {
            self.seen.remove(&key);
            self.stats.corrupt_structures_skipped += 1;
            return;
        }

        let dir = self.output_dir.join(rel_path);
        self.emit_record(name, &dir, &data, fields.size as u64, Some(fields.start_cluster), false);
    }

    /// FAT chain walk bounded by the declared size, with cycle truncation.
    /// Returns whatever was read; partial content is kept, never discarded.
    fn read_chain(&mut self, start: u32, declared: u64) -> (Vec<u8>, bool) {
        let mut data = Vec::new();
        let mut visited = HashSet::new();
        let mut cluster = start;
        let mut remaining = declared;
        let cluster_size = self.boot.cluster_size() as u64;

        while remaining > 0
            && cluster >= 2
            && cluster < FAT32_EOC
            && (cluster as usize) < self.fat.len()
        {
            if !visited.insert(cluster) {
                return (data, true);
            }

            let want = cluster_size.min(remaining) as usize;
            match self.source.read_at(self.boot.cluster_offset(cluster), want) {
                Ok(chunk) if !chunk.is_empty() => {
                    remaining -= chunk.len() as u64;
                    data.extend_from_slice(&chunk);
                }
                Ok(_) => break,
                Err(e) => {
                    warn!("unreadable cluster {}: {}", cluster, e);
                    break;
                }
            }

            let next = self.fat[cluster as usize];
            if next == cluster {
                return (data, true);
            }
            cluster = next;
        }

        (data, false)
    }

    /// Read consecutive clusters starting at `start`, ignoring the FAT
    /// entirely. Read errors skip to the next cluster rather than aborting,
    /// up to the configured cluster cap.
    fn force_read_contiguous(&mut self, start: u32, declared: u64) -> Vec<u8> {
        let mut data = Vec::new();
        let mut cluster = start;
        let mut remaining = declared;
        let mut clusters_read = 0u32;
        let cluster_size = self.boot.cluster_size() as u64;

        while remaining > 0 && clusters_read < self.options.force_read_limit {
            let want = cluster_size.min(remaining) as usize;
            match self.source.read_at(self.boot.cluster_offset(cluster), want) {
                Ok(chunk) if !chunk.is_empty() => {
                    remaining -= chunk.len() as u64;
                    data.extend_from_slice(&chunk);
                }
                Ok(_) => break,
                Err(e) => {
                    debug!("forced read skipping cluster {}: {}", cluster, e);
                }
            }
            cluster += 1;
            clusters_read += 1;
        }

        data
    }

    /// Signature deep scan for entries whose direct recovery failed: search
    /// a window around the predicted cluster position first, then fall back
    /// to a capped scan of the whole data region.
    fn run_deep_scans(&mut self, cancel: &CancelToken, progress: &mut dyn FnMut(u64, &str)) {
        let lookup = build_lookup();
        let queue = std::mem::take(&mut self.deep_scan_queue);
        info!("deep scanning {} unrecoverable deleted entries", queue.len());

        for (index, candidate) in queue.iter().enumerate() {
            if cancel.is_cancelled() {
                return;
            }
            progress(
                index as u64,
                &format!("deep scan: {}", candidate.name),
            );

            let found = if candidate.start_cluster >= 2 {
                let predicted = self.boot.cluster_offset(candidate.start_cluster);
                let window = (self.boot.cluster_size() as u64 * 10)
                    .max(candidate.size as u64 * 2);
                let start = predicted.saturating_sub(window).max(self.boot.data_offset());
                self.scan_signatures_in_range(candidate, &lookup, start, predicted + window)
                    || self.global_signature_scan(candidate, &lookup)
            } else {
                self.global_signature_scan(candidate, &lookup)
            };

            if found {
                self.stats.deep_scan_rescues += 1;
            } else {
                debug!("deep scan found nothing for {}", candidate.name);
                self.stats.incomplete_recoveries += 1;
            }
        }
    }

    fn global_signature_scan(
        &mut self,
        candidate: &DeepScanCandidate,
        lookup: &HashMap<u16, Vec<FileSignature>>,
    ) -> bool {
        let start = self.boot.data_offset();
        let end = (start + self.options.deep_scan_span).min(self.source.size());
        self.scan_signatures_in_range(candidate, lookup, start, end)
    }

    /// Scan `[start, end)` in 64 KiB chunks for the first signature match and
    /// recover the candidate from it.
    fn scan_signatures_in_range(
        &mut self,
        candidate: &DeepScanCandidate,
        lookup: &HashMap<u16, Vec<FileSignature>>,
        start: u64,
        end: u64,
    ) -> bool {
        const CHUNK: usize = 64 * 1024;
        let mut pos = start;

        while pos < end {
            let want = CHUNK.min((end - pos) as usize);
            let data = match self.source.read_at(pos, want) {
                Ok(d) if !d.is_empty() => d,
                _ => return false,
            };

            for i in 0..data.len().saturating_sub(1) {
                let key = u16::from_le_bytes([data[i], data[i + 1]]);
                let Some(candidates) = lookup.get(&key) else {
                    continue;
                };
                for sig in candidates {
                    if i + sig.header.len() > data.len()
                        || data[i..i + sig.header.len()] != *sig.header
                    {
                        continue;
                    }
                    if self.recover_at_signature(candidate, sig, pos + i as u64) {
                        return true;
                    }
                }
            }

            pos += CHUNK as u64;
        }

        false
    }

    fn recover_at_signature(
        &mut self,
        candidate: &DeepScanCandidate,
        sig: &FileSignature,
        offset: u64,
    ) -> bool {
        let max_read = (candidate.size as u64 * 2).min(10 * 1024 * 1024) as usize;
        let Ok(probe) = self.source.read_at(offset, max_read.max(1024)) else {
            return false;
        };
        if probe.len() < 100 {
            return false;
        }

        let carve_opts = CarveOptions {
            cluster_size: self.boot.cluster_size(),
            ..CarveOptions::default()
        };
        let estimated = estimate_size(sig, &probe, &carve_opts) as usize;
        let data = &probe[..estimated.min(probe.len())];

        let stem = candidate
            .name
            .rsplit_once('.')
            .map(|(s, _)| s)
            .unwrap_or(candidate.name.as_str());
        let filename = format!("{}_at_{:08x}.{}", stem, offset, sig.extension);
        let dir = self.output_dir.join("DEEP_SCAN");

        let key = (offset, candidate.size as u64);
        if !self.seen.insert(key) {
            return false;
        }

        match save_recovered_file(&dir, &filename, data) {
            Some(path) => {
                let recovered = data.len() as u64;
                let declared = candidate.size as u64;
                self.records.push(RecoveredFileRecord {
                    name: filename,
                    output_path: relative_display(self.output_dir, &path),
                    source: SourceEngine::Fat32,
                    start_offset: offset,
                    start_cluster: None,
                    declared_size: declared,
                    recovered_bytes: recovered,
                    completeness: completeness(recovered, declared),
                    is_deleted: true,
                    cluster_aligned: offset % self.boot.cluster_size() as u64 == 0,
                    category: categorize_extension(sig.extension).to_string(),
                    description: format!("{} (deep scan)", sig.name),
                });
                true
            }
            None => {
                self.seen.remove(&key);
                self.stats.write_failures += 1;
                false
            }
        }
    }

    /// Brute-force pass over every data cluster looking for directory blocks
    /// unreachable through normal parent links. Clusters are processed
    /// independently, so the pass is bounded by the volume size alone.
    fn scan_orphan_clusters(&mut self, cancel: &CancelToken, progress: &mut dyn FnMut(u64, &str)) {
        let total = self.boot.total_clusters();
        info!("orphan scan over {} data clusters", total);
        let mut found = 0u64;

        for index in 0..total {
            if cancel.is_cancelled() {
                return;
            }
            let cluster = index as u32 + 2;

            let data = match self
                .source
                .read_at(self.boot.cluster_offset(cluster), self.boot.cluster_size() as usize)
            {
                Ok(d) if d.len() == self.boot.cluster_size() as usize => d,
                Ok(_) => break,
                Err(_) => {
                    self.stats.corrupt_structures_skipped += 1;
                    continue;
                }
            };
            self.stats.clusters_scanned += 1;

            if !is_likely_directory_cluster(&data) {
                if index % 1024 == 0 {
                    progress(index, &format!("orphan scan: {} extra files", found));
                }
                continue;
            }

            for slot_index in 0..data.len() / DIR_ENTRY_SIZE {
                let offset = slot_index * DIR_ENTRY_SIZE;
                let slot = &data[offset..offset + DIR_ENTRY_SIZE];
                if slot[0] == 0x00 {
                    break;
                }
                if !is_plausible_orphan_entry(slot) {
                    continue;
                }

                let fields = entry_fields(slot);
                if fields.attributes & ATTR_DIRECTORY != 0 || fields.size == 0 {
                    continue;
                }
                if fields.start_cluster < 2 {
                    continue;
                }

                let key = (
                    self.boot.cluster_offset(fields.start_cluster),
                    fields.size as u64,
                );
                if !self.seen.insert(key) {
                    continue;
                }

                let is_deleted = slot[0] == DELETED_MARKER;
                let name = if is_deleted {
                    deleted_long_name_at(&data, offset)
                        .unwrap_or_else(|| restore_deleted_short_name(slot))
                } else {
                    match long_name_at(&data, offset)
                        .or_else(|| parse_short_name(slot).map(|n| sanitize_filename(&n)))
                    {
                        Some(n) => n,
                        None => {
                            self.seen.remove(&key);
                            continue;
                        }
                    }
                };

                let content = self.force_read_contiguous(fields.start_cluster, fields.size as u64);
                if content.is_empty() {
                    self.seen.remove(&key);
                    continue;
                }

                let dir = self.output_dir.join("ORPHAN_SCAN");
                self.emit_record(
                    &name,
                    &dir,
                    &content,
                    fields.size as u64,
                    Some(fields.start_cluster),
                    is_deleted,
                );
                found += 1;
            }

            if index % 1024 == 0 {
                progress(index, &format!("orphan scan: {} extra files", found));
            }
        }

        info!("orphan scan found {} additional files", found);
    }

    fn emit_record(
        &mut self,
        name: &str,
        dir: &Path,
        data: &[u8],
        declared: u64,
        start_cluster: Option<u32>,
        is_deleted: bool,
    ) {
        let filename = sanitize_filename(name);
        match save_recovered_file(dir, &filename, data) {
            Some(path) => {
                let recovered = data.len() as u64;
                if recovered < declared {
                    self.stats.incomplete_recoveries += 1;
                }
                let ext = extension_of(&filename);
                let start_offset = start_cluster
                    .map(|c| self.boot.cluster_offset(c))
                    .unwrap_or_default();
                self.records.push(RecoveredFileRecord {
                    name: filename,
                    output_path: relative_display(self.output_dir, &path),
                    source: SourceEngine::Fat32,
                    start_offset,
                    start_cluster: start_cluster.map(|c| c as u64),
                    declared_size: declared,
                    recovered_bytes: recovered,
                    completeness: completeness(recovered, declared),
                    is_deleted,
                    cluster_aligned: start_offset % self.boot.cluster_size() as u64 == 0,
                    category: categorize_extension(&ext).to_string(),
                    description: describe_extension(&ext),
                });
            }
            None => {
                self.stats.write_failures += 1;
            }
        }
    }
}

/// Heuristic: does this cluster look like a directory block? At least two of
/// the first sixteen slots must parse as plausible entries.
fn is_likely_directory_cluster(data: &[u8]) -> bool {
    let mut plausible = 0;
    for slot_index in 0..(data.len().min(512) / DIR_ENTRY_SIZE) {
        let slot = &data[slot_index * DIR_ENTRY_SIZE..(slot_index + 1) * DIR_ENTRY_SIZE];
        if slot[0] == 0x00 {
            break;
        }
        let attr = slot[11];
        if slot[0] >= 0x20 || slot[0] == DELETED_MARKER {
            if attr & 0x0F == ATTR_LONG_NAME || attr & 0xC0 == 0 {
                plausible += 1;
            }
        }
    }
    plausible >= 2
}

fn is_plausible_orphan_entry(slot: &[u8]) -> bool {
    if slot[0] == 0x00 || slot[11] & 0x0F == ATTR_LONG_NAME {
        return false;
    }
    // The reserved byte is always zero in real entries.
    if slot[12] != 0 {
        return false;
    }

    let fields = entry_fields(slot);
    if fields.size > 0 && fields.start_cluster == 0 {
        return true; // deleted entry whose cluster high word was zeroed
    }
    if fields.size == 0 && fields.attributes & ATTR_DIRECTORY != 0 {
        return true;
    }
    fields.size > 0 && fields.start_cluster >= 2
}

fn completeness(recovered: u64, declared: u64) -> f32 {
    if declared == 0 {
        100.0
    } else {
        recovered as f32 * 100.0 / declared as f32
    }
}

fn relative_display(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}

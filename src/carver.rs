//! Raw signature carving engine
//! Walks the device in fixed windows, matches catalog headers, estimates each
//! candidate's extent from format structure and extracts it. Used standalone
//! when filesystem metadata is unusable, and by the FAT32 engine's deep scan.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::{debug, info};

use crate::block_source::{save_recovered_file, BlockSource};
use crate::error::Result;
use crate::signatures::{max_header_len, FileSignature};
use crate::types::{CancelToken, RecoveredFileRecord, ScanStatistics, SourceEngine};

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// Tuning knobs for a carving pass.
#[derive(Clone, Debug)]
pub struct CarveOptions {
    /// Bytes read per scan window. Windows overlap by one byte less than the
    /// longest catalog header, so a header straddling a boundary is still
    /// seen whole in the following window.
    pub window_size: usize,
    /// Estimated files below this are discarded as noise.
    pub min_file_size: u64,
    /// Hard ceiling on a single extraction, bounding memory use.
    pub max_file_size: u64,
    /// Cluster size of the scanned volume, for alignment reporting only.
    pub cluster_size: u32,
}

impl Default for CarveOptions {
    fn default() -> Self {
        CarveOptions {
            window_size: 1024 * 1024,
            min_file_size: KB,
            max_file_size: 100 * MB,
            cluster_size: 4096,
        }
    }
}

/// Scan direction. Both directions discover the same files with identical
/// content; only the order of discovery differs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Reverse,
}

impl Default for ScanDirection {
    fn default() -> Self {
        ScanDirection::Forward
    }
}

/// Scan `source` between `start` and `end` (exclusive) for catalog headers
/// and write every extracted file under `output_dir/<Category>/`.
pub fn carve(
    source: &mut dyn BlockSource,
    output_dir: &Path,
    lookup: &HashMap<u16, Vec<FileSignature>>,
    options: &CarveOptions,
    direction: ScanDirection,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(u64, &str),
) -> Result<(Vec<RecoveredFileRecord>, ScanStatistics)> {
    let end = source.size();
    carve_range(source, output_dir, lookup, options, direction, 0, end, cancel, progress)
}

/// Range-limited carving pass. The FAT32 deep scan uses this to search a
/// narrow byte span around a deleted file's predicted cluster position.
#[allow(clippy::too_many_arguments)]
pub fn carve_range(
    source: &mut dyn BlockSource,
    output_dir: &Path,
    lookup: &HashMap<u16, Vec<FileSignature>>,
    options: &CarveOptions,
    direction: ScanDirection,
    start: u64,
    end: u64,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(u64, &str),
) -> Result<(Vec<RecoveredFileRecord>, ScanStatistics)> {
    let mut records = Vec::new();
    let mut stats = ScanStatistics::default();

    let end = end.min(source.size());
    if start >= end {
        return Ok((records, stats));
    }

    let overlap = max_header_len() - 1;
    let step = (options.window_size - overlap).max(1) as u64;

    // Identical window coverage regardless of direction, so both directions
    // produce the same record set.
    let mut window_starts = Vec::new();
    let mut pos = start;
    loop {
        window_starts.push(pos);
        if pos + options.window_size as u64 >= end {
            break;
        }
        pos += step;
    }
    if direction == ScanDirection::Reverse {
        window_starts.reverse();
    }

    let mut found_offsets: HashSet<u64> = HashSet::new();

    for (window_index, &window_start) in window_starts.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("carving cancelled after {} windows", window_index);
            break;
        }

        let want = options.window_size.min((end - window_start) as usize);
        let data = source.read_at(window_start, want)?;
        if data.is_empty() {
            continue;
        }
        stats.bytes_scanned += data.len() as u64;

        for hit in scan_window(&data, lookup) {
            let global = window_start + hit.offset as u64;
            if !found_offsets.insert(global) {
                continue;
            }

            match extract_file(source, global, &hit.signature, options) {
                Some((declared, file_data)) => {
                    stats.total_hits += 1;
                    let aligned = global % options.cluster_size as u64 == 0;
                    if aligned {
                        stats.aligned_hits += 1;
                    }

                    let filename =
                        format!("carved_{:012x}.{}", global, hit.signature.extension);
                    let category_dir = output_dir.join(hit.signature.category);
                    match save_recovered_file(&category_dir, &filename, &file_data) {
                        Some(path) => {
                            let recovered = file_data.len() as u64;
                            records.push(RecoveredFileRecord {
                                name: filename,
                                output_path: relative_display(output_dir, &path),
                                source: SourceEngine::Signature,
                                start_offset: global,
                                start_cluster: None,
                                declared_size: declared,
                                recovered_bytes: recovered,
                                completeness: if declared == 0 {
                                    100.0
                                } else {
                                    recovered as f32 * 100.0 / declared as f32
                                },
                                is_deleted: false,
                                cluster_aligned: aligned,
                                category: hit.signature.category.to_string(),
                                description: format!(
                                    "{} (header {})",
                                    hit.signature.name,
                                    hex::encode(&file_data[..file_data.len().min(8)])
                                ),
                            });
                        }
                        None => stats.write_failures += 1,
                    }
                }
                None => debug!(
                    "discarded {} candidate at offset {:#x}",
                    hit.signature.extension, global
                ),
            }
        }

        // Every ~4 MiB is frequent enough for a status line.
        if window_index % 4 == 0 {
            progress(
                stats.bytes_scanned,
                &format!("carving: {} files found", records.len()),
            );
        }
    }

    Ok((records, stats))
}

struct SignatureHit {
    offset: usize,
    signature: FileSignature,
}

/// Find every catalog header in one window. The two-byte prefix lookup keeps
/// the inner loop to a single map probe per position.
fn scan_window(data: &[u8], lookup: &HashMap<u16, Vec<FileSignature>>) -> Vec<SignatureHit> {
    let mut hits = Vec::new();
    if data.len() < 2 {
        return hits;
    }

    for i in 0..data.len() - 1 {
        let key = u16::from_le_bytes([data[i], data[i + 1]]);
        let Some(candidates) = lookup.get(&key) else {
            continue;
        };
        for sig in candidates {
            if i + sig.header.len() > data.len() {
                continue;
            }
            if data[i..i + sig.header.len()] != *sig.header {
                continue;
            }
            if validate_header(sig, &data[i..]) < 75 {
                continue;
            }
            hits.push(SignatureHit {
                offset: i,
                signature: sig.clone(),
            });
        }
    }

    // MP4/MOV is found through its ftyp box rather than a fixed prefix.
    for i in 4..data.len().saturating_sub(8) {
        if &data[i..i + 4] != b"ftyp" {
            continue;
        }
        let box_size = u32::from_be_bytes([data[i - 4], data[i - 3], data[i - 2], data[i - 1]]);
        if !(8..=64).contains(&box_size) {
            continue;
        }
        let brand = &data[i + 4..i + 8];
        let known_brand = [
            b"isom", b"mp41", b"mp42", b"M4V ", b"qt  ", b"MSNV", b"3gp4", b"3gp5", b"avc1",
            b"M4A ", b"dash",
        ]
        .iter()
        .any(|&b| brand == b);
        if known_brand {
            hits.push(SignatureHit {
                offset: i - 4,
                signature: FileSignature {
                    name: "MP4 Video",
                    extension: "mp4",
                    header: b"ftyp",
                    trailer: None,
                    category: "Videos",
                    default_size: 50 * MB,
                },
            });
        }
    }

    hits
}

/// Cheap structural checks on top of the header match, 0-100.
/// Anything below 75 is treated as a false positive.
fn validate_header(sig: &FileSignature, data: &[u8]) -> u8 {
    match sig.extension {
        "jpg" => {
            if data.len() > 10 && (&data[6..10] == b"JFIF" || &data[6..10] == b"Exif") {
                98
            } else if data.len() > 3 && data[2] == 0xFF {
                90
            } else {
                40
            }
        }
        "png" => {
            if data.len() > 16 && &data[12..16] == b"IHDR" {
                98
            } else {
                50
            }
        }
        "pdf" => {
            if data.len() > 8 && data[4] == b'-' && data[5].is_ascii_digit() {
                95
            } else {
                60
            }
        }
        "zip" => {
            if data.len() > 30 {
                let name_len = u16::from_le_bytes([data[26], data[27]]);
                if name_len > 0 && name_len < 256 {
                    90
                } else {
                    60
                }
            } else {
                75
            }
        }
        "exe" => {
            if data.len() > 64 {
                let pe_offset =
                    u32::from_le_bytes([data[60], data[61], data[62], data[63]]) as usize;
                if pe_offset + 4 <= data.len() && &data[pe_offset..pe_offset + 4] == b"PE\0\0" {
                    95
                } else {
                    // MZ alone matches far too much; require the PE header.
                    40
                }
            } else {
                40
            }
        }
        _ => 80,
    }
}

/// Read the candidate's bytes and decide its extent.
/// Returns (declared size, extracted bytes), or None for discarded noise.
fn extract_file(
    source: &mut dyn BlockSource,
    offset: u64,
    sig: &FileSignature,
    options: &CarveOptions,
) -> Option<(u64, Vec<u8>)> {
    let probe_len = sig
        .default_size
        .max(64 * KB)
        .min(options.max_file_size) as usize;
    let probe = source.read_at(offset, probe_len).ok()?;
    if probe.is_empty() {
        return None;
    }

    let estimated = estimate_size(sig, &probe, options);
    if estimated < options.min_file_size {
        return None;
    }

    let take = (estimated as usize).min(probe.len());
    Some((estimated, probe[..take].to_vec()))
}

/// Format-aware size estimation: find the trailer where the format defines
/// one, otherwise fall back to the catalog's default ceiling, clamped to the
/// configured bounds.
pub fn estimate_size(sig: &FileSignature, data: &[u8], options: &CarveOptions) -> u64 {
    let found = match sig.extension {
        "jpg" => find(data, &[0xFF, 0xD9], sig.header.len()).map(|p| p + 2),
        "png" => find(data, &[0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82], 8).map(|p| p + 8),
        "gif" => find(data, &[0x00, 0x3B], sig.header.len()).map(|p| p + 2),
        // PDF and ZIP both legitimately contain earlier copies of their end
        // markers, so the last occurrence wins.
        "pdf" => rfind(data, b"%%EOF").map(|p| p + 5),
        "zip" => rfind(data, &[0x50, 0x4B, 0x05, 0x06]).and_then(|p| {
            if p + 22 <= data.len() {
                let comment_len = u16::from_le_bytes([data[p + 20], data[p + 21]]) as usize;
                Some(p + 22 + comment_len)
            } else {
                None
            }
        }),
        "bmp" => {
            if data.len() > 6 {
                let size = u32::from_le_bytes([data[2], data[3], data[4], data[5]]) as u64;
                if size > 0 && size <= sig.default_size {
                    Some(size as usize)
                } else {
                    None
                }
            } else {
                None
            }
        }
        "mp4" => estimate_mp4_size(data),
        _ => sig
            .trailer
            .and_then(|t| find(data, t, sig.header.len()))
            .map(|p| p + sig.trailer.map(|t| t.len()).unwrap_or(0)),
    };

    match found {
        Some(size) => (size as u64).min(options.max_file_size),
        None => sig
            .default_size
            .clamp(options.min_file_size, options.max_file_size),
    }
}

/// Walk MP4 atoms from the start of the buffer; the end of the last valid
/// atom is the file size.
fn estimate_mp4_size(data: &[u8]) -> Option<usize> {
    let mut offset = 0usize;
    let mut last_end = 0usize;

    while offset + 8 <= data.len() {
        let atom_size = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as u64;

        let actual = if atom_size == 1 && offset + 16 <= data.len() {
            u64::from_be_bytes([
                data[offset + 8],
                data[offset + 9],
                data[offset + 10],
                data[offset + 11],
                data[offset + 12],
                data[offset + 13],
                data[offset + 14],
                data[offset + 15],
            ])
        } else {
            atom_size
        };

        if actual < 8 || actual > 50 * 1024 * MB {
            break;
        }
        last_end = offset + actual as usize;
        offset = last_end;
    }

    if last_end > 0 {
        Some(last_end)
    } else {
        None
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

fn relative_display(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::build_lookup;

    fn jpeg_sig() -> FileSignature {
        crate::signatures::catalog()
            .into_iter()
            .find(|s| s.extension == "jpg")
            .unwrap()
    }

    #[test]
    fn test_jpeg_trailer_estimation() {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0];
        data.extend_from_slice(&[0u8; 100]);
        data.extend_from_slice(&[0xFF, 0xD9]);
        data.extend_from_slice(&[0u8; 50]);

        let size = estimate_size(&jpeg_sig(), &data, &CarveOptions::default());
        assert_eq!(size, 106);
    }

    #[test]
    fn test_jpeg_without_trailer_falls_back_clamped() {
        let opts = CarveOptions {
            max_file_size: 1024 * 1024,
            ..CarveOptions::default()
        };
        let data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        let size = estimate_size(&jpeg_sig(), &data, &opts);
        // Catalog default is 2 MiB, clamped to the configured 1 MiB maximum.
        assert_eq!(size, 1024 * 1024);
    }

    #[test]
    fn test_pdf_uses_last_eof() {
        let sig = crate::signatures::catalog()
            .into_iter()
            .find(|s| s.extension == "pdf")
            .unwrap();
        let mut data = b"%PDF-1.4 body %%EOF more ".to_vec();
        data.extend_from_slice(b"%%EOF");
        let size = estimate_size(&sig, &data, &CarveOptions::default());
        assert_eq!(size, data.len() as u64);
    }

    #[test]
    fn test_zip_eocd_with_comment() {
        let sig = crate::signatures::catalog()
            .into_iter()
            .find(|s| s.extension == "zip")
            .unwrap();
        let mut data = vec![0x50, 0x4B, 0x03, 0x04];
        data.extend_from_slice(&[0u8; 60]);
        let eocd_at = data.len();
        data.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06]);
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(&4u16.to_le_bytes()); // comment length
        data.extend_from_slice(b"done");
        let size = estimate_size(&sig, &data, &CarveOptions::default());
        assert_eq!(size as usize, eocd_at + 22 + 4);
    }

    #[test]
    fn test_validate_rejects_bare_mz() {
        let sig = crate::signatures::catalog()
            .into_iter()
            .find(|s| s.extension == "exe")
            .unwrap();
        let data = vec![0x4D, 0x5A, 0x00, 0x00];
        assert!(validate_header(&sig, &data) < 75);
    }

    #[test]
    fn test_scan_window_finds_embedded_headers() {
        let lookup = build_lookup();
        let mut data = vec![0u8; 256];
        data.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]);
        data.extend_from_slice(b"JFIF");
        data.extend_from_slice(&[0u8; 256]);

        let hits = scan_window(&data, &lookup);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].offset, 256);
        assert_eq!(hits[0].signature.extension, "jpg");
    }

    use crate::block_source::MemBlockSource;
    use crate::types::CancelToken;

    fn fake_jpeg(payload_len: usize) -> Vec<u8> {
        let mut file = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        file.extend_from_slice(b"JFIF");
        file.extend((0..payload_len).map(|i| (i % 251) as u8));
        file.extend_from_slice(&[0xFF, 0xD9]);
        file
    }

    fn fake_png(payload_len: usize) -> Vec<u8> {
        let mut file = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        file.extend_from_slice(&[0x00, 0x00, 0x00, 0x0D]);
        file.extend_from_slice(b"IHDR");
        file.extend((0..payload_len).map(|i| (i % 17 + 1) as u8));
        file.extend_from_slice(&[0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82]);
        file
    }

    /// Several embedded files, one deliberately straddling a window
    /// boundary: forward and reverse scans must produce identical records.
    #[test]
    fn test_direction_symmetry() {
        let window = 64 * 1024;
        let mut image = vec![0u8; 4 * window];
        let placements: &[(usize, Vec<u8>)] = &[
            (1000, fake_jpeg(3000)),
            (window - 3, fake_jpeg(2000)), // header straddles window 0/1
            (2 * window + 500, fake_png(4000)),
            (3 * window + 9000, fake_jpeg(1500)),
        ];
        for (offset, file) in placements {
            image[*offset..offset + file.len()].copy_from_slice(file);
        }

        let options = CarveOptions {
            window_size: window,
            min_file_size: 16,
            ..CarveOptions::default()
        };
        let lookup = build_lookup();
        let cancel = CancelToken::new();

        let forward_dir = tempfile::tempdir().unwrap();
        let mut forward_src = MemBlockSource::new(image.clone());
        let (mut forward, _) = carve(
            &mut forward_src,
            forward_dir.path(),
            &lookup,
            &options,
            ScanDirection::Forward,
            &cancel,
            &mut |_, _| {},
        )
        .unwrap();

        let reverse_dir = tempfile::tempdir().unwrap();
        let mut reverse_src = MemBlockSource::new(image);
        let (mut reverse, _) = carve(
            &mut reverse_src,
            reverse_dir.path(),
            &lookup,
            &options,
            ScanDirection::Reverse,
            &cancel,
            &mut |_, _| {},
        )
        .unwrap();

        assert_eq!(forward.len(), placements.len());
        forward.sort_by_key(|r| r.start_offset);
        reverse.sort_by_key(|r| r.start_offset);

        for (f, r) in forward.iter().zip(reverse.iter()) {
            assert_eq!(f.name, r.name);
            assert_eq!(f.start_offset, r.start_offset);
            assert_eq!(f.declared_size, r.declared_size);
            assert_eq!(f.recovered_bytes, r.recovered_bytes);

            let forward_bytes = std::fs::read(forward_dir.path().join(&f.output_path)).unwrap();
            let reverse_bytes = std::fs::read(reverse_dir.path().join(&r.output_path)).unwrap();
            assert_eq!(forward_bytes, reverse_bytes);
        }
    }

    /// A bare header with no trailer anywhere must fall back to the clamped
    /// catalog default instead of failing.
    #[test]
    fn test_trailerless_jpeg_falls_back() {
        let mut image = vec![0u8; 8192];
        image[100..110].copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F']);

        let options = CarveOptions {
            window_size: 8192,
            max_file_size: 64 * 1024,
            ..CarveOptions::default()
        };
        let out = tempfile::tempdir().unwrap();
        let mut source = MemBlockSource::new(image);
        let (records, stats) = carve(
            &mut source,
            out.path(),
            &build_lookup(),
            &options,
            ScanDirection::Forward,
            &CancelToken::new(),
            &mut |_, _| {},
        )
        .unwrap();

        assert_eq!(records.len(), 1);
        // Catalog default (2 MiB) clamped to the configured maximum.
        assert_eq!(records[0].declared_size, 64 * 1024);
        assert_eq!(stats.total_hits, 1);
    }

    #[test]
    fn test_cancellation_stops_scan() {
        let image = vec![0u8; 1024 * 1024];
        let cancel = CancelToken::new();
        cancel.cancel();

        let out = tempfile::tempdir().unwrap();
        let mut source = MemBlockSource::new(image);
        let (records, stats) = carve(
            &mut source,
            out.path(),
            &build_lookup(),
            &CarveOptions::default(),
            ScanDirection::Forward,
            &cancel,
            &mut |_, _| {},
        )
        .unwrap();
        assert!(records.is_empty());
        assert_eq!(stats.bytes_scanned, 0);
    }
}

//! Static file-signature catalog
//! Maps short byte headers to recovery metadata. The catalog is pure static
//! data; nothing in the carver depends on how many entries it holds, so new
//! formats are added by appending an entry here.

use std::collections::HashMap;

/// One known file format.
#[derive(Clone, Debug)]
pub struct FileSignature {
    pub name: &'static str,
    pub extension: &'static str,
    pub header: &'static [u8],
    pub trailer: Option<&'static [u8]>,
    pub category: &'static str,
    /// Size ceiling used when content-aware estimation finds no trailer.
    pub default_size: u64,
}

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// The full signature catalog.
pub fn catalog() -> Vec<FileSignature> {
    vec![
        // Images
        FileSignature {
            name: "JPEG Image",
            extension: "jpg",
            header: &[0xFF, 0xD8, 0xFF],
            trailer: Some(&[0xFF, 0xD9]),
            category: "Images",
            default_size: 2 * MB,
        },
        FileSignature {
            name: "PNG Image",
            extension: "png",
            header: &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
            trailer: Some(&[0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82]),
            category: "Images",
            default_size: 1 * MB,
        },
        FileSignature {
            name: "GIF Image",
            extension: "gif",
            header: &[0x47, 0x49, 0x46, 0x38],
            trailer: Some(&[0x00, 0x3B]),
            category: "Images",
            default_size: 512 * KB,
        },
        FileSignature {
            name: "BMP Image",
            extension: "bmp",
            header: &[0x42, 0x4D],
            trailer: None,
            category: "Images",
            default_size: 5 * MB,
        },
        FileSignature {
            name: "TIFF Image",
            extension: "tiff",
            header: &[0x49, 0x49, 0x2A, 0x00],
            trailer: None,
            category: "Images",
            default_size: 10 * MB,
        },
        FileSignature {
            name: "Photoshop Document",
            extension: "psd",
            header: &[0x38, 0x42, 0x50, 0x53],
            trailer: None,
            category: "Images",
            default_size: 20 * MB,
        },
        // Documents
        FileSignature {
            name: "PDF Document",
            extension: "pdf",
            header: &[0x25, 0x50, 0x44, 0x46],
            trailer: Some(&[0x25, 0x25, 0x45, 0x4F, 0x46]),
            category: "Documents",
            default_size: 10 * MB,
        },
        FileSignature {
            name: "Microsoft Office Document",
            extension: "doc",
            header: &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1],
            trailer: None,
            category: "Documents",
            default_size: 5 * MB,
        },
        FileSignature {
            name: "Rich Text Document",
            extension: "rtf",
            header: &[0x7B, 0x5C, 0x72, 0x74, 0x66],
            trailer: None,
            category: "Documents",
            default_size: 2 * MB,
        },
        FileSignature {
            name: "XML Document",
            extension: "xml",
            header: &[0x3C, 0x3F, 0x78, 0x6D, 0x6C],
            trailer: None,
            category: "Documents",
            default_size: 4 * MB,
        },
        // Archives. ZIP also covers the Office Open XML family; the carver
        // cannot tell them apart without reading the central directory.
        FileSignature {
            name: "ZIP Archive",
            extension: "zip",
            header: &[0x50, 0x4B, 0x03, 0x04],
            trailer: Some(&[0x50, 0x4B, 0x05, 0x06]),
            category: "Archives",
            default_size: 50 * MB,
        },
        FileSignature {
            name: "RAR Archive",
            extension: "rar",
            header: &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07],
            trailer: None,
            category: "Archives",
            default_size: 50 * MB,
        },
        FileSignature {
            name: "7-Zip Archive",
            extension: "7z",
            header: &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C],
            trailer: None,
            category: "Archives",
            default_size: 50 * MB,
        },
        FileSignature {
            name: "GZIP Archive",
            extension: "gz",
            header: &[0x1F, 0x8B, 0x08],
            trailer: None,
            category: "Archives",
            default_size: 20 * MB,
        },
        // Audio
        FileSignature {
            name: "MP3 Audio (ID3)",
            extension: "mp3",
            header: &[0x49, 0x44, 0x33],
            trailer: None,
            category: "Audio",
            default_size: 10 * MB,
        },
        FileSignature {
            name: "FLAC Audio",
            extension: "flac",
            header: &[0x66, 0x4C, 0x61, 0x43],
            trailer: None,
            category: "Audio",
            default_size: 40 * MB,
        },
        FileSignature {
            name: "OGG Audio",
            extension: "ogg",
            header: &[0x4F, 0x67, 0x67, 0x53],
            trailer: None,
            category: "Audio",
            default_size: 20 * MB,
        },
        // Video
        FileSignature {
            name: "Matroska Video",
            extension: "mkv",
            header: &[0x1A, 0x45, 0xDF, 0xA3],
            trailer: None,
            category: "Videos",
            default_size: 100 * MB,
        },
        FileSignature {
            name: "Flash Video",
            extension: "flv",
            header: &[0x46, 0x4C, 0x56, 0x01],
            trailer: None,
            category: "Videos",
            default_size: 100 * MB,
        },
        FileSignature {
            name: "Windows Media Video",
            extension: "wmv",
            header: &[0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11],
            trailer: None,
            category: "Videos",
            default_size: 100 * MB,
        },
        // Executables and databases
        FileSignature {
            name: "Windows Executable",
            extension: "exe",
            header: &[0x4D, 0x5A],
            trailer: None,
            category: "Executables",
            default_size: 20 * MB,
        },
        FileSignature {
            name: "ELF Executable",
            extension: "elf",
            header: &[0x7F, 0x45, 0x4C, 0x46],
            trailer: None,
            category: "Executables",
            default_size: 20 * MB,
        },
        FileSignature {
            name: "SQLite Database",
            extension: "sqlite",
            header: &[0x53, 0x51, 0x4C, 0x69, 0x74, 0x65],
            trailer: None,
            category: "Databases",
            default_size: 50 * MB,
        },
    ]
}

/// Lookup keyed by the first two header bytes, so the scan loop does one
/// cheap map probe per position instead of testing every signature.
pub fn build_lookup() -> HashMap<u16, Vec<FileSignature>> {
    let mut lookup: HashMap<u16, Vec<FileSignature>> = HashMap::new();
    for sig in catalog() {
        let key = u16::from_le_bytes([sig.header[0], sig.header[1]]);
        lookup.entry(key).or_default().push(sig);
    }
    lookup
}

/// Longest header in the catalog; the carver overlaps windows by one byte
/// less than this so boundary-straddling headers are never missed.
pub fn max_header_len() -> usize {
    catalog().iter().map(|s| s.header.len()).max().unwrap_or(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_entries_plausible() {
        for sig in catalog() {
            assert!(
                sig.header.len() >= 2 && sig.header.len() <= 8,
                "{} header length out of range",
                sig.name
            );
            assert!(sig.default_size >= 1024, "{} default size too small", sig.name);
            assert!(!sig.extension.is_empty());
        }
    }

    #[test]
    fn test_lookup_covers_catalog() {
        let lookup = build_lookup();
        let total: usize = lookup.values().map(|v| v.len()).sum();
        assert_eq!(total, catalog().len());

        let key = u16::from_le_bytes([0xFF, 0xD8]);
        let jpeg = &lookup[&key];
        assert!(jpeg.iter().any(|s| s.extension == "jpg"));
    }

    #[test]
    fn test_max_header_len() {
        assert_eq!(max_header_len(), 8);
    }
}

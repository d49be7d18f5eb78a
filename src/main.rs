//! rescuedisk - deleted-file recovery engine
//!
//! Recovers deleted or corrupted files from raw storage images by parsing
//! FAT32 and NTFS on-disk metadata (directory trees, cluster chains, MFT
//! records with data runs) and by carving raw bytes for known file-format
//! signatures when the metadata is unusable.
//!
//! Usage: rescuedisk <device-or-image> <output-dir> [auto|fat32|ntfs|signature]

mod block_source;
mod carver;
mod error;
mod fat32;
mod ntfs;
mod recovery;
mod signatures;
mod types;

use std::path::Path;
use std::process::ExitCode;

use log::info;

use crate::block_source::FileBlockSource;
use crate::recovery::{run_recovery, RecoveryMode, RecoveryOptions};
use crate::types::CancelToken;

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "usage: {} <device-or-image> <output-dir> [auto|fat32|ntfs|signature]",
            args[0]
        );
        return ExitCode::FAILURE;
    }

    let device = &args[1];
    let output_dir = Path::new(&args[2]);
    let mode = match args.get(3) {
        Some(s) => match RecoveryMode::parse(s) {
            Some(m) => m,
            None => {
                eprintln!("unknown mode: {}", s);
                return ExitCode::FAILURE;
            }
        },
        None => RecoveryMode::Auto,
    };

    let mut source = match FileBlockSource::open(device) {
        Ok(s) => s,
        Err(e) => {
            print_failure(&e.to_string());
            return ExitCode::FAILURE;
        }
    };

    info!("scanning {} in {} mode", device, mode.label());
    let options = RecoveryOptions {
        mode,
        ..RecoveryOptions::default()
    };
    let cancel = CancelToken::new();
    let mut progress = |count: u64, message: &str| {
        eprintln!("[{}] {}", count, message);
    };

    match run_recovery(&mut source, output_dir, &options, &cancel, &mut progress) {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                print_failure(&e.to_string());
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            print_failure(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn print_failure(message: &str) {
    println!(
        "{}",
        serde_json::json!({
            "success": false,
            "error": message,
        })
    );
}

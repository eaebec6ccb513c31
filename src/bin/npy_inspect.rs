//! npy_inspect - print the header of recorded `.npy` files
//!
//! Usage:
//!   cargo run --bin npy_inspect -- data/experiment1/recording1/continuous/*/timestamps.npy
//!   cargo run --bin npy_inspect -- -n 5 sample_numbers.npy

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use clap::Parser;
use ephys_recorder::common::cli::NpyInspectArgs;
use ephys_recorder::common::init_tracing;
use ephys_recorder::format::{FormatError, NpyHeader};
use tracing::warn;

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = NpyInspectArgs::parse();

    let mut failed = 0;
    for path in &args.files {
        if let Err(e) = inspect(path, args.head) {
            warn!(file = %path.display(), error = %e, "Cannot read");
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} files could not be read", args.files.len());
    }
    Ok(())
}

fn inspect(path: &Path, head: usize) -> Result<(), FormatError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = NpyHeader::read_from(&mut reader)?;
    println!("{}", path.display());
    println!("  descr:   {}", header.descr);
    println!("  shape:   {:?}", header.shape);
    println!("  records: {}", header.record_count());
    println!("  offset:  {}", header.data_offset);

    if head == 0 {
        return Ok(());
    }
    let Some(size) = element_size(&header.descr) else {
        return Ok(());
    };
    let width = header.record_width().max(1);
    let count = head.min(header.record_count()) * width;
    let mut raw = vec![0u8; count * size];
    reader.read_exact(&mut raw)?;
    let values: Vec<String> = raw.chunks_exact(size).map(|b| format_element(&header.descr, b)).collect();
    for (i, record) in values.chunks(width).enumerate() {
        println!("  [{i}] {}", record.join(" "));
    }
    Ok(())
}

fn element_size(descr: &str) -> Option<usize> {
    match descr {
        "|i1" | "|u1" => Some(1),
        "<i2" | "<u2" => Some(2),
        "<i4" | "<u4" | "<f4" => Some(4),
        "<i8" | "<u8" | "<f8" => Some(8),
        _ => None,
    }
}

fn format_element(descr: &str, b: &[u8]) -> String {
    let mut buf = [0u8; 8];
    buf[..b.len()].copy_from_slice(b);
    match descr {
        "|i1" => (b[0] as i8).to_string(),
        "|u1" => b[0].to_string(),
        "<i2" => i16::from_le_bytes([b[0], b[1]]).to_string(),
        "<u2" => u16::from_le_bytes([b[0], b[1]]).to_string(),
        "<i4" => i32::from_le_bytes([b[0], b[1], b[2], b[3]]).to_string(),
        "<u4" => u32::from_le_bytes([b[0], b[1], b[2], b[3]]).to_string(),
        "<f4" => f32::from_le_bytes([b[0], b[1], b[2], b[3]]).to_string(),
        "<i8" => i64::from_le_bytes(buf).to_string(),
        "<u8" => u64::from_le_bytes(buf).to_string(),
        _ => f64::from_le_bytes(buf).to_string(),
    }
}

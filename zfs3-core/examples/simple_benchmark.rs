/*!
Simple upload benchmark for hyperfine performance testing.

Pushes a generated stream through the pipeline into a temporary local store:
`cargo run --release --example simple_benchmark -- 256` uploads 256 MiB.
*/

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use zfs3_core::{CompressorKind, LocalObjectStore, Orchestrator, RunConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mib: usize = std::env::args().nth(1).map(|s| s.parse()).transpose()?.unwrap_or(64);
    let temp_dir = tempfile::TempDir::new()?;
    let store = Arc::new(LocalObjectStore::with_base_dir(temp_dir.path()));

    let data: Vec<u8> = (0..mib * 1024 * 1024).map(|i| ((i / 512) % 251) as u8).collect();
    let config = RunConfig {
        chunk_size: 8 * 1024 * 1024,
        compressor: CompressorKind::Parallel,
        ..RunConfig::default()
    };

    let start = Instant::now();
    let run = Orchestrator::new(config, store)?
        .run_and_record("bench/data@snap", Cursor::new(data), None)
        .await?;
    let elapsed = start.elapsed();

    let manifest = run.manifest();
    println!("Status: {}", run.outcome.status());
    println!("Chunks: {}", manifest.chunk_count);
    println!(
        "Stored: {} of {} bytes ({:.1}%)",
        manifest.stored_size,
        manifest.total_size,
        manifest.stored_size as f64 * 100.0 / manifest.total_size.max(1) as f64
    );
    println!(
        "Elapsed: {:.2?} ({:.1} MiB/s)",
        elapsed,
        mib as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}

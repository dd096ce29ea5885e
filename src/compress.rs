//! zstd compression for checkpointed artifacts.
//!
//! Database LOG files grow to gigabytes over a long run; checkpoints can keep
//! them compressed as `{name}.zst`.

use std::path::Path;

const LEVEL: i32 = 3;

/// Compress `src` into `dest`, streaming. The source is left in place.
/// Returns the compressed size in bytes.
pub fn compress_file(src: &Path, dest: &Path) -> std::io::Result<u64> {
    let input = std::fs::File::open(src)?;
    let output = std::fs::File::create(dest)?;
    zstd::stream::copy_encode(std::io::BufReader::new(input), &output, LEVEL)?;
    let size = output.metadata()?.len();
    tracing::debug!(
        src = %src.display(),
        dest = %dest.display(),
        bytes = size,
        "compressed file"
    );
    Ok(size)
}

//! Build context packing for image builds

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io;
use std::path::Path;

/// Pack `dir` into a gzip compressed tar archive rooted at `.`.
pub fn pack_build_context(dir: &Path) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive.follow_symlinks(false);
    archive.append_dir_all(".", dir)?;
    let encoder = archive.into_inner()?;
    encoder.finish()
}

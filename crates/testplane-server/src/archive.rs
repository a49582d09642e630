// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result-directory archives.
//!
//! When a task finishes, uploaded resources are packed into a gzip tarball
//! next to the test results. Blocking archive I/O runs on the blocking pool.

use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

/// Pack `src_dir` into a `.tar.gz` at `dest`.
pub fn make_tarball(dest: &Path, src_dir: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", src_dir)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

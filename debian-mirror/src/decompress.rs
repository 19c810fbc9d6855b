// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Materializing plain text indices from their compressed variants.

Decompression is delegated to the system `gzip`, `bzip2` and `xz` programs.
*/

use {
    crate::error::{MirrorError, Result},
    log::{debug, warn},
    std::path::{Path, PathBuf},
};

/// Compression formats of index files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
}

impl Compression {
    /// Formats in the order compressed variants are tried.
    pub fn lookup_order() -> impl Iterator<Item = Compression> {
        [Self::Gzip, Self::Bzip2, Self::Xz].into_iter()
    }

    /// Filename extension, including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Xz => ".xz",
        }
    }

    /// The program decoding this format to stdout.
    pub fn decoder(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
        }
    }
}

/// Outcome of [materialize_index()].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Materialized {
    /// The index was decoded from the given compressed file.
    Decompressed(PathBuf),
    /// No compressed variant exists but the plain index does.
    Plain,
    /// No usable variant of the index exists.
    Missing,
}

impl Materialized {
    /// Whether the plain index is available for reading.
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

fn with_extension(path: &Path, extension: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(extension);
    PathBuf::from(s)
}

/// Decode `source` into `dest` with the external decoder for `compression`.
pub fn decompress_file(compression: Compression, source: &Path, dest: &Path) -> Result<()> {
    debug!(
        "{} -dc < {} > {}",
        compression.decoder(),
        source.display(),
        dest.display()
    );

    duct::cmd(compression.decoder(), &["-dc"])
        .stdin_path(source)
        .stdout_path(dest)
        .stderr_null()
        .run()
        .map_err(|e| MirrorError::IoPath(format!("{}", source.display()), e))?;

    Ok(())
}

/// Ensure the plain text variant of an index exists.
///
/// `.gz`, `.bz2` and `.xz` siblings of `index_path` are tried in that order
/// and the first found is decoded into `index_path`. A failing decoder is
/// logged and the index is reported [Materialized::Missing].
pub fn materialize_index(index_path: &Path) -> Materialized {
    let found = Compression::lookup_order()
        .map(|c| (c, with_extension(index_path, c.extension())))
        .find(|(_, path)| path.is_file());

    match found {
        Some((compression, source)) => match decompress_file(compression, &source, index_path) {
            Ok(()) => Materialized::Decompressed(source),
            Err(e) => {
                warn!("unable to decompress {}: {}", source.display(), e);
                // Do not leave a truncated index behind.
                let _ = std::fs::remove_file(index_path);

                Materialized::Missing
            }
        },
        None if index_path.is_file() => Materialized::Plain,
        None => Materialized::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_missing() -> Result<()> {
        let td = tempfile::tempdir()?;
        let index = td.path().join("Packages");

        assert_eq!(materialize_index(&index), Materialized::Missing);
        assert!(!materialize_index(&index).is_available());

        std::fs::write(&index, "Package: a\n")?;
        assert_eq!(materialize_index(&index), Materialized::Plain);

        Ok(())
    }

    #[test]
    fn gzip_is_tried_first() -> Result<()> {
        let td = tempfile::tempdir()?;
        let index = td.path().join("Sources");
        let plain = td.path().join("input");
        std::fs::write(&plain, "Package: hello\n")?;

        duct::cmd("gzip", &["-c"])
            .stdin_path(&plain)
            .stdout_path(with_extension(&index, ".gz"))
            .run()?;
        // A bogus xz variant is never consulted.
        std::fs::write(with_extension(&index, ".xz"), b"not xz")?;

        assert_eq!(
            materialize_index(&index),
            Materialized::Decompressed(with_extension(&index, ".gz"))
        );
        assert_eq!(std::fs::read_to_string(&index)?, "Package: hello\n");

        Ok(())
    }

    #[test]
    fn broken_variant_is_missing() -> Result<()> {
        let td = tempfile::tempdir()?;
        let index = td.path().join("Packages");
        std::fs::write(with_extension(&index, ".gz"), b"definitely not gzip")?;

        assert_eq!(materialize_index(&index), Materialized::Missing);
        assert!(!index.exists());

        Ok(())
    }
}

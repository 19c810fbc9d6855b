// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Accumulation of the files known to a mirror run.

A [Ledger] is created once per run and passed by reference into every pass
that discovers files. It records:

* every mirror relative path advertised by the processed indices (`ALL`),
* the source URLs scheduled for download (`NEW`),
* per [ChecksumType] digest lines (`MD5`, `SHA1`, `SHA256`),
* metadata and administrator declared paths protected from cleanup.

Once the run's discovery passes complete, the ledger is the definition of
which local files are needed.
*/

use {
    crate::{
        checksums::ChecksumType,
        error::{MirrorError, Result},
    },
    std::{
        collections::{BTreeMap, HashSet},
        io::Write,
        path::Path,
    },
};

/// An insertion ordered list of lines keyed for uniqueness.
#[derive(Clone, Debug, Default)]
struct UniqueLines {
    lines: Vec<String>,
    keys: HashSet<String>,
}

impl UniqueLines {
    fn insert(&mut self, key: &str, line: impl FnOnce() -> String) -> bool {
        if self.keys.contains(key) {
            false
        } else {
            self.keys.insert(key.to_string());
            self.lines.push(line());
            true
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        let io_error = |e| MirrorError::IoPath(format!("{}", path.display()), e);

        let mut fh = std::io::BufWriter::new(std::fs::File::create(path).map_err(io_error)?);

        for line in &self.lines {
            fh.write_all(line.as_bytes()).map_err(io_error)?;
            fh.write_all(b"\n").map_err(io_error)?;
        }

        fh.flush().map_err(io_error)
    }
}

/// Run-scoped accumulator of known files.
#[derive(Clone, Debug, Default)]
pub struct Ledger {
    all: UniqueLines,
    new: UniqueLines,
    checksums: BTreeMap<ChecksumType, UniqueLines>,
    protected: HashSet<String>,
}

impl Ledger {
    /// Record a mirror relative path advertised by an index.
    ///
    /// Returns whether the path was not seen before.
    pub fn record_file(&mut self, path: &str) -> bool {
        self.all.insert(path, || path.to_string())
    }

    /// Record the digest of a mirror relative path.
    ///
    /// Only the first digest of each type is kept for a path.
    pub fn record_checksum(&mut self, checksum: ChecksumType, digest: &str, path: &str) {
        self.checksums
            .entry(checksum)
            .or_default()
            .insert(path, || format!("{}  {}", digest, path));
    }

    /// Record a source URL scheduled for download.
    pub fn record_new(&mut self, url: &str) {
        self.new.insert(url, || url.to_string());
    }

    /// Protect a mirror relative path from cleanup without listing it in `ALL`.
    pub fn protect(&mut self, path: impl ToString) {
        self.protected.insert(path.to_string());
    }

    /// Whether a mirror relative path was recorded by an index.
    pub fn is_known(&self, path: &str) -> bool {
        self.all.contains(path)
    }

    /// Whether a mirror relative path must be kept by cleanup.
    pub fn is_needed(&self, path: &str) -> bool {
        self.is_known(path) || self.protected.contains(path)
    }

    /// Mirror relative paths recorded from indices, in discovery order.
    pub fn files(&self) -> &[String] {
        &self.all.lines
    }

    /// Source URLs scheduled for download, in discovery order.
    pub fn new_urls(&self) -> &[String] {
        &self.new.lines
    }

    /// `<digest>  <path>` lines recorded for a checksum type.
    pub fn checksum_lines(&self, checksum: ChecksumType) -> &[String] {
        self.checksums
            .get(&checksum)
            .map(|lines| lines.lines.as_slice())
            .unwrap_or(&[])
    }

    /// Write the `ALL`, `NEW`, `MD5`, `SHA1` and `SHA256` files into a directory.
    pub fn write_artifacts(&self, dir: &Path) -> Result<()> {
        self.all.write_to(&dir.join("ALL"))?;
        self.new.write_to(&dir.join("NEW"))?;

        let empty = UniqueLines::default();

        for checksum in [ChecksumType::Md5, ChecksumType::Sha1, ChecksumType::Sha256] {
            self.checksums
                .get(&checksum)
                .unwrap_or(&empty)
                .write_to(&dir.join(checksum.ledger_filename()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_deduplicates() {
        let mut ledger = Ledger::default();

        assert!(ledger.record_file("host/pool/a.deb"));
        assert!(!ledger.record_file("host/pool/a.deb"));
        ledger.record_file("host/pool/b.deb");

        ledger.record_checksum(ChecksumType::Md5, "aa", "host/pool/a.deb");
        ledger.record_checksum(ChecksumType::Md5, "ab", "host/pool/a.deb");
        ledger.record_checksum(ChecksumType::Sha256, "cc", "host/pool/a.deb");

        ledger.record_new("http://host/pool/a.deb");
        ledger.record_new("http://host/pool/a.deb");

        assert_eq!(ledger.files(), &["host/pool/a.deb", "host/pool/b.deb"]);
        assert_eq!(
            ledger.checksum_lines(ChecksumType::Md5),
            &["aa  host/pool/a.deb"]
        );
        assert_eq!(
            ledger.checksum_lines(ChecksumType::Sha256),
            &["cc  host/pool/a.deb"]
        );
        assert!(ledger.checksum_lines(ChecksumType::Sha1).is_empty());
        assert_eq!(ledger.new_urls(), &["http://host/pool/a.deb"]);
    }

    #[test]
    fn protected_paths_are_needed_but_not_listed() {
        let mut ledger = Ledger::default();
        ledger.protect("host/dists/bullseye/Release");
        ledger.record_file("host/pool/a.deb");

        assert!(ledger.is_needed("host/dists/bullseye/Release"));
        assert!(!ledger.is_known("host/dists/bullseye/Release"));
        assert!(ledger.is_needed("host/pool/a.deb"));
        assert!(!ledger.is_needed("host/pool/b.deb"));
        assert_eq!(ledger.files().len(), 1);
    }

    #[test]
    fn artifacts_written() -> Result<()> {
        let td = tempfile::tempdir()?;

        let mut ledger = Ledger::default();
        ledger.record_file("host/pool/a.deb");
        ledger.record_checksum(ChecksumType::Sha1, "bb", "host/pool/a.deb");
        ledger.write_artifacts(td.path())?;

        assert_eq!(std::fs::read_to_string(td.path().join("ALL"))?, "host/pool/a.deb\n");
        assert_eq!(std::fs::read_to_string(td.path().join("NEW"))?, "");
        assert_eq!(
            std::fs::read_to_string(td.path().join("SHA1"))?,
            "bb  host/pool/a.deb\n"
        );
        assert_eq!(std::fs::read_to_string(td.path().join("MD5"))?, "");
        assert!(td.path().join("SHA256").exists());

        Ok(())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publishing fetched metadata from the skeleton tree into the mirror tree.

Index files are fetched into a separate skeleton tree so the mirror tree never
exposes metadata referencing packages that have not been downloaded yet. Once
the archive pass completes, the metadata is copied over.
*/

use {
    crate::{
        error::{MirrorError, Result},
        paths::PathEncoder,
        topology::COMPRESSION_EXTENSIONS,
    },
    filetime::FileTime,
    log::{debug, warn},
    std::{
        fs::File,
        io::{BufReader, Read},
        path::Path,
    },
};

/// Outcome of a single [copy_file()].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyOutcome {
    /// The file was copied.
    Copied,
    /// The source file does not exist.
    SourceMissing,
}

/// Counts of a [copy_skeleton()] run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CopySummary {
    pub copied: usize,
    pub missing: usize,
    pub failed: usize,
}

fn io_path(path: &Path, e: std::io::Error) -> MirrorError {
    MirrorError::IoPath(format!("{}", path.display()), e)
}

fn files_differ(a: &Path, b: &Path) -> Result<bool> {
    let a_md = std::fs::metadata(a).map_err(|e| io_path(a, e))?;
    let b_md = std::fs::metadata(b).map_err(|e| io_path(b, e))?;

    if a_md.len() != b_md.len() {
        return Ok(true);
    }

    let mut a_fh = BufReader::new(File::open(a).map_err(|e| io_path(a, e))?);
    let mut b_fh = BufReader::new(File::open(b).map_err(|e| io_path(b, e))?);

    let mut a_buf = vec![0u8; 32768];
    let mut b_buf = vec![0u8; 32768];

    loop {
        let count = a_fh.read(&mut a_buf).map_err(|e| io_path(a, e))?;

        if count == 0 {
            return Ok(false);
        }

        b_fh.read_exact(&mut b_buf[0..count])
            .map_err(|e| io_path(b, e))?;

        if a_buf[0..count] != b_buf[0..count] {
            return Ok(true);
        }
    }
}

/// Copy `source` to `target`, preserving the source's access and modification times.
///
/// With `unlink`, an existing target whose content differs is removed first so the
/// copy gets a new inode instead of rewriting one that may be hard linked elsewhere.
pub fn copy_file(source: &Path, target: &Path, unlink: bool) -> Result<CopyOutcome> {
    let metadata = match std::fs::metadata(source) {
        Ok(md) => md,
        Err(_) => return Ok(CopyOutcome::SourceMissing),
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_path(parent, e))?;
    }

    if unlink && target.exists() && files_differ(source, target)? {
        std::fs::remove_file(target).map_err(|e| io_path(target, e))?;
    }

    std::fs::copy(source, target).map_err(|e| io_path(target, e))?;

    filetime::set_file_times(
        target,
        FileTime::from_last_access_time(&metadata),
        FileTime::from_last_modification_time(&metadata),
    )
    .map_err(|e| io_path(target, e))?;

    Ok(CopyOutcome::Copied)
}

/// Copy metadata fetched from `urls` from `skel_root` to `mirror_root`.
///
/// Compressed files are accompanied by their uncompressed variant if one was
/// materialized. Failures are logged and do not stop the copy.
pub fn copy_skeleton(
    urls: &[String],
    encoder: &PathEncoder,
    skel_root: &Path,
    mirror_root: &Path,
    unlink: bool,
) -> CopySummary {
    let mut summary = CopySummary::default();

    for url in urls {
        let mut paths = vec![encoder.sanitise_uri(url)];

        if let Some(plain) = COMPRESSION_EXTENSIONS
            .iter()
            .find_map(|ext| url.strip_suffix(ext))
        {
            paths.push(encoder.sanitise_uri(plain));
        }

        for rel in paths {
            let source = skel_root.join(&rel);
            let target = mirror_root.join(&rel);

            match copy_file(&source, &target, unlink) {
                Ok(CopyOutcome::Copied) => summary.copied += 1,
                Ok(CopyOutcome::SourceMissing) => {
                    debug!("{} not present in skeleton", rel);
                    summary.missing += 1;
                }
                Err(e) => {
                    warn!("can't copy {} to {}: {}", source.display(), target.display(), e);
                    summary.failed += 1;
                }
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_preserves_mtime() -> Result<()> {
        let td = tempfile::tempdir()?;
        let source = td.path().join("skel/Release");
        let target = td.path().join("mirror/a/b/Release");

        assert_eq!(copy_file(&source, &target, false)?, CopyOutcome::SourceMissing);

        std::fs::create_dir_all(source.parent().unwrap())?;
        std::fs::write(&source, b"Origin: Debian\n")?;
        let mtime = FileTime::from_unix_time(1_000_000_000, 0);
        filetime::set_file_mtime(&source, mtime)?;

        assert_eq!(copy_file(&source, &target, false)?, CopyOutcome::Copied);
        assert_eq!(std::fs::read(&target)?, b"Origin: Debian\n");
        assert_eq!(
            FileTime::from_last_modification_time(&std::fs::metadata(&target)?),
            mtime
        );

        Ok(())
    }

    #[test]
    fn unlink_breaks_hard_links() -> Result<()> {
        let td = tempfile::tempdir()?;
        let source = td.path().join("source");
        let target = td.path().join("target");
        let linked = td.path().join("linked");

        std::fs::write(&source, b"new")?;
        std::fs::write(&target, b"old")?;
        std::fs::hard_link(&target, &linked)?;

        copy_file(&source, &target, true)?;
        assert_eq!(std::fs::read(&target)?, b"new");
        assert_eq!(std::fs::read(&linked)?, b"old");

        // Without unlink the shared inode is rewritten.
        std::fs::hard_link(&target, td.path().join("linked2"))?;
        std::fs::write(&source, b"newer")?;
        copy_file(&source, &target, false)?;
        assert_eq!(std::fs::read(td.path().join("linked2"))?, b"newer");

        Ok(())
    }

    #[test]
    fn skeleton_copies_uncompressed_twins() -> Result<()> {
        let td = tempfile::tempdir()?;
        let skel = td.path().join("skel");
        let mirror = td.path().join("mirror");

        let dir = skel.join("deb.example.com/debian/dists/stable/main/binary-amd64");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("Packages.gz"), b"gz")?;
        std::fs::write(dir.join("Packages"), b"plain")?;

        let urls = vec![
            "http://deb.example.com/debian/dists/stable/main/binary-amd64/Packages.gz".to_string(),
            "http://deb.example.com/debian/dists/stable/main/binary-amd64/Packages.xz".to_string(),
        ];

        let summary = copy_skeleton(&urls, &PathEncoder::default(), &skel, &mirror, false);

        assert_eq!(
            summary,
            CopySummary {
                copied: 3,
                missing: 1,
                failed: 0,
            }
        );
        assert_eq!(
            std::fs::read(mirror.join("deb.example.com/debian/dists/stable/main/binary-amd64/Packages"))?,
            b"plain"
        );

        Ok(())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reclaiming files no longer referenced by the mirrored repositories.

Cleanup is a mark and sweep over the mirror tree:

* A symbolic link is always needed and never followed.
* A regular file is needed if its mirror relative path is needed according to
  the run's [Ledger] (which includes protected paths).
* A directory is needed if anything beneath it is needed. A directory that is
  itself protected is not descended into.

Unneeded files and directories form a [CleanupPlan]. Directories are listed
deepest first, so removing files and then directories in list order empties
each directory before it is removed.
*/

use {
    crate::{
        error::{MirrorError, Result},
        ledger::Ledger,
        paths::{format_bytes, shell_quote, PathEncoder},
    },
    log::{debug, warn},
    std::{
        collections::HashSet,
        io::ErrorKind,
        path::{Path, PathBuf},
    },
    walkdir::WalkDir,
};

/// Files and directories that can be removed from a mirror tree.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupPlan {
    /// Mirror relative paths of unneeded files.
    pub files: Vec<String>,
    /// Mirror relative paths of unneeded directories, deepest first.
    pub directories: Vec<String>,
    /// Disk space allocated to the unneeded files.
    pub reclaimable_bytes: u64,
}

#[cfg(unix)]
fn allocated_size(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;

    metadata.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_size(metadata: &std::fs::Metadata) -> u64 {
    metadata.len()
}

fn io_path(path: &Path, e: std::io::Error) -> MirrorError {
    MirrorError::IoPath(format!("{}", path.display()), e)
}

/// Walks a mirror tree and decides what is no longer needed.
pub struct CleanupScanner<'a> {
    mirror_root: &'a Path,
    ledger: &'a Ledger,
    encoder: PathEncoder,
}

impl<'a> CleanupScanner<'a> {
    /// Construct an instance deciding neededness from a ledger.
    pub fn new(mirror_root: &'a Path, ledger: &'a Ledger, encoder: PathEncoder) -> Self {
        Self {
            mirror_root,
            ledger,
            encoder,
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(self.mirror_root).ok()?;

        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        Some(self.encoder.encode(&rel).into_owned())
    }

    /// Scan mirror relative directories for unneeded content.
    ///
    /// An empty `roots` scans the whole mirror tree. Roots that are missing,
    /// not directories or symbolic links are ignored. The mirror root itself is
    /// never listed for removal.
    pub fn scan(&self, roots: &[String]) -> Result<CleanupPlan> {
        let mut plan = CleanupPlan::default();
        let mut listed = HashSet::new();

        let roots = if roots.is_empty() {
            vec![String::new()]
        } else {
            roots.to_vec()
        };

        for root in roots {
            let root_path = self.mirror_root.join(&root);

            match std::fs::symlink_metadata(&root_path) {
                Ok(md) if md.is_dir() => {}
                _ => {
                    debug!("not cleaning {}: not a directory", root_path.display());
                    continue;
                }
            }

            self.scan_root(&root_path, &mut plan, &mut listed)?;
        }

        Ok(plan)
    }

    fn scan_root(
        &self,
        root: &Path,
        plan: &mut CleanupPlan,
        listed: &mut HashSet<String>,
    ) -> Result<()> {
        // Directories with at least one needed descendant.
        let mut needed_dirs = HashSet::<PathBuf>::new();

        let entries = WalkDir::new(root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|entry| {
                let protected = entry.file_type().is_dir()
                    && self
                        .relative(entry.path())
                        .map(|rel| !rel.is_empty() && self.ledger.is_needed(&rel))
                        .unwrap_or(false);

                if protected {
                    mark_parent(&mut needed_dirs, entry.path());
                }

                !protected
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for entry in &entries {
            let file_type = entry.file_type();

            if file_type.is_dir() {
                continue;
            }

            let rel = match self.relative(entry.path()) {
                Some(rel) => rel,
                None => continue,
            };

            if file_type.is_file() && !self.ledger.is_needed(&rel) {
                if listed.insert(rel.clone()) {
                    plan.reclaimable_bytes += allocated_size(&entry.metadata()?);
                    plan.files.push(rel);
                }
            } else {
                // Needed files, symbolic links and special files are kept.
                mark_parent(&mut needed_dirs, entry.path());
            }
        }

        // Reversed walk order visits every directory after its subdirectories.
        for entry in entries.iter().rev().filter(|e| e.file_type().is_dir()) {
            if needed_dirs.contains(entry.path()) {
                mark_parent(&mut needed_dirs, entry.path());
                continue;
            }

            match self.relative(entry.path()) {
                Some(rel) if !rel.is_empty() && listed.insert(rel.clone()) => {
                    plan.directories.push(rel);
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn mark_parent(needed_dirs: &mut HashSet<PathBuf>, path: &Path) {
    if let Some(parent) = path.parent() {
        needed_dirs.insert(parent.to_path_buf());
    }
}

impl CleanupPlan {
    /// Whether there is nothing to remove.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }

    /// Remove every listed file, then every listed directory.
    ///
    /// Entries that have already disappeared are ignored.
    pub fn execute(&self, mirror_root: &Path) -> Result<()> {
        for file in &self.files {
            let path = mirror_root.join(file);

            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_path(&path, e)),
            }
        }

        for dir in &self.directories {
            let path = mirror_root.join(dir);

            match std::fs::remove_dir(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_path(&path, e)),
            }
        }

        Ok(())
    }

    /// Render a POSIX shell script performing the removal.
    ///
    /// The script can be re-run safely after partial cleanup.
    pub fn script(&self, mirror_root: &Path) -> String {
        let mut lines = vec![
            "#!/bin/sh".to_string(),
            "set -e".to_string(),
            String::new(),
            format!("cd {}", shell_quote(&mirror_root.display().to_string())),
            String::new(),
            format!(
                "echo 'Removing {} unnecessary files [{}]...'",
                self.files.len(),
                format_bytes(self.reclaimable_bytes)
            ),
        ];

        let total = self.files.len();
        for (i, file) in self.files.iter().enumerate() {
            lines.push(format!("rm -f {}", shell_quote(file)));

            if i % 500 == 0 {
                lines.push(format!("echo -n '[{}%]'", 100 * i / total));
            }
            if i % 10 == 0 {
                lines.push("echo -n .".to_string());
            }
        }

        lines.push("echo 'done.'".to_string());
        lines.push("echo".to_string());
        lines.push(String::new());

        let total = self.directories.len();
        lines.push(format!("echo 'Removing {} unnecessary directories...'", total));

        for (i, dir) in self.directories.iter().enumerate() {
            let quoted = shell_quote(dir);
            lines.push(format!("if test -d {}; then rmdir {}; fi", quoted, quoted));

            if i % 50 == 0 {
                lines.push(format!("echo -n '[{}%]'", 100 * i / total));
            }
            lines.push("echo -n .".to_string());
        }

        lines.push("echo 'done.'".to_string());
        lines.push("echo".to_string());

        let mut script = lines.join("\n");
        script.push('\n');

        script
    }

    /// Write the removal script to `script_path` and make it executable.
    pub fn write_script(&self, mirror_root: &Path, script_path: &Path) -> Result<()> {
        if let Some(parent) = script_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_path(parent, e))?;
        }

        std::fs::write(script_path, self.script(mirror_root))
            .map_err(|e| io_path(script_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let permissions = std::fs::Permissions::from_mode(0o755);
            if let Err(e) = std::fs::set_permissions(script_path, permissions) {
                warn!("unable to make {} executable: {}", script_path.display(), e);
            }
        }

        Ok(())
    }
}

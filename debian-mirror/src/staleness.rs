// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Computing what needs to be downloaded.

Every file advertised by a `Packages` or `Sources` index is recorded in the
run's [Ledger]. The file is then compared against its local copy in the
mirror tree: a file is stale when the local copy is missing or its size
differs from the advertised size. Stale files are added to a [DownloadPlan].

Sizes are the only signal consulted. Digests are recorded in the ledger for
consumers of the mirror but are never used to decide whether to fetch.
*/

use {
    crate::{
        checksums::ChecksumType,
        control::{ControlParagraph, ControlParagraphReader},
        error::Result,
        fetch::DownloadTask,
        index::stanza_files,
        ledger::Ledger,
        paths::PathEncoder,
        topology::Mirror,
    },
    log::{debug, warn},
    std::{
        collections::{BTreeMap, HashMap},
        path::{Path, PathBuf},
    },
};

/// Whether a local file of `local` bytes needs replacing by one of `remote` bytes.
///
/// An absent local file has size 0 and is always stale.
pub fn is_stale(local: u64, remote: u64) -> bool {
    local == 0 || local != remote
}

/// Memoized local file sizes.
///
/// Missing or unreadable files have size 0.
#[derive(Clone, Debug, Default)]
pub struct SizeCache {
    sizes: HashMap<PathBuf, u64>,
}

impl SizeCache {
    /// Obtain the size of a local file, consulting the filesystem on first use.
    pub fn size_of(&mut self, path: &Path) -> u64 {
        if let Some(size) = self.sizes.get(path) {
            return *size;
        }

        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        self.sizes.insert(path.to_path_buf(), size);

        size
    }

    /// Forget all cached sizes.
    pub fn clear(&mut self) {
        self.sizes.clear();
    }

    /// The number of cached entries.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// A set of downloads keyed by source URL.
///
/// Adding a URL twice keeps a single task.
#[derive(Clone, Debug, Default)]
pub struct DownloadPlan {
    tasks: BTreeMap<String, DownloadTask>,
}

impl DownloadPlan {
    /// Add a task, replacing any task for the same URL.
    pub fn add(&mut self, task: DownloadTask) {
        self.tasks.insert(task.url().to_string(), task);
    }

    /// Whether a URL is planned.
    pub fn contains(&self, url: &str) -> bool {
        self.tasks.contains_key(url)
    }

    /// The number of planned downloads.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether nothing is planned.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Sum of the advertised sizes of planned downloads.
    pub fn total_bytes(&self) -> u64 {
        self.tasks.values().filter_map(|t| t.size()).sum()
    }

    /// Iterate planned tasks in URL order.
    pub fn iter(&self) -> impl Iterator<Item = &DownloadTask> {
        self.tasks.values()
    }

    /// Consume self into tasks sorted by URL.
    pub fn into_tasks(self) -> Vec<DownloadTask> {
        self.tasks.into_values().collect()
    }
}

/// Processes `Packages` and `Sources` indices against a local mirror tree.
pub struct IndexProcessor {
    encoder: PathEncoder,
    mirror_root: PathBuf,
    cache: SizeCache,
}

impl IndexProcessor {
    /// Construct an instance comparing against files under `mirror_root`.
    pub fn new(encoder: PathEncoder, mirror_root: impl AsRef<Path>) -> Self {
        Self {
            encoder,
            mirror_root: mirror_root.as_ref().to_path_buf(),
            cache: SizeCache::default(),
        }
    }

    /// The local size cache.
    pub fn cache(&self) -> &SizeCache {
        &self.cache
    }

    /// Forget cached local sizes.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Process an uncompressed index file of a mirror.
    ///
    /// An index that cannot be opened is logged and contributes nothing. Returns
    /// the number of files the index advertises.
    pub fn process_index(
        &mut self,
        mirror: &Mirror,
        index_path: &Path,
        ledger: &mut Ledger,
        plan: &mut DownloadPlan,
    ) -> Result<usize> {
        let fh = match std::fs::File::open(index_path) {
            Ok(fh) => fh,
            Err(e) => {
                warn!("can't open index {}: {}", index_path.display(), e);
                return Ok(0);
            }
        };

        let reader = ControlParagraphReader::new(std::io::BufReader::new(fh));
        let source = format!("{}", index_path.display());

        let mut count = 0;
        for paragraph in reader {
            count += self.process_paragraph(mirror, &paragraph?, &source, ledger, plan)?;
        }

        debug!("{}: {} files", source, count);

        Ok(count)
    }

    /// Process a single index stanza.
    ///
    /// `source` names the index in error messages. Returns the number of files
    /// the stanza advertises.
    pub fn process_paragraph(
        &mut self,
        mirror: &Mirror,
        paragraph: &ControlParagraph,
        source: &str,
        ledger: &mut Ledger,
        plan: &mut DownloadPlan,
    ) -> Result<usize> {
        let base = self.encoder.sanitise_uri(mirror.url());
        let files = stanza_files(paragraph, source)?;

        for file in &files {
            let store_path = self.encoder.normalize(&format!("{}/{}", base, file.path));

            ledger.record_file(&store_path);

            for checksum in [ChecksumType::Md5, ChecksumType::Sha1, ChecksumType::Sha256] {
                if let Some(digest) = file.digest(checksum) {
                    ledger.record_checksum(checksum, digest, &store_path);
                }
            }

            let local = self.cache.size_of(&self.mirror_root.join(&store_path));

            if is_stale(local, file.size) {
                let task =
                    DownloadTask::new(&self.encoder, mirror.url(), &file.path, Some(file.size));

                ledger.record_new(task.url());
                plan.add(task);
            }
        }

        Ok(files.len())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Running a complete mirror update.

A [MirrorRun] drives every stage of an update in order:

1. Fetch the index files of every suite into the skeleton tree.
2. Fetch translation catalogs advertised by the fetched metadata.
3. Fetch DEP-11 and command-not-found catalogs.
4. Parse `Sources` and `Packages` indices, record the run ledger and fetch
   the archive files whose local copy is stale into the mirror tree.
5. Copy the fetched metadata from the skeleton tree into the mirror tree.
6. Remove, or script the removal of, everything the ledger does not need.

Only one run may be active per `var_path`. Progress is reported through
[MirrorEvent]s.
*/

use {
    crate::{
        catalog::{discover_secondary_catalogs, discover_translations, CatalogFiles},
        cleanup::{CleanupPlan, CleanupScanner},
        config::MirrorConfig,
        decompress::materialize_index,
        error::{MirrorError, Result},
        fetch::{CommandTransferAgent, DownloadTask, FetchScheduler, TransferAgent},
        ledger::Ledger,
        lock::RunLock,
        paths::{format_bytes, PathEncoder},
        skel::{copy_skeleton, CopySummary},
        staleness::{DownloadPlan, IndexProcessor},
        topology::{Mirror, Suite, Topology, COMPRESSION_EXTENSIONS},
    },
    log::{info, warn},
    std::{
        collections::HashSet,
        path::{Path, PathBuf},
    },
};

/// Represents a progress event of a mirror run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MirrorEvent {
    /// A fetch phase is starting.
    FetchBegin {
        stage: String,
        files: usize,
        workers: usize,
    },

    /// A worker of a fetch phase exited.
    WorkerFinished { stage: String, remaining: usize },

    /// Every worker of a fetch phase exited.
    FetchEnd { stage: String },

    /// An index file was parsed and contributed the given number of files.
    IndexProcessed { path: String, files: usize },

    /// Number and total size of archive files that will be downloaded.
    DownloadSize { files: usize, bytes: u64 },

    /// Fetched metadata was copied into the mirror tree.
    SkeletonCopied(CopySummary),

    /// Unneeded content was found.
    CleanupPlanned {
        files: usize,
        directories: usize,
        bytes: u64,
    },

    /// Unneeded content was removed.
    CleanupExecuted,

    /// A script removing unneeded content was written to the given path.
    CleanupScriptWritten(String),
}

impl std::fmt::Display for MirrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FetchBegin {
                stage,
                files,
                workers,
            } => {
                write!(
                    f,
                    "{}: downloading {} files using {} workers",
                    stage, files, workers
                )
            }
            Self::WorkerFinished { stage, remaining } => {
                write!(f, "{}: worker finished; {} remaining", stage, remaining)
            }
            Self::FetchEnd { stage } => {
                write!(f, "{}: end time", stage)
            }
            Self::IndexProcessed { path, files } => {
                write!(f, "processed {} ({} files)", path, files)
            }
            Self::DownloadSize { files, bytes } => {
                write!(f, "{} will be downloaded in {} files", format_bytes(*bytes), files)
            }
            Self::SkeletonCopied(summary) => {
                write!(
                    f,
                    "copied {} metadata files ({} missing, {} failed)",
                    summary.copied, summary.missing, summary.failed
                )
            }
            Self::CleanupPlanned {
                files,
                directories,
                bytes,
            } => {
                write!(
                    f,
                    "{} in {} files and {} directories can be freed",
                    format_bytes(*bytes),
                    files,
                    directories
                )
            }
            Self::CleanupExecuted => {
                write!(f, "removed unneeded files and directories")
            }
            Self::CleanupScriptWritten(path) => {
                write!(f, "run {} to free the space", path)
            }
        }
    }
}

/// Outcome of a [MirrorRun::run()].
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// Metadata URLs fetched into the skeleton tree.
    pub metadata_urls: usize,
    /// Archive files scheduled for download.
    pub download_files: usize,
    /// Advertised size of the scheduled archive files.
    pub download_bytes: u64,
    pub copy: CopySummary,
    pub cleanup: CleanupPlan,
}

fn emit(progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>, event: MirrorEvent) {
    if let Some(cb) = progress_cb {
        cb(event);
    }
}

/// An insertion ordered list of tasks without duplicate URLs.
#[derive(Default)]
struct TaskList {
    tasks: Vec<DownloadTask>,
    seen: HashSet<String>,
}

impl TaskList {
    fn push(&mut self, task: DownloadTask) {
        if self.seen.insert(task.url().to_string()) {
            self.tasks.push(task);
        }
    }

    fn into_inner(self) -> Vec<DownloadTask> {
        self.tasks
    }
}

/// A configured mirror update.
pub struct MirrorRun {
    config: MirrorConfig,
    topology: Topology,
    encoder: PathEncoder,
}

impl MirrorRun {
    /// Construct an instance from configuration.
    ///
    /// Path variables are resolved and the topology is validated.
    pub fn new(config: MirrorConfig) -> Result<Self> {
        let config = config.resolve()?;
        let topology = config.topology()?;
        let encoder = config.encoder();

        Ok(Self {
            config,
            topology,
            encoder,
        })
    }

    /// The resolved configuration.
    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Download tasks of every index file of every configured suite.
    pub fn index_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks = TaskList::default();

        for mirror in self.topology.mirrors() {
            for path in mirror.index_paths(self.config.contents) {
                tasks.push(DownloadTask::new(&self.encoder, mirror.url(), &path, None));
            }
        }

        tasks.into_inner()
    }

    /// Download tasks of translation catalogs advertised by fetched metadata.
    pub fn translation_tasks(&self) -> Vec<DownloadTask> {
        self.catalog_tasks(discover_translations)
    }

    /// Download tasks of DEP-11 and command-not-found catalogs advertised by fetched metadata.
    pub fn secondary_tasks(&self) -> Vec<DownloadTask> {
        self.catalog_tasks(discover_secondary_catalogs)
    }

    fn catalog_tasks(&self, discover: impl Fn(&Suite, &Path) -> CatalogFiles) -> Vec<DownloadTask> {
        let mut tasks = TaskList::default();

        for (mirror, suite) in self.topology.iter_suites() {
            for (path, size) in discover(suite, &self.skel_dir(mirror)) {
                tasks.push(DownloadTask::new(
                    &self.encoder,
                    mirror.url(),
                    &path,
                    Some(size),
                ));
            }
        }

        tasks.into_inner()
    }

    /// Local directory holding the fetched metadata of a mirror.
    fn skel_dir(&self, mirror: &Mirror) -> PathBuf {
        self.config
            .skel_path()
            .join(self.encoder.sanitise_uri(mirror.url()))
    }

    /// Protect fetched metadata and the uncompressed variants of compressed files.
    fn protect_metadata(&self, ledger: &mut Ledger, tasks: &[DownloadTask]) {
        for task in tasks {
            let path = self.encoder.sanitise_uri(task.url());

            if let Some(plain) = COMPRESSION_EXTENSIONS
                .iter()
                .find_map(|ext| path.strip_suffix(ext))
            {
                ledger.protect(plain);
            }

            ledger.protect(path);
        }
    }

    async fn fetch_metadata(
        &self,
        scheduler: &FetchScheduler<'_>,
        stage: &str,
        tasks: Vec<DownloadTask>,
        ledger: &mut Ledger,
        metadata_urls: &mut Vec<String>,
        progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
    ) -> Result<()> {
        self.protect_metadata(ledger, &tasks);
        metadata_urls.extend(tasks.iter().map(|t| t.url().to_string()));

        scheduler
            .run(stage, tasks, &self.config.skel_path(), progress_cb)
            .await?;

        Ok(())
    }

    /// Parse every fetched `Sources` and `Packages` index and plan archive downloads.
    ///
    /// Every advertised file is recorded in `ledger`.
    pub fn plan_archive(
        &self,
        ledger: &mut Ledger,
        progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
    ) -> Result<DownloadPlan> {
        let skel_path = self.config.skel_path();
        let mut processor = IndexProcessor::new(self.encoder, self.config.mirror_path());
        let mut plan = DownloadPlan::default();

        for (mirror, suite) in self.topology.iter_suites() {
            let indices = suite
                .source_index_paths()
                .into_iter()
                .chain(suite.package_index_paths());

            for index in indices {
                let local = skel_path.join(self.encoder.sanitise_uri(&mirror.url_for(&index)));

                if !materialize_index(&local).is_available() {
                    warn!("index {} is not available", local.display());
                    continue;
                }

                let files = processor.process_index(mirror, &local, ledger, &mut plan)?;

                emit(
                    progress_cb,
                    MirrorEvent::IndexProcessed {
                        path: mirror.url_for(&index),
                        files,
                    },
                );
            }
        }

        processor.clear_cache();

        Ok(plan)
    }

    /// Perform a mirror update with the `wget` and `rsync` transfer agents.
    pub async fn run(
        &self,
        progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
    ) -> Result<RunSummary> {
        let agent = CommandTransferAgent::new(self.config.transfer_settings());

        self.run_with_agent(&agent, progress_cb).await
    }

    /// Perform a mirror update moving bytes with the given agent.
    ///
    /// The run lock is held for the duration. It is left behind if the run
    /// fails.
    pub async fn run_with_agent(
        &self,
        agent: &dyn TransferAgent,
        progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
    ) -> Result<RunSummary> {
        let var_path = self.config.var_path();
        let mirror_path = self.config.mirror_path();
        let skel_path = self.config.skel_path();

        let lock = RunLock::acquire(&var_path)?;

        for dir in [&mirror_path, &skel_path] {
            std::fs::create_dir_all(dir)
                .map_err(|e| MirrorError::IoPath(format!("{}", dir.display()), e))?;
        }

        let scheduler = FetchScheduler::new(
            agent,
            self.config.strategy,
            self.config.nthreads,
            &var_path,
        );

        let mut ledger = Ledger::default();
        for path in self.config.protected_paths() {
            ledger.protect(path);
        }

        let mut metadata_urls = vec![];

        info!("fetching index files");
        self.fetch_metadata(
            &scheduler,
            "index",
            self.index_tasks(),
            &mut ledger,
            &mut metadata_urls,
            progress_cb,
        )
        .await?;

        info!("fetching translation catalogs");
        self.fetch_metadata(
            &scheduler,
            "translation",
            self.translation_tasks(),
            &mut ledger,
            &mut metadata_urls,
            progress_cb,
        )
        .await?;

        info!("fetching DEP-11 and command-not-found catalogs");
        self.fetch_metadata(
            &scheduler,
            "dep11",
            self.secondary_tasks(),
            &mut ledger,
            &mut metadata_urls,
            progress_cb,
        )
        .await?;

        info!("processing indexes");
        let plan = self.plan_archive(&mut ledger, progress_cb)?;
        ledger.write_artifacts(&var_path)?;

        let download_files = plan.len();
        let download_bytes = plan.total_bytes();

        info!(
            "{} will be downloaded into archive",
            format_bytes(download_bytes)
        );
        emit(
            progress_cb,
            MirrorEvent::DownloadSize {
                files: download_files,
                bytes: download_bytes,
            },
        );

        scheduler
            .run("archive", plan.into_tasks(), &mirror_path, progress_cb)
            .await?;

        info!("copying metadata into the mirror");
        let copy = copy_skeleton(
            &metadata_urls,
            &self.encoder,
            &skel_path,
            &mirror_path,
            self.config.unlink,
        );
        emit(progress_cb, MirrorEvent::SkeletonCopied(copy));

        info!("scanning for unneeded files");
        let cleanup = CleanupScanner::new(&mirror_path, &ledger, self.encoder)
            .scan(&self.config.clean_paths())?;

        emit(
            progress_cb,
            MirrorEvent::CleanupPlanned {
                files: cleanup.files.len(),
                directories: cleanup.directories.len(),
                bytes: cleanup.reclaimable_bytes,
            },
        );

        if self.config.autoclean {
            cleanup.execute(&mirror_path)?;
            emit(progress_cb, MirrorEvent::CleanupExecuted);
        } else {
            let script = self.config.cleanscript();
            cleanup.write_script(&mirror_path, &script)?;
            emit(
                progress_cb,
                MirrorEvent::CleanupScriptWritten(format!("{}", script.display())),
            );
        }

        lock.release()?;

        Ok(RunSummary {
            metadata_urls: metadata_urls.len(),
            download_files,
            download_bytes,
            copy,
            cleanup,
        })
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Concurrent dispatch of downloads to external transfer agents.

A fetch phase takes a list of [DownloadTask] and runs them through a bounded
number of workers. Bytes are moved by external programs: `wget` for HTTP and
FTP URLs, `rsync` for `rsync://` URLs. The scheduler only guarantees that every
task is handed to an agent exactly once and that every worker has exited
before the phase returns. Whether an individual transfer succeeded is up to
the agent and its own retry policy.

Two [Strategy] variants are available:

* [Strategy::Queue] has workers pull one task at a time from a shared queue.
* [Strategy::BatchSplit] partitions the tasks up front into one contiguous
  batch per worker and hands each batch to a single agent invocation.
*/

use {
    crate::{
        error::{MirrorError, Result},
        mirror::MirrorEvent,
        paths::PathEncoder,
    },
    async_trait::async_trait,
    futures::StreamExt,
    log::{debug, warn},
    serde::Deserialize,
    std::{
        collections::{BTreeMap, VecDeque},
        path::{Path, PathBuf},
    },
    tokio::{process::Command, sync::Mutex},
};

/// How tasks are distributed between workers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Workers repeatedly pop single tasks from a shared queue.
    Queue,
    /// Tasks are split into one contiguous batch per worker.
    BatchSplit,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::Queue
    }
}

/// The transfer mechanism a URL needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferScheme {
    /// HTTP, HTTPS and FTP, handled by `wget`.
    Http,
    /// The rsync protocol, handled by `rsync`.
    Rsync,
}

impl TransferScheme {
    /// Classify a URL by its scheme.
    pub fn of_url(url: &str) -> Self {
        match url.split_once("://") {
            Some((scheme, _)) if scheme.eq_ignore_ascii_case("rsync") => Self::Rsync,
            _ => Self::Http,
        }
    }
}

/// A single file to fetch.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DownloadTask {
    url: String,
    base_url: String,
    path: String,
    size: Option<u64>,
}

impl DownloadTask {
    /// Construct an instance from a repository base URL and a path relative to it.
    ///
    /// The path and resulting URL are normalized and encoded by `encoder`.
    pub fn new(encoder: &PathEncoder, base_url: &str, path: &str, size: Option<u64>) -> Self {
        let base_url = encoder.normalize(base_url);
        let path = encoder.normalize(path.trim_start_matches('/'));

        Self {
            url: encoder.normalize(&format!("{}/{}", base_url, path)),
            base_url,
            path,
            size,
        }
    }

    /// The absolute source URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The repository base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The path relative to [Self::base_url()].
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The advertised size, if known.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// The transfer mechanism for this task.
    pub fn scheme(&self) -> TransferScheme {
        TransferScheme::of_url(&self.url)
    }
}

/// Proxy options passed to the HTTP transfer agent.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProxySettings {
    pub http: Option<String>,
    pub https: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Options shared by every transfer agent invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferSettings {
    /// Rate limit in `wget` notation, e.g. `100m` or `500k`.
    pub limit_rate: String,
    pub auth_no_challenge: bool,
    pub no_check_certificate: bool,
    /// Remove existing files before writing instead of updating them in place.
    pub unlink: bool,
    pub proxy: Option<ProxySettings>,
    pub encoder: PathEncoder,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            limit_rate: "100m".to_string(),
            auth_no_challenge: false,
            no_check_certificate: false,
            unlink: false,
            proxy: None,
            encoder: PathEncoder::default(),
        }
    }
}

impl TransferSettings {
    /// Arguments to `wget`, excluding the log file and URL arguments.
    pub fn wget_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-cache".to_string(),
            format!("--limit-rate={}", self.limit_rate),
            "-t".to_string(),
            "5".to_string(),
            "-r".to_string(),
            "-N".to_string(),
            "-l".to_string(),
            "inf".to_string(),
        ];

        if self.auth_no_challenge {
            args.push("--auth-no-challenge".to_string());
        }
        if self.no_check_certificate {
            args.push("--no-check-certificate".to_string());
        }
        if self.unlink {
            args.push("--unlink".to_string());
        }

        if let Some(proxy) = &self.proxy {
            let mut execute = vec![];

            if proxy.http.is_some() || proxy.https.is_some() {
                execute.push("use_proxy=yes".to_string());
            }
            if let Some(v) = &proxy.http {
                execute.push(format!("http_proxy={}", v));
            }
            if let Some(v) = &proxy.https {
                execute.push(format!("https_proxy={}", v));
            }
            if let Some(v) = &proxy.user {
                execute.push(format!("proxy_user={}", v));
            }
            if let Some(v) = &proxy.password {
                execute.push(format!("proxy_password={}", v));
            }

            for command in execute {
                args.push("-e".to_string());
                args.push(command);
            }
        }

        args
    }

    /// Arguments to `rsync`, excluding the log file, source and destination arguments.
    pub fn rsync_args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            "--no-motd".to_string(),
            format!("--bwlimit={}", self.rsync_bwlimit()),
        ];

        if !self.unlink {
            args.push("--inplace".to_string());
        }

        args
    }

    /// Express the rate limit the way `rsync` understands it.
    ///
    /// `wget` reads a bare number as bytes per second while `rsync` reads it as
    /// KiB per second. Suffixed values mean the same thing to both.
    fn rsync_bwlimit(&self) -> String {
        let rate = self.limit_rate.trim();

        match rate.parse::<u64>() {
            Ok(bytes) => format!("{}", std::cmp::max(bytes / 1024, 1)),
            Err(_) => rate.to_string(),
        }
    }
}

/// Where a worker writes its files.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    /// Name of the fetch phase, e.g. `index` or `archive`.
    pub stage: String,
    /// Index of this worker within the phase.
    pub worker: usize,
    /// Root directory downloads are written under.
    pub dest: PathBuf,
    /// Directory holding URL lists and logs.
    pub work_dir: PathBuf,
}

impl WorkerContext {
    /// Log file of this worker's agent invocations.
    pub fn log_path(&self) -> PathBuf {
        self.work_dir
            .join(format!("{}-log.{}", self.stage, self.worker))
    }

    /// URL list of this worker's HTTP batch.
    pub fn urls_path(&self) -> PathBuf {
        self.work_dir
            .join(format!("{}-urls.{}", self.stage, self.worker))
    }

    /// File list of one rsync batch of this worker.
    pub fn files_path(&self, batch: usize) -> PathBuf {
        self.work_dir
            .join(format!("{}-files.{}.{}", self.stage, self.worker, batch))
    }
}

/// Something that moves the bytes of download tasks.
#[async_trait]
pub trait TransferAgent: Sync {
    /// Transfer one task.
    async fn fetch_one(&self, context: &WorkerContext, task: &DownloadTask) -> Result<()>;

    /// Transfer a batch of tasks.
    async fn fetch_batch(&self, context: &WorkerContext, tasks: &[DownloadTask]) -> Result<()>;
}

/// A [TransferAgent] running `wget` and `rsync` subprocesses.
///
/// Exit statuses are not inspected. Only failing to start a program is an error.
#[derive(Clone, Debug)]
pub struct CommandTransferAgent {
    settings: TransferSettings,
    wget: PathBuf,
    rsync: PathBuf,
}

impl Default for CommandTransferAgent {
    fn default() -> Self {
        Self::new(TransferSettings::default())
    }
}

impl CommandTransferAgent {
    /// Construct an instance from transfer settings.
    ///
    /// `wget` and `rsync` are resolved through `PATH`.
    pub fn new(settings: TransferSettings) -> Self {
        Self {
            settings,
            wget: PathBuf::from("wget"),
            rsync: PathBuf::from("rsync"),
        }
    }

    /// Use the given executables instead of the `wget` and `rsync` found on `PATH`.
    pub fn with_programs(mut self, wget: impl AsRef<Path>, rsync: impl AsRef<Path>) -> Self {
        self.wget = wget.as_ref().to_path_buf();
        self.rsync = rsync.as_ref().to_path_buf();
        self
    }

    async fn run(&self, program: &Path, args: Vec<String>, cwd: &Path) -> Result<()> {
        debug!("running {} {}", program.display(), args.join(" "));

        let status = Command::new(program)
            .args(&args)
            .current_dir(cwd)
            .status()
            .await
            .map_err(|e| MirrorError::IoPath(format!("{}", program.display()), e))?;

        debug!("{} exited with {}", program.display(), status);

        Ok(())
    }

    async fn wget(&self, context: &WorkerContext, source: Vec<String>) -> Result<()> {
        let mut args = self.settings.wget_args();
        args.push("-o".to_string());
        args.push(context.log_path().display().to_string());
        args.extend(source);

        self.run(&self.wget, args, &context.dest).await
    }

    async fn rsync(&self, context: &WorkerContext, extra: Vec<String>) -> Result<()> {
        let mut args = self.settings.rsync_args();
        args.push("--log-file".to_string());
        args.push(context.log_path().display().to_string());
        args.extend(extra);

        self.run(&self.rsync, args, &context.dest).await
    }

    /// Fetch HTTP tasks with a single `wget -i` over a URL list.
    async fn wget_list(&self, context: &WorkerContext, tasks: &[&DownloadTask]) -> Result<()> {
        let urls_path = context.urls_path();
        write_lines(&urls_path, tasks.iter().map(|t| t.url())).await?;

        self.wget(
            context,
            vec!["-i".to_string(), urls_path.display().to_string()],
        )
        .await
    }

    /// Fetch rsync tasks sharing `base_url` with a single `rsync --files-from`.
    async fn rsync_list(
        &self,
        context: &WorkerContext,
        batch: usize,
        base_url: &str,
        tasks: &[&DownloadTask],
    ) -> Result<()> {
        let files_path = context.files_path(batch);
        write_lines(&files_path, tasks.iter().map(|t| t.path())).await?;

        let target = context
            .dest
            .join(self.settings.encoder.sanitise_uri(base_url));
        create_dir(&target).await?;

        self.rsync(
            context,
            vec![
                "--files-from".to_string(),
                files_path.display().to_string(),
                format!("{}/", base_url),
                format!("{}/", target.display()),
            ],
        )
        .await
    }
}

async fn create_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| MirrorError::IoPath(format!("{}", path.display()), e))
}

async fn write_lines<'a>(path: &Path, lines: impl Iterator<Item = &'a str>) -> Result<()> {
    let content = lines.map(|l| format!("{}\n", l)).collect::<String>();

    tokio::fs::write(path, content)
        .await
        .map_err(|e| MirrorError::IoPath(format!("{}", path.display()), e))
}

#[async_trait]
impl TransferAgent for CommandTransferAgent {
    async fn fetch_one(&self, context: &WorkerContext, task: &DownloadTask) -> Result<()> {
        match task.scheme() {
            TransferScheme::Http => self.wget(context, vec![task.url().to_string()]).await,
            TransferScheme::Rsync => {
                let target = context
                    .dest
                    .join(self.settings.encoder.sanitise_uri(task.url()));

                if let Some(parent) = target.parent() {
                    create_dir(parent).await?;
                }

                self.rsync(
                    context,
                    vec![task.url().to_string(), target.display().to_string()],
                )
                .await
            }
        }
    }

    /// Every invocation of the batch is attempted even when an earlier one fails.
    ///
    /// The first failure is returned once all invocations have run.
    async fn fetch_batch(&self, context: &WorkerContext, tasks: &[DownloadTask]) -> Result<()> {
        let mut failure = None;

        let http = tasks
            .iter()
            .filter(|t| t.scheme() == TransferScheme::Http)
            .collect::<Vec<_>>();

        if !http.is_empty() {
            if let Err(e) = self.wget_list(context, &http).await {
                warn!(
                    "{} worker {}: wget batch of {} files failed: {}",
                    context.stage,
                    context.worker,
                    http.len(),
                    e
                );
                failure.get_or_insert(e);
            }
        }

        // rsync takes a single source root per invocation.
        let mut by_base: BTreeMap<&str, Vec<&DownloadTask>> = BTreeMap::new();
        for task in tasks.iter().filter(|t| t.scheme() == TransferScheme::Rsync) {
            by_base.entry(task.base_url()).or_default().push(task);
        }

        for (batch, (base_url, tasks)) in by_base.into_iter().enumerate() {
            if let Err(e) = self.rsync_list(context, batch, base_url, &tasks).await {
                warn!(
                    "{} worker {}: rsync batch of {} files from {} failed: {}",
                    context.stage,
                    context.worker,
                    tasks.len(),
                    base_url,
                    e
                );
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Split items into `workers` contiguous batches.
///
/// Each batch takes the floor of the remaining items divided by the remaining
/// workers, so later batches absorb the remainder. 10 items over 3 workers
/// yields batches of 3, 3 and 4.
pub fn split_batches<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let mut remaining = items.into_iter();
    let mut left = remaining.len();

    (0..workers)
        .map(|i| {
            let amount = left / (workers - i);
            left -= amount;

            remaining.by_ref().take(amount).collect::<Vec<_>>()
        })
        .collect()
}

/// Runs fetch phases over a bounded number of workers.
pub struct FetchScheduler<'a> {
    agent: &'a dyn TransferAgent,
    strategy: Strategy,
    max_workers: usize,
    work_dir: PathBuf,
}

impl<'a> FetchScheduler<'a> {
    /// Construct an instance.
    ///
    /// `work_dir` receives per phase URL lists and agent logs.
    pub fn new(
        agent: &'a dyn TransferAgent,
        strategy: Strategy,
        max_workers: usize,
        work_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            agent,
            strategy,
            max_workers: std::cmp::max(max_workers, 1),
            work_dir: work_dir.as_ref().to_path_buf(),
        }
    }

    /// The number of workers a phase of `tasks` tasks uses.
    pub fn worker_count(&self, tasks: usize) -> usize {
        std::cmp::min(self.max_workers, tasks)
    }

    /// Fetch every task into `dest`, returning once all workers have exited.
    ///
    /// Agent errors are logged and do not fail the phase. Returns the number of
    /// workers that ran.
    pub async fn run(
        &self,
        stage: &str,
        tasks: Vec<DownloadTask>,
        dest: &Path,
        progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
    ) -> Result<usize> {
        write_lines(
            &self.work_dir.join(format!("{}-urls", stage)),
            tasks.iter().map(|t| t.url()),
        )
        .await?;

        let workers = self.worker_count(tasks.len());

        if let Some(cb) = progress_cb {
            cb(MirrorEvent::FetchBegin {
                stage: stage.to_string(),
                files: tasks.len(),
                workers,
            });
        }

        if workers == 0 {
            if let Some(cb) = progress_cb {
                cb(MirrorEvent::FetchEnd {
                    stage: stage.to_string(),
                });
            }

            return Ok(0);
        }

        let context = |worker| WorkerContext {
            stage: stage.to_string(),
            worker,
            dest: dest.to_path_buf(),
            work_dir: self.work_dir.clone(),
        };

        let mut remaining = workers;
        let mut finished = |worker: usize, res: Result<()>| {
            if let Err(e) = res {
                warn!("{} worker {} failed: {}", stage, worker, e);
            }

            remaining -= 1;

            if let Some(cb) = progress_cb {
                cb(MirrorEvent::WorkerFinished {
                    stage: stage.to_string(),
                    remaining,
                });
            }
        };

        match self.strategy {
            Strategy::Queue => {
                let queue = Mutex::new(tasks.into_iter().collect::<VecDeque<_>>());
                let queue = &queue;

                let fs = (0..workers).map(|worker| {
                    let context = context(worker);

                    async move {
                        loop {
                            let task = queue.lock().await.pop_front();

                            match task {
                                Some(task) => {
                                    if let Err(e) = self.agent.fetch_one(&context, &task).await {
                                        warn!("unable to fetch {}: {}", task.url(), e);
                                    }
                                }
                                None => break,
                            }
                        }

                        (worker, Ok(()))
                    }
                });

                let mut buffered = futures::stream::iter(fs).buffer_unordered(workers);

                while let Some((worker, res)) = buffered.next().await {
                    finished(worker, res);
                }
            }
            Strategy::BatchSplit => {
                let fs = split_batches(tasks, workers)
                    .into_iter()
                    .enumerate()
                    .map(|(worker, batch)| {
                        let context = context(worker);

                        async move {
                            let res = self.agent.fetch_batch(&context, &batch).await;

                            (worker, res)
                        }
                    });

                let mut buffered = futures::stream::iter(fs).buffer_unordered(workers);

                while let Some((worker, res)) = buffered.next().await {
                    finished(worker, res);
                }
            }
        }

        if let Some(cb) = progress_cb {
            cb(MirrorEvent::FetchEnd {
                stage: stage.to_string(),
            });
        }

        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{Arc, Mutex as StdMutex},
    };

    #[derive(Default)]
    struct RecordingAgent {
        single: StdMutex<Vec<(usize, String)>>,
        batches: StdMutex<Vec<(usize, Vec<String>)>>,
    }

    #[async_trait]
    impl TransferAgent for RecordingAgent {
        async fn fetch_one(&self, context: &WorkerContext, task: &DownloadTask) -> Result<()> {
            tokio::task::yield_now().await;

            if let Ok(mut single) = self.single.lock() {
                single.push((context.worker, task.url().to_string()));
            }

            Ok(())
        }

        async fn fetch_batch(
            &self,
            context: &WorkerContext,
            tasks: &[DownloadTask],
        ) -> Result<()> {
            if let Ok(mut batches) = self.batches.lock() {
                batches.push((
                    context.worker,
                    tasks.iter().map(|t| t.url().to_string()).collect(),
                ));
            }

            Ok(())
        }
    }

    fn tasks(count: usize) -> Vec<DownloadTask> {
        let encoder = PathEncoder::default();

        (0..count)
            .map(|i| {
                DownloadTask::new(
                    &encoder,
                    "http://deb.example.com/debian/",
                    &format!("pool/main/p{}.deb", i),
                    Some(i as u64),
                )
            })
            .collect()
    }

    #[test]
    fn task_urls() {
        let encoder = PathEncoder::new(true);
        let task = DownloadTask::new(&encoder, "rsync://host/~u/debian/", "/pool//a.deb", None);

        assert_eq!(task.url(), "rsync://host/%7Eu/debian/pool/a.deb");
        assert_eq!(task.base_url(), "rsync://host/%7Eu/debian");
        assert_eq!(task.path(), "pool/a.deb");
        assert_eq!(task.scheme(), TransferScheme::Rsync);
        assert_eq!(TransferScheme::of_url("ftp://x/y"), TransferScheme::Http);
    }

    #[test]
    fn batch_split_sizes() {
        let batches = split_batches((0..10).collect::<Vec<_>>(), 3);

        assert_eq!(
            batches,
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8, 9]]
        );

        let batches = split_batches((0..2).collect::<Vec<_>>(), 2);
        assert_eq!(batches, vec![vec![0], vec![1]]);

        assert!(split_batches(Vec::<u8>::new(), 0).is_empty());
    }

    #[test]
    fn wget_arguments() {
        let settings = TransferSettings {
            limit_rate: "500k".to_string(),
            no_check_certificate: true,
            proxy: Some(ProxySettings {
                http: Some("http://proxy:3128".to_string()),
                user: Some("me".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(
            settings.wget_args(),
            vec![
                "--no-cache",
                "--limit-rate=500k",
                "-t",
                "5",
                "-r",
                "-N",
                "-l",
                "inf",
                "--no-check-certificate",
                "-e",
                "use_proxy=yes",
                "-e",
                "http_proxy=http://proxy:3128",
                "-e",
                "proxy_user=me",
            ]
        );
    }

    #[test]
    fn rsync_arguments() {
        let mut settings = TransferSettings::default();
        assert_eq!(
            settings.rsync_args(),
            vec!["-t", "--no-motd", "--bwlimit=100m", "--inplace"]
        );

        settings.unlink = true;
        settings.limit_rate = "10240".to_string();
        assert_eq!(settings.rsync_args(), vec!["-t", "--no-motd", "--bwlimit=10"]);
    }

    #[tokio::test]
    async fn batch_mode_attempts_each_task_once() -> Result<()> {
        let td = tempfile::tempdir()?;
        let agent = RecordingAgent::default();
        let scheduler = FetchScheduler::new(&agent, Strategy::BatchSplit, 3, td.path());

        let remaining = Arc::new(StdMutex::new(vec![]));
        let observed = remaining.clone();
        let cb: Option<Box<dyn Fn(MirrorEvent) + Sync>> = Some(Box::new(move |event: MirrorEvent| {
            if let MirrorEvent::WorkerFinished { remaining: r, .. } = event {
                if let Ok(mut observed) = observed.lock() {
                    observed.push(r);
                }
            }
        }));

        let workers = scheduler.run("archive", tasks(10), td.path(), &cb).await?;
        assert_eq!(workers, 3);

        let mut batches = agent.batches.into_inner().unwrap();
        batches.sort();

        assert_eq!(
            batches.iter().map(|(_, b)| b.len()).collect::<Vec<_>>(),
            vec![3, 3, 4]
        );

        let mut urls = batches
            .into_iter()
            .flat_map(|(_, b)| b)
            .collect::<Vec<_>>();
        urls.sort();
        urls.dedup();
        assert_eq!(urls.len(), 10);

        assert_eq!(*remaining.lock().unwrap(), vec![2, 1, 0]);

        let listed = std::fs::read_to_string(td.path().join("archive-urls"))?;
        assert_eq!(listed.lines().count(), 10);

        Ok(())
    }

    #[tokio::test]
    async fn queue_mode_attempts_each_task_once() -> Result<()> {
        let td = tempfile::tempdir()?;
        let agent = RecordingAgent::default();
        let scheduler = FetchScheduler::new(&agent, Strategy::Queue, 4, td.path());

        let workers = scheduler.run("index", tasks(25), td.path(), &None).await?;
        assert_eq!(workers, 4);

        let single = agent.single.into_inner().unwrap();
        assert_eq!(single.len(), 25);

        let mut urls = single.into_iter().map(|(_, url)| url).collect::<Vec<_>>();
        urls.sort();
        urls.dedup();
        assert_eq!(urls.len(), 25);

        Ok(())
    }

    #[tokio::test]
    async fn fewer_tasks_than_workers() -> Result<()> {
        let td = tempfile::tempdir()?;
        let agent = RecordingAgent::default();
        let scheduler = FetchScheduler::new(&agent, Strategy::BatchSplit, 20, td.path());

        assert_eq!(scheduler.run("dep11", tasks(2), td.path(), &None).await?, 2);
        assert_eq!(scheduler.run("dep11", vec![], td.path(), &None).await?, 0);
        assert_eq!(agent.batches.into_inner().unwrap().len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn empty_phase_events_are_balanced() -> Result<()> {
        let td = tempfile::tempdir()?;
        let agent = RecordingAgent::default();
        let scheduler = FetchScheduler::new(&agent, Strategy::Queue, 4, td.path());

        let events = Arc::new(StdMutex::new(vec![]));
        let observed = events.clone();
        let cb: Option<Box<dyn Fn(MirrorEvent) + Sync>> = Some(Box::new(move |event: MirrorEvent| {
            let name = match event {
                MirrorEvent::FetchBegin { stage, workers, .. } => format!("begin {} {}", stage, workers),
                MirrorEvent::FetchEnd { stage } => format!("end {}", stage),
                _ => "other".to_string(),
            };

            if let Ok(mut observed) = observed.lock() {
                observed.push(name);
            }
        }));

        assert_eq!(scheduler.run("translation", vec![], td.path(), &cb).await?, 0);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["begin translation 0".to_string(), "end translation".to_string()]
        );
        assert_eq!(
            std::fs::read_to_string(td.path().join("translation-urls"))?,
            ""
        );

        Ok(())
    }

    /// Write a shell script that appends its arguments, one per line, to a record file.
    #[cfg(unix)]
    fn recording_program(dir: &Path, name: &str) -> std::io::Result<(PathBuf, PathBuf)> {
        use std::os::unix::fs::PermissionsExt;

        std::fs::create_dir_all(dir)?;

        let program = dir.join(name);
        let record = dir.join(format!("{}.record", name));

        std::fs::write(
            &program,
            indoc::formatdoc! {"
                #!/bin/sh
                printf '%s\\n' \"$@\" >> '{record}'
                echo --- >> '{record}'
                ",
                record = record.display(),
            },
        )?;
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755))?;

        Ok((program, record))
    }

    #[cfg(unix)]
    fn invocations(record: &Path) -> std::io::Result<Vec<Vec<String>>> {
        let data = match std::fs::read_to_string(record) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };

        Ok(data
            .split_terminator("---\n")
            .map(|call| call.lines().map(|l| l.to_string()).collect())
            .collect())
    }

    #[cfg(unix)]
    fn command_context(root: &Path, stage: &str) -> std::io::Result<WorkerContext> {
        let context = WorkerContext {
            stage: stage.to_string(),
            worker: 0,
            dest: root.join("skel"),
            work_dir: root.join("var"),
        };

        std::fs::create_dir_all(&context.dest)?;
        std::fs::create_dir_all(&context.work_dir)?;

        Ok(context)
    }

    #[cfg(unix)]
    fn expected_args(mut args: Vec<String>, extra: &[&str]) -> Vec<String> {
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_agent_batch_groups_by_scheme_and_base() -> Result<()> {
        let td = tempfile::tempdir()?;
        let bin = td.path().join("bin");
        let (wget, wget_record) = recording_program(&bin, "wget")?;
        let (rsync, rsync_record) = recording_program(&bin, "rsync")?;

        let agent = CommandTransferAgent::default().with_programs(&wget, &rsync);
        let context = command_context(td.path(), "archive")?;

        let encoder = PathEncoder::default();
        let tasks = vec![
            DownloadTask::new(&encoder, "rsync://b.example/debian", "pool/b1.deb", None),
            DownloadTask::new(&encoder, "http://h.example/debian", "pool/h.deb", None),
            DownloadTask::new(&encoder, "rsync://a.example/debian/", "pool/a1.deb", None),
            DownloadTask::new(&encoder, "rsync://b.example/debian", "pool/b2.deb", None),
        ];

        agent.fetch_batch(&context, &tasks).await?;

        let log = context.log_path().display().to_string();
        let urls = context.urls_path();
        let files_a = context.files_path(0);
        let files_b = context.files_path(1);

        assert_eq!(
            std::fs::read_to_string(&urls)?,
            "http://h.example/debian/pool/h.deb\n"
        );
        assert_eq!(std::fs::read_to_string(&files_a)?, "pool/a1.deb\n");
        assert_eq!(
            std::fs::read_to_string(&files_b)?,
            "pool/b1.deb\npool/b2.deb\n"
        );

        let settings = TransferSettings::default();

        assert_eq!(
            invocations(&wget_record)?,
            vec![expected_args(
                settings.wget_args(),
                &["-o", &log, "-i", &urls.display().to_string()]
            )]
        );

        let target_a = context.dest.join("a.example/debian");
        let target_b = context.dest.join("b.example/debian");
        assert!(target_a.is_dir());
        assert!(target_b.is_dir());

        assert_eq!(
            invocations(&rsync_record)?,
            vec![
                expected_args(
                    settings.rsync_args(),
                    &[
                        "--log-file",
                        &log,
                        "--files-from",
                        &files_a.display().to_string(),
                        "rsync://a.example/debian/",
                        &format!("{}/", target_a.display()),
                    ]
                ),
                expected_args(
                    settings.rsync_args(),
                    &[
                        "--log-file",
                        &log,
                        "--files-from",
                        &files_b.display().to_string(),
                        "rsync://b.example/debian/",
                        &format!("{}/", target_b.display()),
                    ]
                ),
            ]
        );

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_agent_single_targets() -> Result<()> {
        let td = tempfile::tempdir()?;
        let bin = td.path().join("bin");
        let (wget, wget_record) = recording_program(&bin, "wget")?;
        let (rsync, rsync_record) = recording_program(&bin, "rsync")?;

        let agent = CommandTransferAgent::default().with_programs(&wget, &rsync);
        let context = command_context(td.path(), "index")?;
        let log = context.log_path().display().to_string();
        let settings = TransferSettings::default();

        let encoder = PathEncoder::default();
        let rsync_task = DownloadTask::new(
            &encoder,
            "rsync://mirror@a.example:873/debian",
            "dists/sid/main/binary-amd64/Packages.xz",
            None,
        );
        let http_task = DownloadTask::new(
            &encoder,
            "http://h.example/debian",
            "dists/sid/InRelease",
            None,
        );

        agent.fetch_one(&context, &rsync_task).await?;
        agent.fetch_one(&context, &http_task).await?;

        let target = context
            .dest
            .join("a.example/debian/dists/sid/main/binary-amd64/Packages.xz");
        assert!(target.parent().map(|p| p.is_dir()).unwrap_or(false));

        assert_eq!(
            invocations(&rsync_record)?,
            vec![expected_args(
                settings.rsync_args(),
                &[
                    "--log-file",
                    &log,
                    "rsync://mirror@a.example:873/debian/dists/sid/main/binary-amd64/Packages.xz",
                    &target.display().to_string(),
                ]
            )]
        );
        assert_eq!(
            invocations(&wget_record)?,
            vec![expected_args(
                settings.wget_args(),
                &["-o", &log, "http://h.example/debian/dists/sid/InRelease"]
            )]
        );

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_agent_batch_continues_after_failure() -> Result<()> {
        let td = tempfile::tempdir()?;
        let bin = td.path().join("bin");
        let missing = bin.join("missing-wget");
        let (rsync, rsync_record) = recording_program(&bin, "rsync")?;

        let agent = CommandTransferAgent::default().with_programs(&missing, &rsync);
        let context = command_context(td.path(), "archive")?;

        let encoder = PathEncoder::default();
        let tasks = vec![
            DownloadTask::new(&encoder, "http://h.example/debian", "pool/h.deb", None),
            DownloadTask::new(&encoder, "rsync://a.example/debian", "pool/a.deb", None),
        ];

        match agent.fetch_batch(&context, &tasks).await {
            Err(MirrorError::IoPath(path, _)) => {
                assert_eq!(path, missing.display().to_string())
            }
            res => panic!("expected spawn failure; got {:?}", res),
        }
        assert_eq!(invocations(&rsync_record)?.len(), 1);

        // Through the scheduler the failure is logged and the phase completes.
        let scheduler = FetchScheduler::new(&agent, Strategy::BatchSplit, 1, &context.work_dir);
        assert_eq!(
            scheduler
                .run("archive", tasks.clone(), &context.dest, &None)
                .await?,
            1
        );
        assert_eq!(invocations(&rsync_record)?.len(), 2);

        Ok(())
    }
}

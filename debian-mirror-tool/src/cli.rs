// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    debian_mirror::{
        config::MirrorConfig,
        error::MirrorError,
        mirror::{MirrorEvent, MirrorRun},
    },
    log::LevelFilter,
    std::sync::{Arc, Mutex},
    thiserror::Error,
};

const CONFIG_ABOUT: &str = "\
Mirror configuration

Commands read their configuration from a YAML file holding a single mapping.
The following keys are recognized:

base_path (optional) (string)
   Root of the default directory layout. Defaults to /var/spool/apt-mirror.

mirror_path, skel_path, var_path (optional) (string)
   Where the published mirror, freshly fetched metadata and run artifacts
   are stored. Default to $base_path/mirror, $base_path/skel and
   $base_path/var.

cleanscript (optional) (string)
   Where the cleanup script is written. Defaults to $var_path/clean.sh.

nthreads (optional) (integer)
   Maximum number of concurrent transfers. Defaults to 20.

strategy (optional) (string)
   `queue` to have workers pull one file at a time or `batch-split` to
   divide files among workers up front. Defaults to `queue`.

limit_rate (optional) (string)
   Per transfer bandwidth limit. Defaults to 100m.

contents (optional) (bool)
   Whether to mirror Contents-<arch> indices. Defaults to true.

autoclean (optional) (bool)
   Remove unneeded files at the end of a run instead of writing the
   cleanup script.

tilde (optional) (bool)
   Store `~` in paths as `%7E`.

unlink (optional) (bool)
   Replace files instead of rewriting them in place.

auth_no_challenge, no_check_certificate (optional) (bool)
   Passed on to wget.

proxy (optional) (mapping)
   Keys `http`, `https`, `user` and `password`.

mirrors (mapping)
   Base URL to suite name to component name to a list of architectures.
   The architecture `src` mirrors source packages. A suite with the single
   component `\"\"` is a flat repository.

skip_clean, clean (optional) (list[string])
   URLs whose local copies are never cleaned, or cleaned. When `clean` is
   empty the whole mirror is cleaned.

Path values may reference $base_path, $mirror_path, $skel_path and
$var_path.
";

const MIRROR_ABOUT: &str = "\
Update a local mirror of Debian repositories.

A run fetches the index files of every configured suite, followed by the
translation, DEP-11 and command-not-found catalogs they advertise. Then
every package and source file whose local copy is missing or has the wrong
size is downloaded. Finally the fetched metadata is published into the
mirror and files no longer referenced are removed, or a script removing them
is written.

Files are transferred by running `wget` and `rsync`, which must be
installed.
";

#[derive(Debug, Error)]
pub enum MirrorToolError {
    #[error("argument parsing error: {0}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Mirror(#[from] MirrorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),
}

pub type Result<T> = std::result::Result<T, MirrorToolError>;

fn config_arg() -> Arg<'static> {
    Arg::new("config")
        .long("config")
        .short('c')
        .takes_value(true)
        .required(true)
        .allow_invalid_utf8(true)
        .help("Path to a YAML file defining the mirror configuration")
}

fn load_config(args: &ArgMatches) -> Result<MirrorConfig> {
    let path = args
        .value_of_os("config")
        .ok_or(MirrorToolError::MissingArgument("config"))?;

    let f = std::fs::File::open(path)?;

    Ok(serde_yaml::from_reader(f)?)
}

pub async fn run_cli() -> Result<()> {
    let app = Command::new("apt-mirror")
        .version("0.1")
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Mirror Debian repositories")
        .arg_required_else_help(true);

    let app = app.arg(
        Arg::new("verbose")
            .long("verbose")
            .short('v')
            .global(true)
            .multiple_occurrences(true)
            .help("Increase logging verbosity. Can be specified multiple times."),
    );

    let app = app.subcommand(
        Command::new("mirror")
            .about("Update a local mirror")
            .long_about(MIRROR_ABOUT)
            .arg(config_arg()),
    );

    let app = app.subcommand(
        Command::new("index-urls")
            .about("Print the URLs of the index files a mirror run fetches first")
            .arg(config_arg()),
    );

    let mut app =
        app.subcommand(Command::new("config").about("Print documentation about configuration files"));

    let matches = app.clone().get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("mirror", args)) => command_mirror(args).await,
        Some(("index-urls", args)) => command_index_urls(args),
        Some(("config", _)) => {
            println!("{}", CONFIG_ABOUT);
            Ok(())
        }
        Some((command, _)) => Err(MirrorToolError::InvalidSubCommand(command.to_string())),
        None => {
            app.print_help()?;
            Ok(())
        }
    }
}

fn command_index_urls(args: &ArgMatches) -> Result<()> {
    let run = MirrorRun::new(load_config(args)?)?;

    for task in run.index_tasks() {
        println!("{}", task.url());
    }

    Ok(())
}

async fn command_mirror(args: &ArgMatches) -> Result<()> {
    let run = MirrorRun::new(load_config(args)?)?;

    let pb = Arc::new(Mutex::new(None));

    let cb: Box<dyn Fn(MirrorEvent) + Sync> = Box::new(move |event: MirrorEvent| match event {
        MirrorEvent::FetchBegin { ref stage, workers, .. } => {
            println!("{}", event);

            if workers > 0 {
                let mut bar = pbr::ProgressBar::new(workers as u64);
                bar.message(&format!("{} workers ", stage));

                if let Ok(mut guard) = pb.lock() {
                    guard.replace(bar);
                }
            }
        }
        MirrorEvent::WorkerFinished { .. } => {
            if let Ok(mut guard) = pb.lock() {
                if let Some(bar) = guard.as_mut() {
                    bar.inc();
                }
            }
        }
        MirrorEvent::FetchEnd { .. } => {
            if let Ok(mut guard) = pb.lock() {
                if let Some(mut bar) = guard.take() {
                    bar.finish();
                }
            }

            println!("{}", event);
        }
        MirrorEvent::IndexProcessed { .. } => {
            log::debug!("{}", event);
        }
        _ => {
            println!("{}", event);
        }
    });

    let summary = run.run(&Some(cb)).await?;

    println!(
        "{} metadata files and {} archive files processed",
        summary.metadata_urls, summary.download_files
    );

    Ok(())
}

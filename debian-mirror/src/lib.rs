// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Incremental mirroring of Debian repositories.

This crate maintains a local copy of one or more remote Debian repositories,
in the spirit of the classic `apt-mirror` tool. Bytes are moved by external
`wget` and `rsync` programs. This crate decides what to move, when to move it
and what to delete afterwards.

# A Tour of Functionality

The repositories to mirror are described by a [topology::Topology]: base URLs
holding [topology::Suite]s, which map components to architectures. A suite
knows the repository relative paths of every index file it needs.

Index files are *control files*. [control::ControlParagraphReader] streams their
paragraphs and [index::stanza_files()] interprets `Packages` and `Sources`
stanzas as the files they advertise. `Release` and `i18n/Index` files carry
checksum blocks, which [checksums::extract_checksum_block()] reads and which
the [catalog] module uses to discover translation, DEP-11 and
command-not-found catalogs.

[staleness::IndexProcessor] compares advertised files against the local mirror
tree by size, records every file in a [ledger::Ledger] and collects stale files
into a [staleness::DownloadPlan].

[fetch::FetchScheduler] runs download tasks through a bounded number of
workers, each handing work to a [fetch::TransferAgent].

[cleanup::CleanupScanner] walks the mirror tree and lists everything the ledger
does not need. The resulting [cleanup::CleanupPlan] is either executed or
rendered as a shell script.

[mirror::MirrorRun] strings all of this together, configured by a
[config::MirrorConfig].
*/

pub mod catalog;
pub mod checksums;
pub mod cleanup;
pub mod config;
pub mod control;
pub mod decompress;
pub mod error;
pub mod fetch;
pub mod index;
pub mod ledger;
pub mod lock;
pub mod mirror;
pub mod paths;
pub mod skel;
pub mod staleness;
pub mod topology;

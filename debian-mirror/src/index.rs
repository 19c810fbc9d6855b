// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Interpretation of `Packages` and `Sources` stanzas.

A stanza carrying a `Filename` field describes a single binary package file.
Any other stanza is treated as a source package, whose files are listed in the
`Files` field as `<md5> <size> <name>` lines relative to the `Directory` field.

Both kinds are reduced to [IndexFile] records holding the repository relative
path of the file, its advertised size and whatever digests the stanza carries.
*/

use {
    crate::{
        checksums::ChecksumType,
        control::ControlParagraph,
        error::{MirrorError, Result},
        paths::normalize_path,
    },
    std::collections::HashMap,
};

/// The kind of index a stanza came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StanzaKind {
    /// A binary package from a `Packages` index.
    Package,
    /// A source package from a `Sources` index.
    Source,
}

impl StanzaKind {
    /// Classify a stanza by the presence of its `Filename` field.
    pub fn of(paragraph: &ControlParagraph) -> Self {
        if paragraph.has_field("Filename") {
            Self::Package
        } else {
            Self::Source
        }
    }
}

/// A file advertised by an index stanza.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexFile {
    /// Normalized path relative to the repository base URL.
    pub path: String,
    /// Advertised size in bytes.
    pub size: u64,
    /// Digests of the file known from the stanza.
    pub digests: Vec<(ChecksumType, String)>,
}

impl IndexFile {
    /// The digest of the given type, if known.
    pub fn digest(&self, checksum: ChecksumType) -> Option<&str> {
        self.digests
            .iter()
            .find(|(t, _)| *t == checksum)
            .map(|(_, d)| d.as_str())
    }
}

/// Resolve the files a stanza advertises.
///
/// `source` names the index in error messages.
///
/// Binary stanzas need a `Filename` and a parsable `Size`. Every line of a
/// source stanza's `Files` and `Checksums-*` fields must be a well-formed
/// `<digest> <size> <name>` triple.
pub fn stanza_files(paragraph: &ControlParagraph, source: &str) -> Result<Vec<IndexFile>> {
    match StanzaKind::of(paragraph) {
        StanzaKind::Package => Ok(vec![package_file(paragraph, source)?]),
        StanzaKind::Source => source_files(paragraph, source),
    }
}

fn package_file(paragraph: &ControlParagraph, source: &str) -> Result<IndexFile> {
    let filename = paragraph
        .field_str("Filename")
        .ok_or_else(|| MirrorError::IndexFieldMissing(source.to_string(), "Filename"))?;

    let size = paragraph
        .field_str("Size")
        .ok_or_else(|| MirrorError::IndexFieldMissing(source.to_string(), "Size"))?;
    let size = size.trim().parse::<u64>().map_err(|_| {
        MirrorError::IndexFieldInvalid(source.to_string(), "Size", size.to_string())
    })?;

    let digests = [ChecksumType::Md5, ChecksumType::Sha1, ChecksumType::Sha256]
        .into_iter()
        .filter_map(|checksum| {
            paragraph
                .field_str(checksum.packages_field_name())
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(|v| (checksum, v.to_string()))
        })
        .collect();

    Ok(IndexFile {
        path: normalize_path(filename.trim()),
        size,
        digests,
    })
}

fn parse_triple<'a>(line: &'a str, source: &str) -> Result<(&'a str, u64, &'a str)> {
    let parts = line.split_ascii_whitespace().collect::<Vec<_>>();

    match *parts.as_slice() {
        [digest, size, name] => {
            let size = size.parse::<u64>().map_err(|_| {
                MirrorError::SourcesFilesMalformed(source.to_string(), line.to_string())
            })?;

            Ok((digest, size, name))
        }
        _ => Err(MirrorError::SourcesFilesMalformed(
            source.to_string(),
            line.to_string(),
        )),
    }
}

fn source_files(paragraph: &ControlParagraph, source: &str) -> Result<Vec<IndexFile>> {
    let directory = paragraph.field_str_or("Directory", "").trim();

    // Stronger digests are keyed by filename so they can be attached to the
    // entries of the `Files` field.
    let mut extra: HashMap<&str, Vec<(ChecksumType, String)>> = HashMap::new();

    for checksum in [ChecksumType::Sha1, ChecksumType::Sha256] {
        if let Some(lines) = paragraph.field_iter_value_lines(checksum.sources_field_name()) {
            for line in lines {
                let (digest, _, name) = parse_triple(line, source)?;
                extra
                    .entry(name)
                    .or_default()
                    .push((checksum, digest.to_string()));
            }
        }
    }

    let lines = match paragraph.field_iter_value_lines(ChecksumType::Md5.sources_field_name()) {
        Some(lines) => lines,
        None => return Ok(vec![]),
    };

    lines
        .map(|line| {
            let (digest, size, name) = parse_triple(line, source)?;

            let mut digests = vec![(ChecksumType::Md5, digest.to_string())];
            if let Some(more) = extra.get(name) {
                digests.extend(more.iter().cloned());
            }

            let path = if directory.is_empty() {
                normalize_path(name)
            } else {
                normalize_path(&format!("{}/{}", directory, name))
            };

            Ok(IndexFile {
                path,
                size,
                digests,
            })
        })
        .collect()
}

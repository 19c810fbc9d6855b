// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Checksum flavors and checksum block extraction.

`Release`, `InRelease` and `i18n/Index` files advertise further files in
blocks introduced by a header line such as `SHA256:`, followed by indented
`<checksum> <size> <path>` lines. [extract_checksum_block()] scans such a file
for the strongest header present and yields the entries of that block that
match a path predicate.
*/

use log::warn;

/// Checksum type / digest mechanism used in repository metadata.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChecksumType {
    /// MD5.
    Md5,

    /// SHA-1.
    Sha1,

    /// SHA-256.
    Sha256,
}

impl ChecksumType {
    /// Emit variants in their preferred usage order, strongest first.
    pub fn preferred_order() -> impl Iterator<Item = ChecksumType> {
        [Self::Sha256, Self::Sha1, Self::Md5].into_iter()
    }

    /// Name of the checksum block header in `Release` and `Index` files.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5Sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    /// Name of the field holding this digest in `Packages` stanzas.
    pub fn packages_field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    /// Name of the field holding file entries of this digest in `Sources` stanzas.
    pub fn sources_field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "Files",
            Self::Sha1 => "Checksums-Sha1",
            Self::Sha256 => "Checksums-Sha256",
        }
    }

    /// Filename of the run artifact listing digests of this type.
    pub fn ledger_filename(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    fn is_header(&self, line: &str) -> bool {
        line.trim_end()
            .strip_suffix(':')
            .map(|name| name == self.field_name())
            .unwrap_or(false)
    }
}

/// A single `<checksum> <size> <path>` entry of a checksum block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChecksumEntry<'a> {
    /// The hex digest.
    pub checksum: &'a str,
    /// The size of the file in bytes.
    pub size: u64,
    /// The path of the file, relative to the advertising file's directory.
    pub path: &'a str,
}

/// Extract the entries of the strongest checksum block in `data`.
///
/// Only the block for the strongest [ChecksumType] whose header is present is read.
/// A block ends at the first line that is not indented. Entries with the wrong
/// number of fields or an unparsable size are logged and skipped. `source` names
/// the file in log messages.
pub fn extract_checksum_block<'a>(
    data: &'a str,
    source: &str,
    predicate: impl Fn(&str) -> bool,
) -> Vec<ChecksumEntry<'a>> {
    let checksum = match ChecksumType::preferred_order()
        .find(|checksum| data.lines().any(|line| checksum.is_header(line)))
    {
        Some(checksum) => checksum,
        None => return vec![],
    };

    let mut entries = vec![];
    let mut in_block = false;

    for line in data.lines() {
        if in_block {
            if line.starts_with(' ') {
                if let Some(entry) = parse_entry(line, source) {
                    if predicate(entry.path) {
                        entries.push(entry);
                    }
                }
                continue;
            }

            in_block = false;
        }

        if checksum.is_header(line) {
            in_block = true;
        }
    }

    entries
}

fn parse_entry<'a>(line: &'a str, source: &str) -> Option<ChecksumEntry<'a>> {
    let parts = line.split_ascii_whitespace().collect::<Vec<_>>();

    match *parts.as_slice() {
        [checksum, size, path] => match size.parse::<u64>() {
            Ok(size) => Some(ChecksumEntry {
                checksum,
                size,
                path,
            }),
            Err(_) => {
                warn!("malformed checksum line \"{}\" in {}", line, source);
                None
            }
        },
        _ => {
            warn!("malformed checksum line \"{}\" in {}", line, source);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    const RELEASE: &str = indoc! {"
        Origin: Debian
        Suite: stable
        MD5Sum:
         0123456789abcdef0123456789abcdef  1111 main/binary-amd64/Packages
         0123456789abcdef0123456789abcdef  2222 main/i18n/Translation-en.bz2
        SHA256:
         deadbeef 1234 main/i18n/Translation-en.bz2
         deadbeef 99 main/binary-amd64/Packages.xz
         malformed line
         cafebabe notanumber main/i18n/Translation-de.bz2
        Acquire-By-Hash: yes
         feedface 5 not/part/of/a/block
    "};

    #[test]
    fn strongest_block_only() {
        let entries = extract_checksum_block(RELEASE, "Release", |_| true);

        assert_eq!(
            entries,
            vec![
                ChecksumEntry {
                    checksum: "deadbeef",
                    size: 1234,
                    path: "main/i18n/Translation-en.bz2",
                },
                ChecksumEntry {
                    checksum: "deadbeef",
                    size: 99,
                    path: "main/binary-amd64/Packages.xz",
                },
            ]
        );
    }

    #[test]
    fn predicate_filters_entries() {
        let entries = extract_checksum_block(RELEASE, "Release", |path| path.ends_with(".xz"));

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "main/binary-amd64/Packages.xz");
    }

    #[test]
    fn falls_back_to_weaker_headers() {
        let index = indoc! {"
            SHA1:
             da39a3ee5e6b4b0d3255bfef95601890afd80709 42 Translation-en.bz2
        "};

        let entries = extract_checksum_block(index, "Index", |_| true);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 42);
        assert_eq!(entries[0].path, "Translation-en.bz2");

        assert!(extract_checksum_block("Origin: x\n", "Release", |_| true).is_empty());
    }

    #[test]
    fn header_must_start_line() {
        let data = " SHA256:\n abc 1 x\n";
        assert!(extract_checksum_block(data, "Release", |_| true).is_empty());
    }
}

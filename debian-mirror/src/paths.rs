// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Path and URL string helpers.

Mirror content is addressed three ways: as absolute source URLs
(`http://deb.debian.org/debian/pool/...`), as paths relative to the mirror
root (`deb.debian.org/debian/pool/...`), and as filesystem paths under one of
the local trees. [PathEncoder] converts between the first two forms and
applies the optional `~` → `%7E` encoding that matches how the HTTP transfer
agent names files on disk.
*/

use std::borrow::Cow;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Converts URLs and repository paths into their normalized local forms.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PathEncoder {
    tilde: bool,
}

impl PathEncoder {
    /// Construct an instance.
    ///
    /// `tilde` controls whether `~` is rewritten to `%7E`.
    pub fn new(tilde: bool) -> Self {
        Self { tilde }
    }

    /// Whether `~` is being rewritten.
    pub fn tilde(&self) -> bool {
        self.tilde
    }

    /// Apply the configured character encoding to a string.
    pub fn encode<'a>(&self, value: &'a str) -> Cow<'a, str> {
        if self.tilde && value.contains('~') {
            Cow::Owned(value.replace('~', "%7E"))
        } else {
            Cow::Borrowed(value)
        }
    }

    /// Normalize a path or URL and apply the configured encoding.
    pub fn normalize(&self, value: &str) -> String {
        self.encode(&normalize_path(value)).into_owned()
    }

    /// Resolve the mirror relative path that a URL is stored under.
    ///
    /// The scheme, any credentials and any port number are dropped.
    pub fn sanitise_uri(&self, uri: &str) -> String {
        self.normalize(&strip_uri_authority(uri))
    }
}

/// Collapse `//`, `/./` and `/<segment>/../` sequences in a path or URL.
///
/// The `scheme://` prefix of a URL is preserved and its host segment is never
/// consumed by a `..`. A `..` that cannot be resolved is dropped so the result
/// never escapes its root. A trailing `/` is removed.
pub fn normalize_path(value: &str) -> String {
    let (prefix, rest) = match value.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, value),
    };

    let absolute = prefix.is_none() && rest.starts_with('/');
    // URL hosts are pinned.
    let pinned = usize::from(prefix.is_some());

    let mut segments: Vec<&str> = Vec::new();

    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.len() > pinned {
                    segments.pop();
                }
            }
            s => segments.push(s),
        }
    }

    let joined = segments.join("/");

    match prefix {
        Some(scheme) => format!("{}://{}", scheme, joined),
        None if absolute => format!("/{}", joined),
        None => joined,
    }
}

/// Strip the scheme, credentials and port from a URL, leaving `host/path`.
fn strip_uri_authority(uri: &str) -> String {
    let rest = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);

    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, Some(path)),
        None => (rest, None),
    };

    let host = authority
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(authority);

    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };

    match path {
        Some(path) => format!("{}/{}", host, path),
        None => host.to_string(),
    }
}

/// Quote a string for safe use as a single POSIX shell word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Render a byte count the way progress output presents it.
pub fn format_bytes(bytes: u64) -> String {
    let (divisor, unit) = if bytes >= GIB {
        (GIB, "GiB")
    } else if bytes >= MIB {
        (MIB, "MiB")
    } else if bytes >= KIB {
        (KIB, "KiB")
    } else {
        return format!("{} bytes", bytes);
    };

    format!("{:.1} {}", bytes as f64 / divisor as f64, unit)
}

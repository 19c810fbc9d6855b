// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("directory walk error: {0:?}")]
    Walk(#[from] walkdir::Error),

    #[error("mirror URL lacks a host: {0}")]
    UrlNoHost(String),

    #[error("required field {1} missing from stanza in {0}")]
    IndexFieldMissing(String, &'static str),

    #[error("field {1} in {0} has invalid value: {2}")]
    IndexFieldInvalid(String, &'static str, String),

    #[error("invalid Sources format in {0}: {1}")]
    SourcesFilesMalformed(String, String),

    #[error("configuration variable ${0} cannot be resolved")]
    ConfigVariableUnresolved(String),

    #[error("too many substitutions while evaluating configuration variable {0}")]
    ConfigVariableRecursion(String),

    #[error("another mirror run holds the lock {0}")]
    LockHeld(String),
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, MirrorError>;

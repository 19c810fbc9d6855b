// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Discovery of supplementary catalogs advertised by suite metadata.

Translation catalogs (`<component>/i18n/Translation-*`) are discovered from the
per-component `i18n/Index` file, falling back to the suite `Release` file for
components whose `Index` is not present locally.

Secondary catalogs are AppStream (DEP-11) component and icon archives plus
command-not-found (`cnf`) catalogs, discovered from the suite `Release` file.

Discovery is best-effort: missing files yield nothing and malformed lines are
skipped.
*/

use {
    crate::{checksums::extract_checksum_block, topology::Suite},
    log::{debug, warn},
    regex::Regex,
    std::{collections::BTreeMap, path::Path},
};

/// Discovered files mapped to their advertised sizes.
pub type CatalogFiles = BTreeMap<String, u64>;

fn alternation<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values.map(regex::escape).collect::<Vec<_>>().join("|")
}

fn build_regex(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("unable to build catalog filter {}: {}", pattern, e);
            None
        }
    }
}

/// Find translation catalogs of the given components in `Release` content.
///
/// Paths in the result are relative to the suite directory.
pub fn translations_in_release<'a>(
    release: &str,
    source: &str,
    components: impl Iterator<Item = &'a str>,
) -> CatalogFiles {
    let re = match build_regex(&format!(
        r"^(?:{})/i18n/Translation-[^./]*\.bz2$",
        alternation(components)
    )) {
        Some(re) => re,
        None => return CatalogFiles::new(),
    };

    extract_checksum_block(release, source, |path| re.is_match(path))
        .into_iter()
        .map(|entry| (entry.path.to_string(), entry.size))
        .collect()
}

/// Find all translation catalogs listed in a component's `i18n/Index` content.
///
/// Paths in the result are relative to the suite directory.
pub fn translations_in_index(index: &str, source: &str, component: &str) -> CatalogFiles {
    extract_checksum_block(index, source, |_| true)
        .into_iter()
        .map(|entry| (format!("{}/i18n/{}", component, entry.path), entry.size))
        .collect()
}

/// Find DEP-11 and command-not-found catalogs for a suite in `Release` content.
///
/// Only catalogs of the suite's components and architectures are returned.
/// Paths in the result are relative to the suite directory.
pub fn secondary_catalogs_in_release(release: &str, source: &str, suite: &Suite) -> CatalogFiles {
    let filters = suite
        .components()
        .iter()
        .filter_map(|(component, architectures)| {
            let arches = alternation(
                architectures
                    .iter()
                    .map(|a| a.as_str())
                    .filter(|a| *a != crate::topology::SOURCE_ARCHITECTURE),
            );
            let component = regex::escape(component);

            build_regex(&format!(
                r"^{c}/(?:dep11/(?:Components-(?:{a})\.yml|icons-[^./]+\.tar)|cnf/Commands-(?:{a}))\.(?:gz|bz2|xz)$",
                c = component,
                a = arches
            ))
        })
        .collect::<Vec<_>>();

    extract_checksum_block(release, source, |path| {
        filters.iter().any(|re| re.is_match(path))
    })
    .into_iter()
    .map(|entry| (entry.path.to_string(), entry.size))
    .collect()
}

fn read_text(path: &Path) -> Option<String> {
    std::fs::read(path)
        .ok()
        .map(|data| String::from_utf8_lossy(&data).into_owned())
}

/// Discover a suite's translation catalogs from fetched metadata.
///
/// `skel_dir` is the local directory holding the fetched metadata of the suite's
/// mirror. Paths in the result are repository relative.
pub fn discover_translations(suite: &Suite, skel_dir: &Path) -> CatalogFiles {
    let mut files = CatalogFiles::new();

    if suite.is_simple() {
        return files;
    }

    let mut not_found = vec![];

    for component in suite.components().keys() {
        let index_path = skel_dir.join(suite.join(&format!("{}/i18n/Index", component)));

        match read_text(&index_path) {
            Some(index) => {
                files.extend(translations_in_index(
                    &index,
                    &index_path.display().to_string(),
                    component,
                ));
            }
            None => {
                debug!("{} not available; using Release", index_path.display());
                not_found.push(component.as_str());
            }
        }
    }

    if !not_found.is_empty() {
        let release_path = skel_dir.join(suite.release_path());

        match read_text(&release_path) {
            Some(release) => {
                files.extend(translations_in_release(
                    &release,
                    &release_path.display().to_string(),
                    not_found.into_iter(),
                ));
            }
            None => {
                warn!("can't open {}; skipping translations", release_path.display());
            }
        }
    }

    files
        .into_iter()
        .map(|(path, size)| (suite.join(&path), size))
        .collect()
}

/// Discover a suite's DEP-11 and command-not-found catalogs from fetched metadata.
///
/// Paths in the result are repository relative.
pub fn discover_secondary_catalogs(suite: &Suite, skel_dir: &Path) -> CatalogFiles {
    if suite.is_simple() {
        return CatalogFiles::new();
    }

    let release_path = skel_dir.join(suite.release_path());

    match read_text(&release_path) {
        Some(release) => {
            secondary_catalogs_in_release(&release, &release_path.display().to_string(), suite)
                .into_iter()
                .map(|(path, size)| (suite.join(&path), size))
                .collect()
        }
        None => {
            warn!("can't open {}; skipping DEP-11 catalogs", release_path.display());
            CatalogFiles::new()
        }
    }
}

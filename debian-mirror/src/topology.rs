// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The configured shape of the repositories being mirrored.

A [Topology] holds one [Mirror] per remote base URL. Each mirror holds
[Suite]s, and each suite maps component names to the set of architectures
to mirror. The architecture `src` denotes source packages.

Suites come in two layouts. A *structured* suite follows the conventional
`dists/<suite>/<component>/binary-<arch>/Packages` layout. A *simple* suite is
a flat repository (a single component named by the empty string) whose
indices live directly under `<suite>/`. The layout is decided once at
construction and drives every path computed from the suite.
*/

use {
    crate::{
        error::{MirrorError, Result},
        paths::normalize_path,
    },
    std::collections::{BTreeMap, BTreeSet, HashSet},
};

/// Filename extensions of compressed index variants, in lookup order.
pub const COMPRESSION_EXTENSIONS: &[&str; 3] = &[".gz", ".bz2", ".xz"];

/// Pseudo architecture denoting source packages.
pub const SOURCE_ARCHITECTURE: &str = "src";

/// Well-known files at the root of a suite directory.
const RELEASE_FILES: &[&str; 3] = &["InRelease", "Release", "Release.gpg"];

/// Mapping of component name to the architectures mirrored for it.
pub type ComponentMap = BTreeMap<String, BTreeSet<String>>;

/// Mapping of base URL to suite name to components.
pub type TopologyMap = BTreeMap<String, BTreeMap<String, ComponentMap>>;

/// How index files are laid out within a suite.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuiteLayout {
    /// A flat repository without a `dists/` hierarchy.
    Simple,
    /// The conventional `dists/<suite>/<component>/...` layout.
    Structured,
}

/// A suite (distribution) within a mirror.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Suite {
    name: String,
    layout: SuiteLayout,
    root: String,
    components: ComponentMap,
}

impl Suite {
    /// Construct an instance from a suite name and its component map.
    pub fn new(name: impl ToString, components: ComponentMap) -> Self {
        let name = name.to_string();

        let layout = if components.len() == 1 && components.contains_key("") {
            SuiteLayout::Simple
        } else {
            SuiteLayout::Structured
        };

        let root = match layout {
            SuiteLayout::Simple => normalize_path(&name),
            SuiteLayout::Structured => normalize_path(&format!("dists/{}", name)),
        };

        Self {
            name,
            layout,
            root,
            components,
        }
    }

    /// The name of this suite as configured.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The layout of this suite.
    pub fn layout(&self) -> SuiteLayout {
        self.layout
    }

    /// Whether this suite uses the flat layout.
    pub fn is_simple(&self) -> bool {
        self.layout == SuiteLayout::Simple
    }

    /// Repository relative path of the directory holding this suite's indices.
    ///
    /// e.g. `dists/bullseye`.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// The components of this suite and their architectures.
    pub fn components(&self) -> &ComponentMap {
        &self.components
    }

    /// Resolve a suite relative path to a repository relative path.
    ///
    /// The result never has a leading `/`, even for a suite at the repository root.
    pub fn join(&self, path: &str) -> String {
        if self.root.is_empty() {
            normalize_path(path.trim_start_matches('/'))
        } else {
            normalize_path(&format!("{}/{}", self.root, path))
        }
    }

    /// Repository relative path of this suite's `Release` file.
    pub fn release_path(&self) -> String {
        self.join("Release")
    }

    /// Ordered repository relative paths of every index file this suite needs.
    ///
    /// Compressed index files are listed in all supported compression variants.
    /// The list contains no duplicates.
    pub fn index_paths(&self, include_contents: bool) -> Vec<String> {
        let mut paths = IndexPathList::default();

        for name in RELEASE_FILES {
            paths.push(self.join(name));
        }

        for (component, architectures) in &self.components {
            for arch in architectures {
                match (self.layout, arch.as_str()) {
                    (SuiteLayout::Simple, SOURCE_ARCHITECTURE) => {
                        paths.push_compressed(self.join("Sources"));
                    }
                    (SuiteLayout::Simple, _) => {
                        paths.push_compressed(self.join("Packages"));
                    }
                    (SuiteLayout::Structured, SOURCE_ARCHITECTURE) => {
                        paths.push(self.join(&format!("{}/source/Release", component)));
                        paths.push_compressed(self.join(&format!("{}/source/Sources", component)));
                    }
                    (SuiteLayout::Structured, _) => {
                        let binary_dir = format!("{}/binary-{}", component, arch);

                        paths.push(self.join(&format!("{}/Release", binary_dir)));
                        paths.push_compressed(self.join(&format!("{}/Packages", binary_dir)));
                        paths.push(self.join(&format!("{}/i18n/Index", component)));

                        if include_contents {
                            paths.push_compressed(
                                self.join(&format!("{}/Contents-{}", component, arch)),
                            );
                        }
                    }
                }
            }
        }

        paths.into_inner()
    }

    /// Repository relative paths of the uncompressed `Sources` indices of this suite.
    pub fn source_index_paths(&self) -> Vec<String> {
        self.collect_indices(|arch| arch == SOURCE_ARCHITECTURE, "Sources")
    }

    /// Repository relative paths of the uncompressed `Packages` indices of this suite.
    pub fn package_index_paths(&self) -> Vec<String> {
        self.collect_indices(|arch| arch != SOURCE_ARCHITECTURE, "Packages")
    }

    fn collect_indices(&self, want_arch: impl Fn(&str) -> bool, filename: &str) -> Vec<String> {
        let mut paths = IndexPathList::default();

        for (component, architectures) in &self.components {
            for arch in architectures.iter().filter(|a| want_arch(a)) {
                let path = match (self.layout, arch.as_str()) {
                    (SuiteLayout::Simple, _) => self.join(filename),
                    (SuiteLayout::Structured, SOURCE_ARCHITECTURE) => {
                        self.join(&format!("{}/source/{}", component, filename))
                    }
                    (SuiteLayout::Structured, _) => {
                        self.join(&format!("{}/binary-{}/{}", component, arch, filename))
                    }
                };

                paths.push(path);
            }
        }

        paths.into_inner()
    }
}

/// An insertion ordered, duplicate free list of paths.
#[derive(Default)]
struct IndexPathList {
    paths: Vec<String>,
    seen: HashSet<String>,
}

impl IndexPathList {
    fn push(&mut self, path: String) {
        if self.seen.insert(path.clone()) {
            self.paths.push(path);
        }
    }

    fn push_compressed(&mut self, path: String) {
        self.push(path.clone());

        for ext in COMPRESSION_EXTENSIONS {
            self.push(format!("{}{}", path, ext));
        }
    }

    fn into_inner(self) -> Vec<String> {
        self.paths
    }
}

/// A remote repository and the suites mirrored from it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mirror {
    url: String,
    suites: Vec<Suite>,
}

impl Mirror {
    /// Construct an instance from a base URL and its suites.
    ///
    /// The URL must parse and carry a host.
    pub fn new(url: &str, suites: impl IntoIterator<Item = Suite>) -> Result<Self> {
        let parsed = url::Url::parse(url)?;

        if parsed.host_str().is_none() {
            return Err(MirrorError::UrlNoHost(url.to_string()));
        }

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            suites: suites.into_iter().collect(),
        })
    }

    /// The base URL of this mirror, without a trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Suites mirrored from this repository.
    pub fn suites(&self) -> &[Suite] {
        &self.suites
    }

    /// Resolve a repository relative path to an absolute URL.
    pub fn url_for(&self, path: &str) -> String {
        normalize_path(&format!("{}/{}", self.url, path))
    }

    /// Ordered repository relative index paths of every suite in this mirror.
    pub fn index_paths(&self, include_contents: bool) -> Vec<String> {
        self.suites
            .iter()
            .flat_map(|suite| suite.index_paths(include_contents))
            .collect()
    }
}

/// All mirrored repositories.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Topology {
    mirrors: Vec<Mirror>,
}

impl Topology {
    /// Build the model from a resolved configuration map.
    pub fn from_map(map: &TopologyMap) -> Result<Self> {
        let mirrors = map
            .iter()
            .map(|(url, suites)| {
                Mirror::new(
                    url,
                    suites
                        .iter()
                        .map(|(name, components)| Suite::new(name, components.clone())),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { mirrors })
    }

    /// The mirrors in this topology.
    pub fn mirrors(&self) -> &[Mirror] {
        &self.mirrors
    }

    /// Iterate over `(mirror, suite)` pairs.
    pub fn iter_suites(&self) -> impl Iterator<Item = (&Mirror, &Suite)> {
        self.mirrors
            .iter()
            .flat_map(|mirror| mirror.suites.iter().map(move |suite| (mirror, suite)))
    }
}

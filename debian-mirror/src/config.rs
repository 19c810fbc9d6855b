// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mirror run configuration.

[MirrorConfig] is deserialized with `serde`, typically from YAML:

```yaml
base_path: /srv/apt-mirror
nthreads: 10
mirrors:
  http://deb.debian.org/debian:
    bookworm:
      main: [amd64, src]
  http://example.com/flat:
    ./:
      "": [amd64]
skip_clean:
  - http://deb.debian.org/debian/project
```

Path settings may reference the other path settings as `$base_path`,
`$mirror_path`, `$skel_path` and `$var_path`. [MirrorConfig::resolve()]
expands those references.
*/

use {
    crate::{
        error::{MirrorError, Result},
        fetch::{ProxySettings, Strategy, TransferSettings},
        paths::PathEncoder,
        topology::{Topology, TopologyMap},
    },
    regex::{Captures, Regex},
    serde::Deserialize,
    std::{collections::HashMap, path::PathBuf},
};

/// Maximum number of expansion rounds for a path setting.
const MAX_SUBSTITUTIONS: usize = 16;

fn default_base_path() -> String {
    "/var/spool/apt-mirror".to_string()
}

fn default_mirror_path() -> String {
    "$base_path/mirror".to_string()
}

fn default_skel_path() -> String {
    "$base_path/skel".to_string()
}

fn default_var_path() -> String {
    "$base_path/var".to_string()
}

fn default_cleanscript() -> String {
    "$var_path/clean.sh".to_string()
}

fn default_nthreads() -> usize {
    20
}

fn default_limit_rate() -> String {
    "100m".to_string()
}

fn default_true() -> bool {
    true
}

/// Configuration of a mirror run.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    /// Root of the default directory layout.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Directory the published mirror is written to.
    #[serde(default = "default_mirror_path")]
    pub mirror_path: String,

    /// Directory fresh metadata is fetched into.
    #[serde(default = "default_skel_path")]
    pub skel_path: String,

    /// Directory holding the lock, run artifacts and logs.
    #[serde(default = "default_var_path")]
    pub var_path: String,

    /// Where the removal script is written when cleanup is not immediate.
    #[serde(default = "default_cleanscript")]
    pub cleanscript: String,

    /// Maximum number of concurrent transfer workers.
    #[serde(default = "default_nthreads")]
    pub nthreads: usize,

    #[serde(default)]
    pub strategy: Strategy,

    /// Transfer rate limit, e.g. `100m`.
    #[serde(default = "default_limit_rate")]
    pub limit_rate: String,

    /// Whether `Contents-<arch>` indices are mirrored.
    #[serde(default = "default_true")]
    pub contents: bool,

    /// Remove unneeded files immediately instead of writing a script.
    #[serde(default)]
    pub autoclean: bool,

    /// Store `~` in paths as `%7E`.
    #[serde(default)]
    pub tilde: bool,

    #[serde(default)]
    pub unlink: bool,

    #[serde(default)]
    pub auth_no_challenge: bool,

    #[serde(default)]
    pub no_check_certificate: bool,

    pub proxy: Option<ProxySettings>,

    /// Base URL to suite to component to architectures.
    #[serde(default)]
    pub mirrors: TopologyMap,

    /// URLs whose local copies are never cleaned.
    #[serde(default)]
    pub skip_clean: Vec<String>,

    /// URLs whose local copies are cleaned.
    #[serde(default)]
    pub clean: Vec<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            mirror_path: default_mirror_path(),
            skel_path: default_skel_path(),
            var_path: default_var_path(),
            cleanscript: default_cleanscript(),
            nthreads: default_nthreads(),
            strategy: Strategy::default(),
            limit_rate: default_limit_rate(),
            contents: true,
            autoclean: false,
            tilde: false,
            unlink: false,
            auth_no_challenge: false,
            no_check_certificate: false,
            proxy: None,
            mirrors: TopologyMap::new(),
            skip_clean: vec![],
            clean: vec![],
        }
    }
}

impl MirrorConfig {
    fn variables(&self) -> HashMap<&'static str, &str> {
        HashMap::from([
            ("base_path", self.base_path.as_str()),
            ("mirror_path", self.mirror_path.as_str()),
            ("skel_path", self.skel_path.as_str()),
            ("var_path", self.var_path.as_str()),
        ])
    }

    /// Expand `$name` references in a value.
    pub fn expand(&self, value: &str) -> Result<String> {
        let re = Regex::new(r"\$(\w+)").map_err(|e| {
            MirrorError::ConfigVariableUnresolved(format!("{}: {}", value, e))
        })?;
        let variables = self.variables();

        let mut value = value.to_string();

        for _ in 0..MAX_SUBSTITUTIONS {
            if !re.is_match(&value) {
                return Ok(value);
            }

            if let Some(name) = re
                .captures_iter(&value)
                .map(|caps| caps[1].to_string())
                .find(|name| !variables.contains_key(name.as_str()))
            {
                return Err(MirrorError::ConfigVariableUnresolved(name));
            }

            value = re
                .replace_all(&value, |caps: &Captures| {
                    variables
                        .get(&caps[1])
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                })
                .into_owned();
        }

        if re.is_match(&value) {
            Err(MirrorError::ConfigVariableRecursion(value))
        } else {
            Ok(value)
        }
    }

    /// Expand variable references in every path setting.
    pub fn resolve(mut self) -> Result<Self> {
        let base_path = self.expand(&self.base_path)?;
        let mirror_path = self.expand(&self.mirror_path)?;
        let skel_path = self.expand(&self.skel_path)?;
        let var_path = self.expand(&self.var_path)?;
        let cleanscript = self.expand(&self.cleanscript)?;

        self.base_path = base_path;
        self.mirror_path = mirror_path;
        self.skel_path = skel_path;
        self.var_path = var_path;
        self.cleanscript = cleanscript;

        Ok(self)
    }

    pub fn mirror_path(&self) -> PathBuf {
        PathBuf::from(&self.mirror_path)
    }

    pub fn skel_path(&self) -> PathBuf {
        PathBuf::from(&self.skel_path)
    }

    pub fn var_path(&self) -> PathBuf {
        PathBuf::from(&self.var_path)
    }

    pub fn cleanscript(&self) -> PathBuf {
        PathBuf::from(&self.cleanscript)
    }

    /// The path encoder implied by the `tilde` setting.
    pub fn encoder(&self) -> PathEncoder {
        PathEncoder::new(self.tilde)
    }

    /// Build the topology of mirrored repositories.
    pub fn topology(&self) -> Result<Topology> {
        Topology::from_map(&self.mirrors)
    }

    /// Settings for transfer agents.
    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            limit_rate: self.limit_rate.clone(),
            auth_no_challenge: self.auth_no_challenge,
            no_check_certificate: self.no_check_certificate,
            unlink: self.unlink,
            proxy: self.proxy.clone(),
            encoder: self.encoder(),
        }
    }

    /// Mirror relative paths protected from cleanup.
    pub fn protected_paths(&self) -> Vec<String> {
        self.mirror_relative(&self.skip_clean)
    }

    /// Mirror relative paths to clean.
    pub fn clean_paths(&self) -> Vec<String> {
        self.mirror_relative(&self.clean)
    }

    fn mirror_relative(&self, urls: &[String]) -> Vec<String> {
        let encoder = self.encoder();

        urls.iter().map(|url| encoder.sanitise_uri(url)).collect()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn defaults() -> TestResult {
        let config = serde_yaml::from_str::<MirrorConfig>("{}")?.resolve()?;

        assert_eq!(config.base_path, "/var/spool/apt-mirror");
        assert_eq!(config.mirror_path, "/var/spool/apt-mirror/mirror");
        assert_eq!(config.skel_path, "/var/spool/apt-mirror/skel");
        assert_eq!(config.var_path, "/var/spool/apt-mirror/var");
        assert_eq!(config.cleanscript, "/var/spool/apt-mirror/var/clean.sh");
        assert_eq!(config.nthreads, 20);
        assert_eq!(config.strategy, Strategy::Queue);
        assert_eq!(config.limit_rate, "100m");
        assert!(config.contents);
        assert!(!config.autoclean);
        assert!(!config.tilde);
        assert!(!config.unlink);

        Ok(())
    }

    #[test]
    fn yaml_config() -> TestResult {
        let config = serde_yaml::from_str::<MirrorConfig>(indoc! {r#"
            base_path: /srv/apt
            var_path: $mirror_path/../var
            strategy: batch-split
            tilde: true
            proxy:
              http: http://proxy:3128
            mirrors:
              http://deb.debian.org/debian:
                bookworm:
                  main: [amd64, src]
              http://example.com/flat:
                ./:
                  "": [amd64]
            skip_clean:
              - http://deb.debian.org/debian/~project/
            clean:
              - http://user:pw@deb.debian.org/debian
        "#})?
        .resolve()?;

        assert_eq!(config.mirror_path, "/srv/apt/mirror");
        assert_eq!(config.var_path, "/srv/apt/mirror/../var");
        assert_eq!(config.cleanscript, "/srv/apt/mirror/../var/clean.sh");
        assert_eq!(config.strategy, Strategy::BatchSplit);

        let topology = config.topology()?;
        assert_eq!(topology.mirrors().len(), 2);
        assert_eq!(topology.iter_suites().filter(|(_, s)| s.is_simple()).count(), 1);

        assert_eq!(config.protected_paths(), vec!["deb.debian.org/debian/%7Eproject"]);
        assert_eq!(config.clean_paths(), vec!["deb.debian.org/debian"]);

        let settings = config.transfer_settings();
        assert!(settings.encoder.tilde());
        assert!(settings.wget_args().contains(&"http_proxy=http://proxy:3128".to_string()));

        Ok(())
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(serde_yaml::from_str::<MirrorConfig>("nthread: 4\n").is_err());
    }

    #[test]
    fn variable_errors() {
        let config = MirrorConfig {
            mirror_path: "$nowhere/mirror".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve(),
            Err(MirrorError::ConfigVariableUnresolved(name)) if name == "nowhere"
        ));

        let config = MirrorConfig {
            base_path: "$skel_path".to_string(),
            skel_path: "$base_path/skel".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve(),
            Err(MirrorError::ConfigVariableRecursion(_))
        ));
    }
}

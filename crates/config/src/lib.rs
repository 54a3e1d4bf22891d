//! Layered configuration for the tag cache.
//!
//! Values are merged, lowest precedence first, from:
//! 1. built-in defaults,
//! 2. `tagmap.toml` in the platform configuration directory, if present,
//! 3. an explicitly given file (TOML, YAML or JSON, by extension),
//! 4. `TAGMAP_*` environment variables, with `__` separating nested keys
//!    (`TAGMAP_CACHE__SYNC_CHUNK_SIZE=512`).
//!
//! ```toml
//! file_services = [1, 2]
//!
//! [database]
//! path = "/var/lib/tagmap/cache.sqlite3"
//!
//! [[tag_services]]
//! id = 3
//! siblings = [3, 4]
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tagmap_cache::{CacheSettings, FileServiceId, Relation, ServiceRegistry, TagServiceId};

const ENV_PREFIX: &str = "TAGMAP_";
const CONFIG_FILE: &str = "tagmap.toml";
const DATABASE_FILE: &str = "cache.sqlite3";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    /// Real file domains with their own mapping caches.
    pub file_services: Vec<i64>,
    pub tag_services: Vec<TagServiceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Defaults to the platform data directory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub cancel_check_interval: usize,
    pub sync_chunk_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let settings = CacheSettings::default();
        Self { cancel_check_interval: settings.cancel_check_interval, sync_chunk_size: settings.sync_chunk_size }
    }
}

/// One tag service and the ordered services whose edges apply to its display.
/// Leaving a list out means the service only applies its own edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagServiceConfig {
    pub id: i64,
    #[serde(default)]
    pub siblings: Option<Vec<i64>>,
    #[serde(default)]
    pub parents: Option<Vec<i64>>,
}

impl Config {
    /// Load and merge every configuration source. `file`, when given, must exist.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(file)?.extract().or_raise(|| ErrorKind::Invalid)?;
        tracing::debug!(
            file_services = config.file_services.len(),
            tag_services = config.tag_services.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// The merged provider stack [`load`](Self::load) extracts from.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(dirs) = project_dirs() {
            figment = figment.merge(Toml::file(dirs.config_dir().join(CONFIG_FILE)));
        }
        if let Some(path) = file {
            if !path.is_file() {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
            }
            figment = match path.extension().and_then(|extension| extension.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Where the cache database lives.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database.path {
            return Ok(path.clone());
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join(DATABASE_FILE))
            .ok_or_raise(|| ErrorKind::NoDataDirectory)
    }

    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            cancel_check_interval: self.cache.cancel_check_interval.max(1),
            sync_chunk_size: self.cache.sync_chunk_size.max(1),
        }
    }

    /// Build the service registry the cache engine runs against.
    ///
    /// Every service must be registered before an applicable list can name
    /// it, so lists are applied in a second pass.
    pub fn registry(&self) -> Result<ServiceRegistry> {
        let mut registry = ServiceRegistry::new();
        for id in &self.file_services {
            registry = registry.with_file_service(FileServiceId(*id)).map_err(ErrorKind::services)?;
        }
        for service in &self.tag_services {
            registry = registry.with_tag_service(TagServiceId(service.id)).map_err(ErrorKind::services)?;
        }
        for service in &self.tag_services {
            let lists = [(Relation::Siblings, &service.siblings), (Relation::Parents, &service.parents)];
            for (relation, list) in lists {
                let Some(list) = list else { continue };
                registry = registry
                    .with_applicable(relation, TagServiceId(service.id), list.iter().copied().map(TagServiceId))
                    .map_err(ErrorKind::services)?;
            }
        }
        Ok(registry)
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "tagmap")
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;
    use std::io::Write;
    use tagmap_cache::error::ErrorKind as CacheErrorKind;

    /// Load `contents` as `config.{extension}` inside a jail, so environment
    /// overrides from one test never leak into another.
    fn load_jailed(extension: &str, contents: &str) -> Result<Config> {
        let mut loaded = None;
        Jail::expect_with(|jail| {
            let name = format!("config.{extension}");
            jail.create_file(&name, contents)?;
            loaded = Some(Config::load(Some(&jail.directory().join(name))));
            Ok(())
        });
        loaded.expect("jail ran")
    }

    #[rstest]
    #[case("toml", "file_services = [1, 2]\n[cache]\nsync_chunk_size = 16\n")]
    #[case("yaml", "file_services: [1, 2]\ncache:\n  sync_chunk_size: 16\n")]
    #[case("yml", "file_services: [1, 2]\ncache:\n  sync_chunk_size: 16\n")]
    #[case("json", r#"{"file_services": [1, 2], "cache": {"sync_chunk_size": 16}}"#)]
    fn loads_every_format(#[case] extension: &str, #[case] contents: &str) {
        let config = load_jailed(extension, contents).unwrap();
        assert_eq!(config.file_services, vec![1, 2]);
        assert_eq!(config.cache.sync_chunk_size, 16);
        assert_eq!(config.cache.cancel_check_interval, CacheSettings::default().cancel_check_interval);
    }

    #[test]
    fn missing_and_unknown_files_are_errors() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert_eq!(*err, ErrorKind::NotFound(PathBuf::from("/definitely/not/here.toml")));

        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        file.write_all(b"file_services = 1").unwrap();
        let err = Config::load(Some(file.path())).unwrap_err();
        assert_eq!(*err, ErrorKind::UnsupportedFormat(file.path().to_path_buf()));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = load_jailed("toml", "file_service = [1]\n").unwrap_err();
        assert_eq!(*err, ErrorKind::Invalid);
    }

    #[test]
    fn environment_overrides_files() {
        Jail::expect_with(|jail| {
            jail.create_file("tagmap.toml", "[cache]\nsync_chunk_size = 16\ncancel_check_interval = 4\n")?;
            let path = jail.directory().join("tagmap.toml");
            jail.set_env("TAGMAP_CACHE__SYNC_CHUNK_SIZE", "512");
            jail.set_env("TAGMAP_DATABASE__PATH", "/tmp/tagmap.sqlite3");
            let config = Config::load(Some(&path)).unwrap();
            assert_eq!(config.cache.sync_chunk_size, 512);
            assert_eq!(config.cache.cancel_check_interval, 4);
            assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/tagmap.sqlite3"));
            Ok(())
        });
    }

    #[test]
    fn settings_never_go_to_zero() {
        let config = Config { cache: CacheConfig { cancel_check_interval: 0, sync_chunk_size: 0 }, ..Config::default() };
        assert_eq!(config.settings(), CacheSettings { cancel_check_interval: 1, sync_chunk_size: 1 });
    }

    #[test]
    fn builds_registry_with_applicable_lists() {
        let config = load_jailed(
            "toml",
            r#"
                file_services = [1]

                [[tag_services]]
                id = 2
                siblings = [3, 2]
                parents = [2]

                [[tag_services]]
                id = 3
            "#,
        );
        let registry = config.unwrap().registry().unwrap();
        assert!(registry.has_file_service(FileServiceId(1)));
        assert_eq!(registry.applicable(Relation::Siblings, TagServiceId(2)), vec![TagServiceId(3), TagServiceId(2)]);
        assert_eq!(registry.applicable(Relation::Parents, TagServiceId(2)), vec![TagServiceId(2)]);
        assert_eq!(registry.applicable(Relation::Siblings, TagServiceId(3)), vec![TagServiceId(3)]);
        assert_eq!(registry.dependents(Relation::Siblings, TagServiceId(3)), vec![TagServiceId(2), TagServiceId(3)]);
    }

    #[rstest]
    #[case("[[tag_services]]\nid = 0\n", CacheErrorKind::CombinedService)]
    #[case("[[tag_services]]\nid = 2\nparents = [7]\n", CacheErrorKind::TagServiceNotFound(TagServiceId(7)))]
    #[case("file_services = [0]\n", CacheErrorKind::CombinedService)]
    fn invalid_services_are_reported(#[case] contents: &str, #[case] expected: CacheErrorKind) {
        let err = load_jailed("toml", contents).unwrap().registry().unwrap_err();
        assert_eq!(*err, ErrorKind::Services(expected));
    }
}

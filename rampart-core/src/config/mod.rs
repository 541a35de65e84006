use crate::operation::Target;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

pub mod cluster;
pub mod database;

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Databases(pub HashMap<database::Name, database::Definition>);

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Clusters(pub HashMap<cluster::Name, cluster::Definition>);

/// Binary names or paths of the external tools. All default to plain names
/// looked up on PATH.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Tools {
    pub pg_dump: String,
    pub pg_restore: String,
    pub psql: String,
    pub pg_isready: String,
    pub velero: String,
    pub kubectl: String,
    pub gpg: String,
    pub storage: String,
}

impl Default for Tools {
    fn default() -> Self {
        Tools {
            pg_dump: "pg_dump".to_owned(),
            pg_restore: "pg_restore".to_owned(),
            psql: "psql".to_owned(),
            pg_isready: "pg_isready".to_owned(),
            velero: "velero".to_owned(),
            kubectl: "kubectl".to_owned(),
            gpg: "gpg".to_owned(),
            storage: "aws".to_owned(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Storage {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    /// Opaque pass-through to the storage CLI.
    #[serde(default, alias = "storage_class", skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Notify {
    #[serde(default, alias = "webhook_url", skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Retention {
    #[serde(default = "default_max_age", with = "humantime_serde", alias = "max_age")]
    pub max_age: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            max_age: default_max_age(),
        }
    }
}

fn default_max_age() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

/// A `host:port` pair for the connectivity probe.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<Endpoint> for String {
    fn from(e: Endpoint) -> Self {
        e.to_string()
    }
}

impl TryFrom<String> for Endpoint {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("endpoint '{}' is not of the form host:port", s))?;
        if host.is_empty() {
            return Err(format!("endpoint '{}' has an empty host", s));
        }
        let port = port
            .parse()
            .map_err(|_| format!("endpoint '{}' has an invalid port", s))?;
        Ok(Endpoint {
            host: host.to_owned(),
            port,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Probes {
    /// Maximum acceptable age of the newest backup artifact.
    #[serde(with = "humantime_serde", alias = "max_backup_age")]
    pub max_backup_age: Duration,
    pub endpoints: Vec<Endpoint>,
    /// Names checked for address redundancy.
    pub redundancy: Vec<String>,
}

impl Default for Probes {
    fn default() -> Self {
        Probes {
            max_backup_age: Duration::from_secs(24 * 3600),
            endpoints: vec![],
            redundancy: vec![],
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Directory for per-run report files; reports are disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,
    /// Scratch directory for dump files; the system temp dir when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    pub tools: Tools,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,
    pub notify: Notify,
    pub retention: Retention,
    pub databases: Databases,
    pub clusters: Clusters,
    pub probes: Probes,

    /// path of the configuration file, if the configuration was loaded from a file
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            environment: default_environment(),
            report_dir: None,
            work_dir: None,
            tools: Default::default(),
            storage: None,
            notify: Default::default(),
            retention: Default::default(),
            databases: Default::default(),
            clusters: Default::default(),
            probes: Default::default(),
            source: None,
        }
    }
}

fn default_environment() -> String {
    "default".to_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("invalid configuration string")]
    InvalidConfigString(#[source] toml::de::Error),
    #[error("invalid configuration file {}", .0.display())]
    InvalidConfigFile(PathBuf, #[source] toml::de::Error),
    #[error("i/o error reading configuration file {}", .0.display())]
    IoError(PathBuf, #[source] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("unknown target '{0}'")]
    Unknown(String),
    #[error("'{0}' is configured as both a database and a cluster")]
    Ambiguous(String),
}

impl Config {
    pub fn parse(s: &str) -> Result<Config, ConfigLoadError> {
        toml::from_str(s).map_err(ConfigLoadError::InvalidConfigString)
    }

    pub async fn parse_file(p: &Path) -> Result<Config, ConfigLoadError> {
        let config_string = tokio::fs::read_to_string(p)
            .await
            .map_err(|e| ConfigLoadError::IoError(p.to_owned(), e))?;
        let mut config: Config = toml::from_str(&config_string)
            .map_err(|e| ConfigLoadError::InvalidConfigFile(p.to_owned(), e))?;
        config.source = Some(p.to_owned());
        Ok(config)
    }

    /// Resolves a name given on the command line to its configured target.
    pub fn target(&self, name: &str) -> Result<Target, TargetError> {
        let db = self.databases.0.get_key_value(&database::Name(name.to_owned()));
        let cl = self.clusters.0.get_key_value(&cluster::Name(name.to_owned()));
        match (db, cl) {
            (Some(_), Some(_)) => Err(TargetError::Ambiguous(name.to_owned())),
            (Some((name, def)), None) => Ok(Target::Database(name.clone(), def.clone())),
            (None, Some((name, def))) => Ok(Target::Cluster(name.clone(), def.clone())),
            (None, None) => Err(TargetError::Unknown(name.to_owned())),
        }
    }
}

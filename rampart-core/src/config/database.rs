use serde::{Deserialize, Serialize};

#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Name(pub String);

#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Secret {
    FromEnvVar {
        #[serde(rename = "env-var", alias = "env_var")]
        env_var: String,
    },
    Inline {
        value: String,
    },
}

impl Default for Secret {
    fn default() -> Self {
        Secret::FromEnvVar {
            env_var: Default::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),
}

impl Secret {
    pub fn resolve(&self) -> Result<String, SecretError> {
        match self {
            Secret::FromEnvVar { env_var } => {
                std::env::var(env_var).map_err(|_| SecretError::MissingEnvVar(env_var.clone()))
            }
            Secret::Inline { value } => Ok(value.clone()),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Definition {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Secret,
    /// Database used for administrative statements while the target database
    /// is being swapped around.
    #[serde(default = "default_maintenance_database", alias = "maintenance_database")]
    pub maintenance_database: String,
    #[serde(default)]
    pub encrypt: bool,
    /// Passphrase for symmetric artifact encryption; required when `encrypt`
    /// is set or requested on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<Secret>,
}

fn default_port() -> u16 {
    5432
}

fn default_maintenance_database() -> String {
    "postgres".to_owned()
}

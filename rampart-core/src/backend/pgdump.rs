//! Logical database backups via pg_dump/pg_restore.
//!
//! Dumps are custom-format, optionally gpg-encrypted, and uploaded to object
//! storage. A restore never touches the live database in place: data is
//! restored into a freshly named database and promoted with a rename pair,
//! after existing connections have been terminated.

use crate::{
    backend::{Backend, BackendError, Finished, StartOutcome},
    config::{database, Tools},
    exec::Tool,
    operation::{
        timestamp_token, Artifact, OperationConfig, OperationHandle, OperationStatus,
    },
    store::ObjectStore,
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use time::OffsetDateTime;

/// Administrative access to the database catalog, behind a trait so the swap
/// logic can be exercised without a server.
#[async_trait::async_trait]
pub(crate) trait Catalog: Send + Sync {
    async fn database_exists(&self, name: &str) -> Result<bool, BackendError>;
    async fn create_database(&self, name: &str) -> Result<(), BackendError>;
    async fn drop_database(&self, name: &str) -> Result<(), BackendError>;
    async fn rename_database(&self, from: &str, to: &str) -> Result<(), BackendError>;
    async fn terminate_connections(&self, name: &str) -> Result<(), BackendError>;
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

struct PsqlCatalog {
    psql: Tool,
    def: database::Definition,
}

impl PsqlCatalog {
    async fn execute(&self, sql: &str) -> Result<String, BackendError> {
        let password = self.def.password.resolve()?;
        let port = self.def.port.to_string();
        let captured = self
            .psql
            .check_output(
                &[
                    "--host",
                    self.def.host.as_str(),
                    "--port",
                    port.as_str(),
                    "--username",
                    self.def.user.as_str(),
                    "--dbname",
                    self.def.maintenance_database.as_str(),
                    "--no-psqlrc",
                    "--tuples-only",
                    "--no-align",
                    "--command",
                    sql,
                ],
                &[("PGPASSWORD", password.as_str())],
            )
            .await?;
        Ok(captured.stdout)
    }
}

#[async_trait::async_trait]
impl Catalog for PsqlCatalog {
    async fn database_exists(&self, name: &str) -> Result<bool, BackendError> {
        let sql = format!(
            "SELECT 1 FROM pg_database WHERE datname = {}",
            quote_literal(name)
        );
        let stdout = self.execute(&sql).await?;
        Ok(stdout.trim() == "1")
    }

    async fn create_database(&self, name: &str) -> Result<(), BackendError> {
        self.execute(&format!("CREATE DATABASE {}", quote_ident(name)))
            .await?;
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<(), BackendError> {
        self.execute(&format!("DROP DATABASE IF EXISTS {}", quote_ident(name)))
            .await?;
        Ok(())
    }

    async fn rename_database(&self, from: &str, to: &str) -> Result<(), BackendError> {
        self.execute(&format!(
            "ALTER DATABASE {} RENAME TO {}",
            quote_ident(from),
            quote_ident(to)
        ))
        .await?;
        Ok(())
    }

    async fn terminate_connections(&self, name: &str) -> Result<(), BackendError> {
        let sql = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = {} AND pid <> pg_backend_pid()",
            quote_literal(name)
        );
        self.execute(&sql).await?;
        Ok(())
    }
}

fn archived_name(live: &str) -> String {
    format!("{}_archived", live)
}

/// Promotes a freshly restored database to the live name. Existing
/// connections to the live name are terminated first; the previous live
/// database is kept under the archived name for rollback.
pub(crate) async fn promote(
    catalog: &dyn Catalog,
    live: &str,
    fresh: &str,
    shelf_token: &str,
) -> Result<(), BackendError> {
    let archived = archived_name(live);
    if catalog.database_exists(&archived).await? {
        // a leftover archive from an earlier restore; shelve it out of the way
        catalog
            .rename_database(&archived, &format!("{}_{}", archived, shelf_token))
            .await?;
    }
    catalog.terminate_connections(live).await?;
    if catalog.database_exists(live).await? {
        catalog.rename_database(live, &archived).await?;
    }
    catalog.rename_database(fresh, live).await?;
    tracing::info!(live, fresh, archived, "promoted restored database");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Rollback {
    RolledBack,
    NothingToDo,
}

/// Reverses a promotion. Idempotent by name: every rename is guarded by a
/// catalog existence check, so a repeated call and a partially completed
/// forward swap both end in the same state, with the live name pointing at
/// the pre-restore data.
pub(crate) async fn rollback(
    catalog: &dyn Catalog,
    live: &str,
    shelf_token: &str,
) -> Result<Rollback, BackendError> {
    let archived = archived_name(live);
    if !catalog.database_exists(&archived).await? {
        return Ok(Rollback::NothingToDo);
    }
    if catalog.database_exists(live).await? {
        catalog.terminate_connections(live).await?;
        let shelf = format!("{}_rolled_back", live);
        if catalog.database_exists(&shelf).await? {
            catalog
                .rename_database(&shelf, &format!("{}_{}", shelf, shelf_token))
                .await?;
        }
        catalog.rename_database(live, &shelf).await?;
    }
    catalog.rename_database(&archived, live).await?;
    tracing::info!(live, "rolled back to pre-restore database");
    Ok(Rollback::RolledBack)
}

pub struct DatabaseDumpBackend {
    name: database::Name,
    def: database::Definition,
    pg_dump: Tool,
    pg_restore: Tool,
    pg_isready: Tool,
    gpg: Tool,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn ObjectStore>,
    work_dir: PathBuf,
    diagnostics: Mutex<Option<String>>,
}

impl DatabaseDumpBackend {
    pub fn new(
        name: database::Name,
        def: database::Definition,
        tools: &Tools,
        store: Arc<dyn ObjectStore>,
        work_dir: PathBuf,
    ) -> Self {
        let catalog = Arc::new(PsqlCatalog {
            psql: Tool::new("psql", &tools.psql),
            def: def.clone(),
        });
        DatabaseDumpBackend {
            name,
            def,
            pg_dump: Tool::new("pg_dump", &tools.pg_dump),
            pg_restore: Tool::new("pg_restore", &tools.pg_restore),
            pg_isready: Tool::new("pg_isready", &tools.pg_isready),
            gpg: Tool::new("gpg", &tools.gpg),
            catalog,
            store,
            work_dir,
            diagnostics: Mutex::new(None),
        }
    }

    fn connection_args(&self) -> Vec<String> {
        vec![
            "--host".to_owned(),
            self.def.host.clone(),
            "--port".to_owned(),
            self.def.port.to_string(),
            "--username".to_owned(),
            self.def.user.clone(),
        ]
    }

    fn record_diagnostics(&self, text: &str) {
        *self.diagnostics.lock().unwrap() = Some(text.to_owned());
    }

    fn passphrase(&self) -> Result<String, BackendError> {
        let secret = self.def.passphrase.as_ref().ok_or_else(|| {
            BackendError::InvalidRequest(
                "encryption requested but no passphrase is configured".to_owned(),
            )
        })?;
        Ok(secret.resolve()?)
    }

    async fn encrypt_dump(&self, local: &Path) -> Result<PathBuf, BackendError> {
        let passphrase = self.passphrase()?;
        let encrypted = local.with_extension("dump.gpg");
        let output = encrypted.display().to_string();
        let input = local.display().to_string();
        self.gpg
            .check_output(
                &[
                    "--batch",
                    "--yes",
                    "--symmetric",
                    "--cipher-algo",
                    "AES256",
                    "--passphrase",
                    passphrase.as_str(),
                    "--output",
                    output.as_str(),
                    input.as_str(),
                ],
                &[],
            )
            .await?;
        let _ = tokio::fs::remove_file(local).await;
        Ok(encrypted)
    }

    async fn decrypt_dump(&self, local: &Path) -> Result<PathBuf, BackendError> {
        let passphrase = self.passphrase()?;
        let plain = local.with_extension("");
        let output = plain.display().to_string();
        let input = local.display().to_string();
        self.gpg
            .check_output(
                &[
                    "--batch",
                    "--yes",
                    "--passphrase",
                    passphrase.as_str(),
                    "--output",
                    output.as_str(),
                    "--decrypt",
                    input.as_str(),
                ],
                &[],
            )
            .await?;
        let _ = tokio::fs::remove_file(local).await;
        Ok(plain)
    }
}

#[async_trait::async_trait]
impl Backend for DatabaseDumpBackend {
    fn label(&self) -> &'static str {
        "database-dump"
    }

    async fn preflight(&self) -> Result<(), BackendError> {
        let port = self.def.port.to_string();
        self.pg_isready
            .check_output(
                &[
                    "--host",
                    self.def.host.as_str(),
                    "--port",
                    port.as_str(),
                    "--timeout",
                    "10",
                ],
                &[],
            )
            .await?;
        Ok(())
    }

    async fn start_backup(&self, config: &OperationConfig) -> Result<StartOutcome, BackendError> {
        let db = &self.name.0;
        let encrypt = config.encrypt || self.def.encrypt;
        let now = OffsetDateTime::now_utc();
        let filename = format!("{}-{}.dump", db, timestamp_token(now));

        if config.dry_run {
            return Ok(StartOutcome::Finished(Finished::skipped(format!(
                "would dump database '{}' from {}:{} and upload '{}'{}",
                db,
                self.def.host,
                self.def.port,
                filename,
                if encrypt { " (encrypted)" } else { "" },
            ))));
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let local = self.work_dir.join(&filename);
        let password = self.def.password.resolve()?;
        let mut args = self.connection_args();
        args.extend([
            "--format=custom".to_owned(),
            "--file".to_owned(),
            local.display().to_string(),
            db.clone(),
        ]);

        tracing::info!(database = %db, "dumping database");
        let captured = self
            .pg_dump
            .output(&args, &[("PGPASSWORD", password.as_str())])
            .await?;
        if !captured.status.success() {
            self.record_diagnostics(&captured.stderr);
            let _ = tokio::fs::remove_file(&local).await;
            return Ok(StartOutcome::Finished(Finished::failed(format!(
                "pg_dump {}: {}",
                captured.status.message(),
                captured.stderr.trim()
            ))));
        }

        let (local, filename) = if encrypt {
            let encrypted = self.encrypt_dump(&local).await?;
            let filename = format!("{}.gpg", filename);
            (encrypted, filename)
        } else {
            (local, filename)
        };

        let upload = self.store.put(&local, db, &filename).await;
        let _ = tokio::fs::remove_file(&local).await;
        let artifact = upload?;
        Ok(StartOutcome::Finished(Finished::completed(vec![artifact])))
    }

    async fn start_restore(
        &self,
        config: &OperationConfig,
        source: &Artifact,
    ) -> Result<StartOutcome, BackendError> {
        let live = &self.name.0;
        if config.dry_run {
            return Ok(StartOutcome::Finished(Finished::skipped(format!(
                "would restore database '{}' from artifact '{}'",
                live, source.id
            ))));
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let basename = source.id.rsplit('/').next().unwrap_or(&source.id);
        let local = self.work_dir.join(basename);
        self.store.get(&source.id, &local).await?;
        let local = if basename.ends_with(".gpg") {
            self.decrypt_dump(&local).await?
        } else {
            local
        };

        let token = timestamp_token(OffsetDateTime::now_utc());
        let fresh = format!("{}_restore_{}", live, token.replace('-', "_"));
        self.catalog.create_database(&fresh).await?;

        let password = self.def.password.resolve()?;
        let mut args = self.connection_args();
        args.extend([
            "--format=custom".to_owned(),
            "--dbname".to_owned(),
            fresh.clone(),
            local.display().to_string(),
        ]);

        tracing::info!(database = %live, target = %fresh, "restoring into fresh database");
        let captured = self
            .pg_restore
            .output(&args, &[("PGPASSWORD", password.as_str())])
            .await?;
        let _ = tokio::fs::remove_file(&local).await;
        if !captured.status.success() {
            self.record_diagnostics(&captured.stderr);
            let _ = self.catalog.drop_database(&fresh).await;
            return Ok(StartOutcome::Finished(Finished::failed(format!(
                "pg_restore {}: {}",
                captured.status.message(),
                captured.stderr.trim()
            ))));
        }

        if let Err(error) = promote(self.catalog.as_ref(), live, &fresh, &token).await {
            tracing::error!(%error, "promotion failed, rolling back");
            if let Err(rollback_error) = rollback(self.catalog.as_ref(), live, &token).await {
                tracing::error!(%rollback_error, "rollback failed as well");
            }
            self.record_diagnostics(&error.to_string());
            return Ok(StartOutcome::Finished(Finished::failed(format!(
                "promotion failed and was rolled back: {}",
                error
            ))));
        }

        Ok(StartOutcome::Finished(Finished {
            status: OperationStatus::Completed,
            artifacts: vec![],
            detail: Some(format!(
                "restored '{}' from '{}'; previous data kept as '{}'",
                live,
                source.id,
                archived_name(live)
            )),
        }))
    }

    async fn query_status(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, BackendError> {
        // database operations complete synchronously and never issue handles
        Err(BackendError::UnknownHandle(handle.0.clone()))
    }

    async fn describe(&self, _handle: &OperationHandle) -> String {
        self.diagnostics
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "no diagnostics recorded".to_owned())
    }

    async fn list_artifacts(&self, owner: &str) -> Result<Vec<Artifact>, BackendError> {
        Ok(self.store.list(owner).await?)
    }
}

use crate::cli;
use rampart_core::{
    backend::{pgdump::DatabaseDumpBackend, velero::ClusterSnapshotBackend},
    config::Config,
    engine::OrchestrationEngine,
    exec::Tool,
    notify::{LogNotifier, Notifier, WebhookNotifier},
    operation::{Mode, OperationConfig, Target},
    probes::{Probe, ProbeSuite, SnapshotStatusSource},
    report::ReportFile,
    retention::RetentionPolicy,
    store::{ObjectStore, S3CliStore},
};
use std::{path::PathBuf, sync::Arc};
use time::OffsetDateTime;

pub async fn backup(config: &Config, args: cli::backup::Cli) -> eyre::Result<i32> {
    let target = config.target(&args.target)?;
    let operation = OperationConfig {
        environment: config.environment.clone(),
        mode: Mode::Backup,
        target,
        include_namespaces: args.include_namespaces,
        exclude_namespaces: args.exclude_namespaces,
        retention: args.retention.unwrap_or(config.retention.max_age),
        encrypt: args.encrypt,
        include_volumes: args.include_volumes,
        source_artifact: None,
        restore_namespace: None,
        dry_run: args.dry_run,
        probes: vec![],
    };
    run_operation(config, operation).await
}

pub async fn restore(config: &Config, args: cli::restore::Cli) -> eyre::Result<i32> {
    let target = config.target(&args.target)?;
    let operation = OperationConfig {
        environment: config.environment.clone(),
        mode: Mode::Restore,
        target,
        include_namespaces: args.include_namespaces,
        exclude_namespaces: vec![],
        retention: config.retention.max_age,
        encrypt: false,
        include_volumes: false,
        source_artifact: Some(args.from),
        restore_namespace: args.restore_namespace,
        dry_run: args.dry_run,
        probes: vec![],
    };
    run_operation(config, operation).await
}

pub async fn test(config: &Config, args: cli::test::Cli) -> eyre::Result<i32> {
    let operation = OperationConfig {
        environment: config.environment.clone(),
        mode: Mode::Test,
        target: Target::Environment(config.environment.clone()),
        include_namespaces: vec![],
        exclude_namespaces: vec![],
        retention: config.retention.max_age,
        encrypt: false,
        include_volumes: false,
        source_artifact: None,
        restore_namespace: None,
        dry_run: false,
        probes: args.probes,
    };
    run_operation(config, operation).await
}

pub fn config(config: &Config) -> eyre::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

pub async fn version(config: &Config) -> eyre::Result<()> {
    println!("rampart: {}", rampart_core::VERSION);
    let tools: [(&str, &str, &[&str]); 6] = [
        ("pg_dump", &config.tools.pg_dump, &["--version"]),
        ("pg_restore", &config.tools.pg_restore, &["--version"]),
        ("velero", &config.tools.velero, &["version", "--client-only"]),
        ("kubectl", &config.tools.kubectl, &["version", "--client"]),
        ("gpg", &config.tools.gpg, &["--version"]),
        ("storage", &config.tools.storage, &["--version"]),
    ];
    for (name, path, args) in tools {
        match Tool::new(name, path).version_string(args).await {
            Ok(version) => println!("{}: {}", name, version),
            Err(err) => println!(
                "Could not determine {} version ({}), is it installed correctly?",
                name, err
            ),
        }
    }
    Ok(())
}

async fn run_operation(config: &Config, operation: OperationConfig) -> eyre::Result<i32> {
    let started = OffsetDateTime::now_utc();
    let mut report_file = match &config.report_dir {
        Some(dir) => match ReportFile::create(dir, &config.environment, started) {
            Ok(file) => file,
            Err(error) => {
                tracing::warn!(%error, "cannot create report file, continuing without one");
                ReportFile::null()
            }
        },
        None => ReportFile::null(),
    };
    let instance_name = hostname::get()?.to_string_lossy().into_owned();
    report_file.append(&format!(
        "{} of '{}' starting on {}",
        operation.mode,
        operation.owner(),
        instance_name
    ));

    let engine = build_engine(config, &operation)?;
    let report = engine.run(&operation).await;
    report_file.finalize(&report);
    println!("{}", report.summary());
    Ok(report.exit_code())
}

fn build_engine(config: &Config, operation: &OperationConfig) -> eyre::Result<OrchestrationEngine> {
    let mut engine = OrchestrationEngine::new(notifier(config)?);
    match &operation.target {
        Target::Database(name, def) => {
            let store = storage(config)?
                .ok_or_else(|| eyre::eyre!("database targets need a [storage] section"))?;
            let backend = DatabaseDumpBackend::new(
                name.clone(),
                def.clone(),
                &config.tools,
                store.clone(),
                work_dir(config),
            );
            engine = engine
                .with_backend(Arc::new(backend))
                .with_retention(RetentionPolicy::new(store, operation.retention));
        }
        Target::Cluster(name, def) => {
            let backend = ClusterSnapshotBackend::new(
                name.clone(),
                def.clone(),
                velero_tool(config),
                kubectl_tool(config),
            );
            engine = engine.with_backend(Arc::new(backend));
        }
        Target::Environment(_) => {
            engine = engine.with_probes(probe_suite(config)?);
        }
    }
    Ok(engine)
}

fn notifier(config: &Config) -> eyre::Result<Arc<dyn Notifier>> {
    match &config.notify.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url.clone())?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}

fn storage(config: &Config) -> eyre::Result<Option<Arc<dyn ObjectStore>>> {
    Ok(config.storage.as_ref().map(|storage| {
        let tool = Tool::new(config.tools.storage.clone(), &config.tools.storage);
        Arc::new(S3CliStore::new(tool, storage)) as Arc<dyn ObjectStore>
    }))
}

fn velero_tool(config: &Config) -> Tool {
    Tool::new("velero", &config.tools.velero)
}

fn kubectl_tool(config: &Config) -> Tool {
    Tool::new("kubectl", &config.tools.kubectl)
}

fn work_dir(config: &Config) -> PathBuf {
    config.work_dir.clone().unwrap_or_else(std::env::temp_dir)
}

/// All configured probes, in a stable order: storage and freshness first,
/// then snapshot health per cluster, then the network checks.
fn probe_suite(config: &Config) -> eyre::Result<ProbeSuite> {
    let mut probes = Vec::new();

    if let Some(store) = storage(config)? {
        let mut databases: Vec<_> = config.databases.0.keys().cloned().collect();
        databases.sort();
        if let Some(first) = databases.first() {
            probes.push(Probe::storage_reachable(store.clone(), first.0.clone()));
        }
        for name in &databases {
            probes.push(Probe::backup_freshness(
                store.clone(),
                name.0.clone(),
                config.probes.max_backup_age,
            ));
        }
    }

    let mut clusters: Vec<_> = config.clusters.0.iter().collect();
    clusters.sort_by(|a, b| a.0.cmp(b.0));
    for (name, def) in clusters {
        let source: Arc<dyn SnapshotStatusSource> = Arc::new(ClusterSnapshotBackend::new(
            name.clone(),
            def.clone(),
            velero_tool(config),
            kubectl_tool(config),
        ));
        probes.push(Probe::snapshot_status(source, name.0.clone()));
    }

    for endpoint in &config.probes.endpoints {
        probes.push(Probe::connectivity(endpoint.host.clone(), endpoint.port));
    }
    for name in &config.probes.redundancy {
        probes.push(Probe::redundancy(name.clone()));
    }

    Ok(ProbeSuite::new(probes))
}

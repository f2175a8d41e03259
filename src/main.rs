use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use ragdex::{
    DataDir,
    DocumentDb,
    DocumentId,
    EngineConfig,
    Error,
    Result,
    RetrievalService,
    SnapshotStore,
    TenantId,
    TenantRegistry,
    cli::{AddArgs, Cli, Command, ConfigAction, EmbedderKind, SearchArgs},
    config::{self, MODEL_SETTING},
    embedding::{Embedder, EmbeddingProvider, HashingEmbedder},
    error::Operation,
    model_manager::ColbertEmbedder,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("RAGDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let db = Arc::new(DocumentDb::open(&data_dir.documents_db())?);

    match &cli.command {
        Command::Add(args) => {
            let service = open_service(&cli, &data_dir, &db)?;
            cmd_add(&service, &db, &cli.tenant, args)?;
            service.shutdown()?;
        }
        Command::Search(args) => {
            let service = open_service(&cli, &data_dir, &db)?;
            cmd_search(&service, &cli.tenant, args)?;
            service.shutdown()?;
        }
        Command::Rebuild => {
            let service = open_service(&cli, &data_dir, &db)?;
            let count = service.rebuild(&cli.tenant)?;
            println!(
                "Rebuilt index for tenant '{}' from {count} documents",
                cli.tenant
            );
        }
        Command::Status(args) => {
            cmd_status(&db, &data_dir, &cli.tenant, args.json)?;
        }
        Command::Config { action } => match action {
            ConfigAction::Show { json } => {
                cmd_config_show(&db, cli.model.as_deref(), *json)?;
            }
            ConfigAction::Set { key, value } => {
                cmd_config_set(&db, key, value)?;
            }
            ConfigAction::Unset { key } => {
                if db.remove_setting(key)? {
                    println!("Removed setting '{key}'");
                } else {
                    println!("Setting '{key}' was not set");
                }
            }
        },
        Command::Completions(_) => {}
    }

    Ok(())
}

fn open_service(
    cli: &Cli,
    data_dir: &DataDir,
    db: &Arc<DocumentDb>,
) -> Result<RetrievalService> {
    let config = EngineConfig::from_settings(db)?;

    let provider: Arc<dyn EmbeddingProvider> = match cli.embedder {
        EmbedderKind::Colbert => {
            let model_id = config::resolve_model_id(cli.model.as_deref(), db)?;
            Arc::new(ColbertEmbedder::with_model_id(model_id))
        }
        EmbedderKind::Hashing => {
            Arc::new(HashingEmbedder::new(config.hashing_dimension))
        }
    };
    let embedder = Embedder::new(provider)
        .with_timeout(config.embed_timeout)
        .with_attempts(config.embed_attempts);

    let registry = TenantRegistry::new(
        SnapshotStore::new(data_dir.snapshots_dir()?),
        db.clone(),
        embedder,
        config,
    );
    Ok(RetrievalService::new(registry))
}

fn cmd_add(
    service: &RetrievalService,
    db: &DocumentDb,
    tenant: &TenantId,
    args: &AddArgs,
) -> Result<()> {
    let text = match (&args.text, &args.file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => {
            return Err(Error::Config("either --text or --file is required".into()));
        }
    };
    let document = DocumentId::new(args.document_id.as_str());

    // Load the tenant first so a fresh index is not built with this
    // document already in the store.
    let result = service
        .registry()
        .get_or_create(tenant)
        .and_then(|handle| {
            if handle.read().mapping.contains(document.as_str()) {
                return Err(Error::DuplicateDocument {
                    tenant: tenant.to_string(),
                    document: document.to_string(),
                });
            }
            db.put_document(tenant, &document, &text)
        })
        .and_then(|()| service.add_document(tenant, document.clone(), &text));

    match result {
        Ok(_) => {
            println!("Indexed '{document}' for tenant '{tenant}'");
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.user_message(Operation::AddDocument));
            Err(e)
        }
    }
}

#[derive(Serialize)]
struct SearchOutput<'a> {
    tenant: &'a TenantId,
    query: &'a str,
    results: Vec<ragdex::SearchHit>,
}

fn cmd_search(
    service: &RetrievalService,
    tenant: &TenantId,
    args: &SearchArgs,
) -> Result<()> {
    let hits = match service.search(tenant, &args.query, args.count) {
        Ok(hits) => hits,
        Err(e) => {
            eprintln!("{}", e.user_message(Operation::Search));
            return Err(e);
        }
    };

    if args.json {
        let output = SearchOutput {
            tenant,
            query: &args.query,
            results: hits,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if hits.is_empty() {
        println!("No results.");
    } else {
        for (rank, hit) in hits.iter().enumerate() {
            println!(
                "{:>3}. {} (score: {:.3})",
                rank + 1,
                hit.document_id,
                hit.score
            );
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct TenantSummary {
    tenant: TenantId,
    documents: usize,
    indexed: Option<usize>,
    model: Option<String>,
}

fn cmd_status(
    db: &DocumentDb,
    data_dir: &DataDir,
    current: &TenantId,
    json: bool,
) -> Result<()> {
    let store = SnapshotStore::new(data_dir.snapshots_dir()?);
    let mut tenants = db.list_tenants()?;
    if !tenants.contains(current) {
        tenants.push(current.clone());
        tenants.sort();
    }

    let mut summaries = Vec::with_capacity(tenants.len());
    for tenant in tenants {
        let documents = db.count_documents(&tenant)?;
        let meta = match store.read_meta(&tenant) {
            Ok(meta) => meta,
            Err(Error::CorruptSnapshot(reason)) => {
                tracing::warn!(tenant = %tenant, %reason, "unreadable snapshot");
                None
            }
            Err(e) => return Err(e),
        };
        summaries.push(TenantSummary {
            tenant,
            documents,
            indexed: meta.as_ref().map(|m| m.node_count),
            model: meta.map(|m| m.model_id),
        });
    }

    if json {
        let output = serde_json::json!({
            "data_dir": data_dir.root(),
            "tenants": summaries,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        for s in &summaries {
            let indexed = s
                .indexed
                .map_or_else(|| "no snapshot".to_string(), |n| format!("{n} indexed"));
            println!("  {}: {} documents, {indexed}", s.tenant, s.documents);
            if let Some(model) = &s.model {
                println!("    model: {model}");
            }
        }
    }
    Ok(())
}

fn cmd_config_show(
    db: &DocumentDb,
    model: Option<&str>,
    json: bool,
) -> Result<()> {
    let config = EngineConfig::from_settings(db)?;
    let model_id = config::resolve_model_id(model, db)?;
    let mut entries: Vec<(&str, String)> = config.entries();
    entries.push((MODEL_SETTING, model_id));

    if json {
        let map: serde_json::Map<String, serde_json::Value> = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        for (key, value) in entries {
            println!("{key} = {value}");
        }
    }
    Ok(())
}

fn cmd_config_set(db: &DocumentDb, key: &str, value: &str) -> Result<()> {
    let mut config = EngineConfig::from_settings(db)?;
    config.apply(key, value)?;
    config.validate()?;
    db.set_setting(key, value)?;
    println!("Set {key} = {value}");
    Ok(())
}

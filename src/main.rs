use std::sync::Arc;

use annosearch::{
    DataDir,
    FsRepository,
    IndexConfig,
    IndexDb,
    ManualScheduler,
    QueryOutcome,
    SearchService,
    error::{self, Error},
    physical::{GroupedResults, SearchQuery},
    repository::DocumentRepository,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("ANNOSEARCH_LOG") {
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

/// Everything a command needs, wired from the data directory.
struct App {
    service: SearchService,
    scheduler: Arc<ManualScheduler>,
    repository: Arc<FsRepository>,
    data_dir: DataDir,
    config: IndexConfig,
}

impl App {
    fn open(cli: &Cli) -> error::Result<Self> {
        let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
        let db = Arc::new(IndexDb::open(&data_dir.index_db())?);
        let config = IndexConfig::load(&db)?;
        let provider = config.build_provider(&data_dir)?;

        let workspace = cli
            .workspace
            .clone()
            .unwrap_or_else(|| data_dir.default_workspace());
        let repository = Arc::new(FsRepository::new(workspace));
        let scheduler = Arc::new(ManualScheduler::new());
        let service = SearchService::new(
            db,
            provider,
            scheduler.clone(),
            repository.clone(),
            &config,
        );

        Ok(Self {
            service,
            scheduler,
            repository,
            data_dir,
            config,
        })
    }
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    init_tracing(cli.verbose, cli.quiet);
    let app = App::open(&cli)?;

    match &cli.command {
        Command::Reindex(args) => cmd_reindex(&app, &args.project)?,
        Command::Search(args) => cmd_search(&app, args)?,
        Command::Status(args) => {
            cmd_status(&app, args.project.as_deref(), args.json)?
        }
        Command::Remove(args) => cmd_remove(&app, &args.project)?,
        Command::Completions(_) => {}
    }

    Ok(())
}

fn cmd_reindex(app: &App, name: &str) -> error::Result<()> {
    let project = app.repository.project(name)?;
    app.service.reindex(project.id)?;

    if app.service.is_index_valid(project.id) {
        println!("Reindexed project '{name}'");
    } else if !app.service.is_supported() {
        eprintln!("Search is disabled; nothing to reindex.");
    } else {
        eprintln!("Warning: index for '{name}' is not valid after rebuild");
    }
    Ok(())
}

fn cmd_search(app: &App, args: &cli::SearchArgs) -> error::Result<()> {
    let project = app.repository.project(&args.project)?;

    let mut query = SearchQuery::new(&args.user, &args.query)
        .page(args.offset, args.count);
    if let Some(name) = &args.document {
        let source = app
            .repository
            .source_documents(project.id)?
            .into_iter()
            .find(|doc| &doc.name == name)
            .ok_or_else(|| Error::NotFound {
                kind: "document",
                name: name.clone(),
            })?;
        query = query.in_document(source.id);
    }
    if let Some(layer) = &args.layer {
        query = query.on_layer(layer);
    }
    if let Some(feature) = &args.feature {
        query = query.grouped_by(feature);
    }

    let mut outcome = app.service.query(project.id, &query)?;
    if !outcome.is_ready() && args.wait {
        let ran = app.scheduler.run_pending(&app.service);
        tracing::debug!(ran, "ran scheduled indexing tasks");
        outcome = app.service.query(project.id, &query)?;
    }

    match outcome {
        QueryOutcome::Ready(results) => {
            if args.json {
                println!("{}", serde_json::to_string(&results)?);
            } else {
                format_human(&results);
            }
        }
        QueryOutcome::NotReady => {
            eprintln!(
                "The search index for '{}' is still building. Retry with --wait, or run `annosearch reindex {}`.",
                args.project, args.project
            );
        }
    }
    Ok(())
}

fn format_human(results: &GroupedResults) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (group, hits) in results {
        println!("{group} ({} hits)", hits.len());
        for hit in hits {
            println!(
                "  {}:{}  {} [{}] {}",
                hit.document_title,
                hit.offset_start,
                hit.left_context,
                hit.text,
                hit.right_context
            );
        }
    }
}

fn cmd_status(app: &App, only: Option<&str>, json: bool) -> error::Result<()> {
    let records = app.service.list_indexes()?;
    let projects = match only {
        Some(name) => vec![app.repository.project(name)?],
        None => app.repository.projects()?,
    };

    let rows: Vec<(String, &'static str)> = projects
        .into_iter()
        .map(|project| {
            let state = match records.iter().find(|r| r.project == project.id) {
                None => "uncreated",
                Some(record) if record.invalid => "stale",
                Some(_) => "valid",
            };
            (project.name, state)
        })
        .collect();

    let provider = app.config.provider.to_string();

    if json {
        let projects: Vec<_> = rows
            .iter()
            .map(|(name, state)| serde_json::json!({ "project": name, "index": state }))
            .collect();
        let status = serde_json::json!({
            "data_dir": app.data_dir.root().display().to_string(),
            "provider": provider,
            "projects": projects,
        });
        println!("{status}");
    } else {
        println!("Data directory: {}", app.data_dir.root().display());
        println!("Provider: {provider}");
        println!("Projects: {}", rows.len());
        for (name, state) in &rows {
            println!("  {name}: {state}");
        }
    }
    Ok(())
}

fn cmd_remove(app: &App, name: &str) -> error::Result<()> {
    let project = app.repository.project(name)?;
    app.service.remove_project(project.id)?;
    println!("Removed index for project '{name}'");
    Ok(())
}

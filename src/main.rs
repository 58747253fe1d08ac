use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::Parser;
use docsift::{
    Config,
    ConfigDb,
    DataDir,
    Error,
    FileType,
    Result,
    SearchOrchestrator,
    SearchResults,
    TopicTree,
    model::{DateRange, SearchFilters, SearchOptions, SortKey},
    topics::TopicNode,
};
use kdam::{Bar, BarExt, tqdm};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction, DirAction, SearchArgs};

const LOG_ENV_VAR: &str = "DOCSIFT_LOG";

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
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

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    match cli.command {
        Command::Dir { action } => {
            let config_db = ConfigDb::open(&data_dir.config_db())?;
            match action {
                DirAction::Add { path, name } => {
                    dir_add(&config_db, &path, name.as_deref())?;
                }
                DirAction::Remove { name } => {
                    let root = config_db.get_directory(&name)?.ok_or_else(|| {
                        Error::NotFound {
                            kind: "directory",
                            name: name.clone(),
                        }
                    })?;
                    drop(config_db);
                    let orchestrator = SearchOrchestrator::open(&data_dir)?;
                    let removed =
                        orchestrator.forget_directory(Path::new(&root)).await?;
                    if let Some(config_db) = orchestrator.config_db() {
                        config_db.remove_directory(&name)?;
                    }
                    println!("Removed directory '{name}' ({removed} documents)");
                }
                DirAction::List { json } => dir_list(&config_db, json)?,
            }
        }
        Command::Sync(args) => cmd_sync(&data_dir, args.name.as_deref()).await?,
        Command::Search(args) => {
            let orchestrator = SearchOrchestrator::open(&data_dir)?;
            let options = search_options(&orchestrator, &args)?;
            let results = orchestrator.search(&args.query, &options).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
        }
        Command::Suggest { partial } => {
            let orchestrator = SearchOrchestrator::open(&data_dir)?;
            for s in orchestrator.get_suggestions(&partial).await? {
                println!("{}\t{}", s.term, s.frequency);
            }
        }
        Command::Topics(args) => {
            let orchestrator = SearchOrchestrator::open(&data_dir)?;
            let tree = if args.regenerate {
                orchestrator.generate_topic_hierarchy().await?
            } else {
                orchestrator.get_topic_tree()
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(tree.as_ref())?);
            } else {
                print_topics(&tree);
            }
        }
        Command::Reencode(args) => {
            let orchestrator = SearchOrchestrator::open(&data_dir)?;
            if args.retry_legacy {
                let result = orchestrator.retry_legacy_documents().await?;
                println!(
                    "Retried {} legacy documents: {} migrated, {} remaining",
                    result.attempted,
                    result.migrated.len(),
                    result.still_legacy.len()
                );
            } else {
                cmd_reencode(&orchestrator, &args.model).await?;
            }
        }
        Command::Status(args) => {
            let orchestrator = SearchOrchestrator::open(&data_dir)?;
            let status = orchestrator.status().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Data directory: {}", data_dir.root().display());
                println!("Documents: {}", status.documents);
                println!("Model: {}", status.current_model);
                if let Some(pending) = &status.pending_model {
                    println!("Re-encoding to: {pending}");
                }
                if status.legacy_documents > 0 {
                    println!("Legacy documents: {}", status.legacy_documents);
                }
                println!(
                    "Topics: {} (generation {})",
                    status.total_topics, status.topic_generation
                );
            }
        }
        Command::Config { action } => {
            let config_db = ConfigDb::open(&data_dir.config_db())?;
            match action {
                ConfigAction::Show => {
                    let config = Config::load(&config_db)?;
                    println!("{}", serde_json::to_string_pretty(&config)?);
                }
                ConfigAction::Set { key, value } => {
                    Config::set(&config_db, &key, &value)?;
                    println!("Set {key} = {value}");
                }
            }
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn dir_add(config_db: &ConfigDb, path: &Path, name: Option<&str>) -> Result<()> {
    if !path.is_dir() {
        return Err(Error::Config(format!(
            "not a directory: {}",
            path.display()
        )));
    }
    let abs_path = path.canonicalize().map_err(|e| {
        Error::Config(format!("cannot resolve path {}: {e}", path.display()))
    })?;
    let name = match name {
        Some(name) => name.to_string(),
        None => abs_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Config("cannot derive a name; pass --name".into()))?,
    };

    if config_db.get_directory(&name)?.is_some() {
        return Err(Error::Config(format!("directory '{name}' already exists")));
    }
    config_db.set_directory(&name, &abs_path.to_string_lossy())?;

    println!("Added directory '{name}' -> {}", abs_path.display());
    Ok(())
}

fn dir_list(config_db: &ConfigDb, json: bool) -> Result<()> {
    let directories = config_db.list_directories()?;
    if json {
        let entries: Vec<serde_json::Value> = directories
            .iter()
            .map(|(name, path)| serde_json::json!({ "name": name, "path": path }))
            .collect();
        println!("{}", serde_json::to_string(&entries)?);
    } else if directories.is_empty() {
        println!("No directories registered.");
    } else {
        for (name, path) in &directories {
            println!("{name}\t{path}");
        }
    }
    Ok(())
}

async fn cmd_sync(data_dir: &DataDir, only: Option<&str>) -> Result<()> {
    let directories = {
        let config_db = ConfigDb::open(&data_dir.config_db())?;
        match only {
            Some(name) => {
                let path = config_db.get_directory(name)?.ok_or_else(|| {
                    Error::NotFound {
                        kind: "directory",
                        name: name.to_string(),
                    }
                })?;
                vec![(name.to_string(), path)]
            }
            None => config_db.list_directories()?,
        }
    };
    if directories.is_empty() {
        eprintln!("No directories to sync.");
        return Ok(());
    }

    let orchestrator = SearchOrchestrator::open(data_dir)?;
    for (name, path) in &directories {
        let root = Path::new(path);
        if !root.is_dir() {
            eprintln!("Warning: directory '{name}' does not exist: {path}");
            continue;
        }

        let mut progress = orchestrator.subscribe_indexing();
        let work = orchestrator.sync_directory(root);
        tokio::pin!(work);
        let mut bar: Option<Bar> = None;
        let report = loop {
            tokio::select! {
                report = &mut work => break report?,
                Some(event) = progress.recv() => {
                    let bar = bar.get_or_insert_with(|| {
                        tqdm!(total = event.total, desc = name.clone(), unit = "doc")
                    });
                    bar.update_to(event.processed)?;
                }
            }
        };
        if let Some(mut bar) = bar {
            bar.refresh()?;
            eprintln!();
        }

        if report.is_noop() {
            eprintln!("{name}: up to date");
        } else {
            eprintln!(
                "{name}: {} new, {} modified, {} removed, {} failed",
                report.created, report.modified, report.removed, report.indexing.failed
            );
            for (path, reason) in &report.indexing.failures {
                eprintln!("  {path}: {reason}");
            }
        }
    }
    Ok(())
}

async fn cmd_reencode(orchestrator: &SearchOrchestrator, model: &str) -> Result<()> {
    let handle = orchestrator.start_re_encoding(model).await?;
    let job = handle.job();
    let mut progress = handle.progress();
    let mut bar = tqdm!(
        total = job.total,
        desc = format!("{} -> {}", job.old_model, job.new_model),
        unit = "doc"
    );
    while progress.changed().await.is_ok() {
        let job = progress.borrow_and_update().clone();
        bar.update_to(job.processed)?;
        if job.completed || job.cancelled {
            break;
        }
    }
    bar.refresh()?;
    eprintln!();

    let result = handle.wait().await?;
    if result.flipped {
        println!(
            "Now serving {}: {} migrated, {} skipped, {} left on {}",
            result.new_model,
            result.migrated,
            result.skipped,
            result.failed_documents.len(),
            result.old_model
        );
        if orchestrator.config().topics.enabled
            && let Err(e) = orchestrator.generate_topic_hierarchy().await
        {
            tracing::warn!(error = %e, "topic regeneration failed");
        }
    } else {
        println!("Re-encoding cancelled; still serving {}", result.old_model);
    }
    Ok(())
}

fn search_options(
    orchestrator: &SearchOrchestrator,
    args: &SearchArgs,
) -> Result<SearchOptions> {
    let defaults = orchestrator.default_options();
    let file_types = args
        .file_types
        .iter()
        .map(|t| t.parse::<FileType>())
        .collect::<Result<Vec<_>>>()?;
    let since = args.since.as_deref().map(|d| parse_date(d, NaiveTime::default())).transpose()?;
    let until = args
        .until
        .as_deref()
        .map(|d| parse_date(d, end_of_day()))
        .transpose()?;

    Ok(SearchOptions {
        enable_exact: defaults.enable_exact && !args.no_exact,
        enable_fuzzy: defaults.enable_fuzzy && !args.no_fuzzy,
        enable_semantic: defaults.enable_semantic && !args.no_semantic,
        filters: SearchFilters {
            date_range: (since.is_some() || until.is_some()).then_some(DateRange {
                from: since,
                to: until,
            }),
            file_types,
            min_relevance: args.min_score,
        },
        sort: args.sort.parse::<SortKey>()?,
        page: args.page,
        page_size: args.page_size.unwrap_or(defaults.page_size),
        topic_path: args.topic.clone(),
    })
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::default())
}

fn parse_date(raw: &str, time: NaiveTime) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
        Error::InvalidOptions(format!("invalid date '{raw}': {e}"))
    })?;
    Ok(date.and_time(time).and_utc())
}

fn print_results(results: &SearchResults) {
    if let Some(error) = &results.syntax_error {
        eprintln!("Note: {error}; keyword matching skipped");
    }
    for report in results.strategies.iter().filter(|r| r.is_failure()) {
        eprintln!("Note: {} search did not complete", report.strategy);
    }
    if results.unavailable {
        eprintln!("Search is currently unavailable.");
        return;
    }
    if results.results.is_empty() {
        println!("No results for '{}'.", results.query);
        if !results.spelling_suggestions.is_empty() {
            let words: Vec<&str> = results
                .spelling_suggestions
                .iter()
                .map(|s| s.suggestion.as_str())
                .collect();
            println!("Did you mean: {}?", words.join(", "));
        }
        return;
    }

    let offset = (results.page - 1) * results.page_size;
    for (i, r) in results.results.iter().enumerate() {
        let kinds: Vec<&str> = r.match_types.iter().map(|m| m.as_str()).collect();
        println!(
            "{:>3}. {:.3}  {}  {}#{}  [{}]",
            offset + i + 1,
            r.relevance_score,
            r.title,
            r.path,
            r.page_number,
            kinds.join(",")
        );
        if !r.snippet.text.is_empty() {
            println!("       {}", r.snippet.text.replace('\n', " "));
        }
    }
    println!(
        "\npage {}/{} ({} results{})",
        results.page,
        results.total_pages(),
        results.total,
        if results.from_cache { ", cached" } else { "" }
    );
}

fn print_topics(tree: &TopicTree) {
    if tree.is_empty() {
        println!("No topics yet; run `docsift topics --regenerate`.");
        return;
    }
    fn walk(node: &TopicNode, depth: usize) {
        println!(
            "{}{} ({} docs, {:.2})  {}",
            "  ".repeat(depth),
            node.name,
            node.document_count,
            node.relevance_score,
            node.path
        );
        for child in &node.children {
            walk(child, depth + 1);
        }
    }
    for root in &tree.roots {
        walk(root, 0);
    }
    println!(
        "\n{} topics, generation {}",
        tree.total_topics, tree.generation
    );
}

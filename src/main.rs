//! Contentflow - content generation pipeline orchestrator.
//!
//! Each project runs a five-stage pipeline (keyword research, content
//! briefs, article writing, social media, YouTube scripts) with its
//! state persisted as a JSON snapshot in the project's directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use contentflow::core::{
    ConfigOverrides, ExportFormat, PipelineEngine, ProgressUpdate, ProjectRecord, ProjectStore,
    Settings, Stage, StageRunResult, ERROR_SENTINEL,
};

/// Content pipeline orchestrator
#[derive(Parser)]
#[command(name = "contentflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Root directory holding project directories
    #[arg(long, global = true, env = "CONTENTFLOW_PROJECTS_DIR")]
    projects_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new project
    Create {
        /// Project name
        name: String,

        /// Project description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Seed keywords (repeatable)
        #[arg(short, long = "keyword", required = true)]
        keywords: Vec<String>,

        /// Target location for keyword research
        #[arg(long)]
        location: Option<String>,

        /// Target content language
        #[arg(long)]
        language: Option<String>,

        /// Content generation backend (claude, openai)
        #[arg(long)]
        generator: Option<String>,

        /// Minimum monthly search volume
        #[arg(long)]
        min_volume: Option<u32>,
    },

    /// List all projects
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Include full record details
        #[arg(short, long)]
        details: bool,
    },

    /// Show one project in full
    Show {
        /// Project id (or unique prefix of one)
        id: String,
    },

    /// Run a single stage or the whole pipeline
    Run {
        /// Project id
        id: String,

        /// Stage to run; omit to run the full pipeline
        #[arg(short, long)]
        stage: Option<Stage>,

        /// Start the pipeline at this stage
        #[arg(long, conflicts_with = "stage")]
        from: Option<Stage>,

        /// Re-run stages that already completed
        #[arg(short, long)]
        force: bool,
    },

    /// Delete a project and its files
    Delete {
        /// Project id
        id: String,
    },

    /// Search projects by name, description, or seed keywords
    Search {
        /// Search query
        query: String,
    },

    /// Duplicate a project's configuration and inputs
    Duplicate {
        /// Source project id
        id: String,

        /// Name for the new project
        new_name: String,
    },

    /// Validate that a project is ready to run
    Validate {
        /// Project id
        id: String,
    },

    /// Show aggregate statistics across all projects
    Stats,

    /// Export the project list
    Export {
        /// Output format (json, csv)
        #[arg(short, long, default_value = "json")]
        format: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("warn") };

    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    let mut settings = Settings::load()?;
    if let Some(dir) = cli.projects_dir {
        settings.projects_dir = dir;
    }
    let store = Arc::new(ProjectStore::new(&settings));

    match cli.command {
        Commands::Create { name, description, keywords, location, language, generator, min_volume } => {
            let overrides = ConfigOverrides {
                target_location: location,
                target_language: language,
                content_generator: generator,
                min_search_volume: min_volume,
                ..ConfigOverrides::default()
            };
            cmd_create(&store, &name, &description, keywords, &overrides)?;
        }
        Commands::List { format, details } => {
            cmd_list(&store, &format, details)?;
        }
        Commands::Show { id } => {
            cmd_show(&store, &id)?;
        }
        Commands::Run { id, stage, from, force } => {
            let engine = PipelineEngine::script_defaults(Arc::clone(&store), &settings);
            cmd_run(&engine, &id, stage, from, force)?;
        }
        Commands::Delete { id } => {
            cmd_delete(&store, &id)?;
        }
        Commands::Search { query } => {
            cmd_search(&store, &query)?;
        }
        Commands::Duplicate { id, new_name } => {
            let record = store.duplicate(&id, &new_name)?;
            println!("Created {} ({})", record.name, record.id);
        }
        Commands::Validate { id } => {
            let engine = PipelineEngine::script_defaults(Arc::clone(&store), &settings);
            cmd_validate(&engine, &id)?;
        }
        Commands::Stats => {
            cmd_stats(&store)?;
        }
        Commands::Export { format } => {
            cmd_export(&store, &format)?;
        }
    }

    Ok(())
}

/// Create a project and print its identity.
fn cmd_create(
    store: &ProjectStore,
    name: &str,
    description: &str,
    keywords: Vec<String>,
    overrides: &ConfigOverrides,
) -> Result<()> {
    let record = store.create(name, description, keywords, overrides)?;
    println!("Created project {}", record.name);
    println!("  id:   {}", record.id);
    println!("  path: {}", record.project_path.display());
    Ok(())
}

/// List projects as a table or JSON.
fn cmd_list(store: &ProjectStore, format: &str, details: bool) -> Result<()> {
    let records = store.list(details)?;
    match format {
        "json" => {
            if details {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                let summaries: Vec<_> =
                    records.iter().map(ProjectRecord::status_summary).collect();
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            }
        }
        "text" => {
            if records.is_empty() {
                println!("No projects found.");
                return Ok(());
            }
            for record in &records {
                println!(
                    "{}  {:<30} {:>5.1}%  {}",
                    &record.id[..8.min(record.id.len())],
                    record.name,
                    record.completion_percentage(),
                    record.created_at.format("%Y-%m-%d"),
                );
            }
        }
        other => bail!("unknown format: {other}"),
    }
    Ok(())
}

/// Show one project's full status.
fn cmd_show(store: &ProjectStore, id: &str) -> Result<()> {
    let Some(record) = store.load(id)? else {
        bail!("project {id} not found");
    };
    println!("{} ({})", record.name, record.id);
    if !record.description.is_empty() {
        println!("  {}", record.description);
    }
    println!("  path:       {}", record.project_path.display());
    println!("  created:    {}", record.created_at.format("%Y-%m-%d %H:%M UTC"));
    println!("  completion: {:.1}%", record.completion_percentage());
    println!("  keywords:   {}", record.input_data.seed_keywords.join(", "));
    println!();
    for stage in Stage::ALL {
        let status = record.stage_status(stage);
        let files = record.outputs(stage).len();
        println!("  {:<18} {:<10} {} file(s)", stage.to_string(), status.status.to_string(), files);
        if let Some(ref err) = status.error {
            println!("    error: {err}");
        }
    }
    Ok(())
}

/// Run a stage or the pipeline, streaming progress to stdout.
fn cmd_run(
    engine: &PipelineEngine,
    id: &str,
    stage: Option<Stage>,
    from: Option<Stage>,
    force: bool,
) -> Result<()> {
    engine.subscribe(print_progress);

    if let Some(stage) = stage {
        let result = engine.run_stage(id, stage, force)?;
        report_stage(&result);
        if !result.success {
            std::process::exit(1);
        }
        return Ok(());
    }

    let result = engine.run_pipeline(id, from, force)?;
    for stage_result in &result.results {
        report_stage(stage_result);
    }
    if result.success {
        println!("Pipeline completed.");
    } else {
        println!("Pipeline failed.");
        std::process::exit(1);
    }
    Ok(())
}

fn print_progress(update: &ProgressUpdate) {
    if (update.progress - ERROR_SENTINEL).abs() < f32::EPSILON {
        eprintln!("[{}] error: {}", update.scope, update.message);
    } else {
        eprintln!("[{}] {:>5.1}% {}", update.scope, update.progress, update.message);
    }
}

fn report_stage(result: &StageRunResult) {
    let mark = if result.success { "ok" } else { "failed" };
    println!("{:<18} {:<6} {}", result.stage.to_string(), mark, result.message);
    for file in &result.outputs {
        println!("  -> {file}");
    }
}

/// Delete a project directory.
fn cmd_delete(store: &ProjectStore, id: &str) -> Result<()> {
    if store.delete(id)? {
        println!("Deleted project {id}");
    } else {
        println!("Project {id} not found");
    }
    Ok(())
}

/// Search projects.
fn cmd_search(store: &ProjectStore, query: &str) -> Result<()> {
    let matches = store.search(query)?;
    if matches.is_empty() {
        println!("No projects match '{query}'.");
        return Ok(());
    }
    for record in &matches {
        println!("{}  {}", &record.id[..8.min(record.id.len())], record.name);
    }
    Ok(())
}

/// Pre-flight validation report.
fn cmd_validate(engine: &PipelineEngine, id: &str) -> Result<()> {
    let report = engine.validate_setup(id)?;
    if report.valid {
        println!("Project is ready to run.");
    } else {
        println!("Project is not ready:");
        for issue in &report.issues {
            println!("  - {issue}");
        }
        std::process::exit(1);
    }
    Ok(())
}

/// Aggregate statistics across all projects.
fn cmd_stats(store: &ProjectStore) -> Result<()> {
    let stats = store.statistics()?;
    println!("Projects:         {}", stats.total);
    println!("  completed:      {}", stats.completed);
    println!("  in progress:    {}", stats.in_progress);
    println!("  pending:        {}", stats.pending);
    println!("Articles written: {}", stats.articles_written);
    println!("Avg completion:   {:.1}%", stats.average_completion);
    Ok(())
}

/// Export the project list as JSON or CSV.
fn cmd_export(store: &ProjectStore, format: &str) -> Result<()> {
    let format = match format {
        "json" => ExportFormat::Json,
        "csv" => ExportFormat::Csv,
        other => bail!("unknown format: {other}"),
    };
    print!("{}", store.export_list(format)?);
    Ok(())
}

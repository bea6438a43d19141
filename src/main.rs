mod cues;
mod db;
mod docmap;
mod extract;
mod gateway;
mod normalize;
mod pipeline;
mod retrieval;
mod strip;

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};

use crate::cues::Cues;
use crate::gateway::{Embed, Generate, OpenAiProvider};
use crate::pipeline::{Mode, RunOptions};
use crate::retrieval::{SearchFilters, SearchOutcome};

#[derive(Parser)]
#[command(name = "textbook_ingest", about = "Textbook OCR corpus ingestion and retrieval")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum IngestMode {
    /// Run all stages from raw OCR text
    Full,
    /// Skip the normalizer and stripper
    FromNormalized,
    /// Rebuild the document map and entities from stored pages
    Resegment,
    /// Re-run only gateway-backed corrections
    LlmRepair,
}

impl From<IngestMode> for Mode {
    fn from(m: IngestMode) -> Self {
        match m {
            IngestMode::Full => Mode::Full,
            IngestMode::FromNormalized => Mode::FromNormalized,
            IngestMode::Resegment => Mode::Resegment,
            IngestMode::LlmRepair => Mode::LlmRepairOnly,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,
    /// Register a book
    AddBook {
        title: String,
        #[arg(short, long)]
        subject: Option<String>,
        #[arg(short, long)]
        grade: Option<String>,
    },
    /// Ingest one source document
    Ingest {
        #[arg(long)]
        book_id: i64,
        #[arg(long)]
        source_id: i64,
        /// Pages as JSON ({page_index, raw_text, quality_score}) or paged markdown
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value = "full")]
        mode: IngestMode,
        /// Cue overrides (JSON); defaults cover Russian textbooks
        #[arg(long)]
        cues: Option<PathBuf>,
        /// Enable gateway-backed span re-typing and OCR repair
        #[arg(long)]
        llm: bool,
        /// Pages below this quality get gateway repair (with --llm)
        #[arg(long, default_value = "0.7")]
        quality_floor: f64,
        /// Spans below this confidence get gateway re-typing (with --llm)
        #[arg(long, default_value = "0.55")]
        span_floor: f64,
        #[arg(long, default_value = "artifacts")]
        artifacts: PathBuf,
    },
    /// Search extracted problems
    Search {
        query: Vec<String>,
        #[arg(short, long)]
        book: Option<i64>,
        #[arg(short, long)]
        subject: Option<String>,
        #[arg(short, long)]
        grade: Option<String>,
        /// Candidates shown when no single match is confident
        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,
        /// Blend embedding similarity into the ranking
        #[arg(long)]
        llm: bool,
    },
    /// Metrics report for one ingested source
    Metrics {
        #[arg(long)]
        book_id: i64,
        #[arg(long)]
        source_id: i64,
        #[arg(long)]
        version: Option<i64>,
    },
    /// Show corpus statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            println!("Schema ready.");
            Ok(())
        }
        Commands::AddBook { title, subject, grade } => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            let id = db::add_book(&conn, &title, subject.as_deref(), grade.as_deref())?;
            println!("Added book {} (id {})", title, id);
            Ok(())
        }
        Commands::Ingest {
            book_id,
            source_id,
            input,
            mode,
            cues,
            llm,
            quality_floor,
            span_floor,
            artifacts,
        } => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            if db::get_book(&conn, book_id)?.is_none() {
                println!("No book with id {}. Run 'add-book' first.", book_id);
                return Ok(());
            }
            let cue_config = match cues {
                Some(path) => Cues::load(&path)?,
                None => Cues::default(),
            };
            let cue_set = cue_config.compile()?;
            let provider = if llm { Some(OpenAiProvider::from_env()?) } else { None };
            let opts = RunOptions {
                book_id,
                source_id,
                mode: mode.into(),
                input,
                quality_floor,
                span_floor,
                artifacts_root: artifacts,
            };
            let out = pipeline::run(
                &conn,
                provider.as_ref().map(|p| p as &dyn Generate),
                &cue_set,
                &opts,
            )
            .await?;
            out.print();
            Ok(())
        }
        Commands::Search { query, book, subject, grade, limit, llm } => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            let query = query.join(" ");
            if query.trim().is_empty() {
                println!("Empty query.");
                return Ok(());
            }
            let cue_set = Cues::default().compile()?;
            let provider = if llm { Some(OpenAiProvider::from_env()?) } else { None };
            let filters = SearchFilters { book_id: book, subject, grade };
            let outcome = retrieval::search(
                &conn,
                &query,
                &filters,
                &cue_set,
                provider.as_ref().map(|p| p as &dyn Embed),
                limit,
            )
            .await?;
            print_outcome(outcome);
            Ok(())
        }
        Commands::Metrics { book_id, source_id, version } => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            let version = match version {
                Some(v) => v,
                None => match db::load_document_map(&conn, source_id, None)? {
                    Some(map) => map.version,
                    None => {
                        println!("No document map for source {}.", source_id);
                        return Ok(());
                    }
                },
            };
            let metrics = db::compute_metrics(&conn, book_id, source_id, version)?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Books:            {}", s.books);
            println!("Pages:            {}", s.pages);
            println!("Problems:         {}", s.problems);
            println!("Theory sections:  {}", s.theory);
            println!("Answers linked:   {}", s.answers_linked);
            println!("Answers orphaned: {}", s.answers_orphaned);
            println!("Runs done:        {}", s.runs_done);
            println!("Runs failed:      {}", s.runs_failed);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn print_outcome(outcome: SearchOutcome) {
    match outcome {
        SearchOutcome::Confident(r) => {
            println!("Confident match:\n");
            print_result(&r, None);
        }
        SearchOutcome::NeedsChoice(rs) => {
            println!("No single confident match; {} candidates:\n", rs.len());
            for (i, r) in rs.iter().enumerate() {
                print_result(r, Some(i + 1));
                println!();
            }
        }
        SearchOutcome::Empty => println!("No results."),
    }
}

fn print_result(r: &retrieval::SearchResult, rank: Option<usize>) {
    let prefix = rank.map(|i| format!("{:>2}. ", i)).unwrap_or_default();
    println!(
        "{}[{}] #{} {} (score {:.2})",
        prefix,
        r.book_title,
        r.number.as_deref().unwrap_or("-"),
        r.section.as_deref().unwrap_or(""),
        r.score,
    );
    println!("    {}", truncate(&r.problem_text, 160));
    if let Some(answer) = &r.answer_text {
        println!("    Ответ: {}", truncate(answer, 120));
    }
    if let Some(part_answer) = &r.part_answer {
        match &r.requested_part {
            Some(part) => println!("    Часть {}: {}", part, truncate(part_answer, 120)),
            None => println!("    Части: {}", truncate(part_answer, 120)),
        }
    }
    if let Some(solution) = &r.solution_text {
        println!("    Решение: {}", truncate(solution, 120));
    }
}

fn truncate(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        let truncated: String = flat.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

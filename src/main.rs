use std::path::{Path, PathBuf};
use std::sync::Arc;

use naistrip::config::Settings;
use naistrip::download::{ActivityLog, DownloadDispatcher, DownloadPipeline, FileDownloadDispatcher};
use naistrip::metadata::analytics::{summarize, MIN_RECORDS_FOR_ANALYTICS};
use naistrip::metadata::{extract, normalize, HistoryStore};
use naistrip::store::{resolve_store_path, SharedKvStore, SqliteKvStore};
use naistrip::transcode::{ImageFetcher, ImageSource, Transcoder};
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const DEFAULT_OUTPUT_DIR: &str = "downloads";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let Some(command) = cli_args.first().map(String::as_str) else {
        print_usage();
        return Ok(());
    };
    let rest = cli_args.iter().skip(1).cloned().collect::<Vec<_>>();
    match command {
        "inspect" => run_inspect_cli(rest),
        "download" => run_download_cli(rest).await,
        "history" => run_history_cli(rest),
        "history-clear" => {
            HistoryStore::new(open_store_for_cli()?).clear()?;
            println!("history cleared");
            Ok(())
        }
        "analytics" => run_analytics_cli(),
        "logs" => {
            let entries = ActivityLog::new(open_store_for_cli()?).entries()?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        unknown => Err(std::io::Error::other(format!(
            "Unknown command: {unknown}\n\nUse --help for usage."
        ))
        .into()),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

fn open_store_for_cli() -> Result<SharedKvStore, Box<dyn std::error::Error>> {
    let work_root = std::env::current_dir()?;
    let store = SqliteKvStore::new(resolve_store_path(work_root.as_path()));
    store.initialize()?;
    Ok(Arc::new(store))
}

fn run_inspect_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let [path] = args.as_slice() else {
        return Err(std::io::Error::other("Usage: naistrip inspect <file.png>").into());
    };
    let bytes = std::fs::read(path)?;
    let chunks = extract(&bytes);
    let record = normalize(&chunks);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "chunks": chunks, "record": record }))?
    );
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DownloadCliArgs {
    settings_path: Option<PathBuf>,
    output_dir: PathBuf,
    sources: Vec<String>,
}

fn parse_download_cli_args(args: &[String]) -> Result<DownloadCliArgs, Box<dyn std::error::Error>> {
    let mut settings_path = None::<PathBuf>;
    let mut output_dir = PathBuf::from(DEFAULT_OUTPUT_DIR);
    let mut sources = Vec::new();

    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--settings" => {
                settings_path = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--out" => {
                output_dir = PathBuf::from(needs_value(i)?);
                i += 2;
            }
            unknown if unknown.starts_with("--") => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
            source => {
                sources.push(source_reference(source));
                i += 1;
            }
        }
    }

    if sources.is_empty() {
        return Err(std::io::Error::other("At least one image source is required").into());
    }
    Ok(DownloadCliArgs {
        settings_path,
        output_dir,
        sources,
    })
}

/// URLs pass through; anything else is a local path.
fn source_reference(arg: &str) -> String {
    let is_url = ["data:", "http://", "https://", "file:"]
        .iter()
        .any(|prefix| arg.starts_with(prefix));
    if is_url {
        arg.to_string()
    } else {
        ImageSource::File(PathBuf::from(arg)).to_reference()
    }
}

async fn run_download_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = parse_download_cli_args(&args)?;
    let store = open_store_for_cli()?;
    let settings = match parsed.settings_path.as_deref() {
        Some(path) => Settings::load(path)?,
        None => Settings::load_from_store(store.as_ref())?,
    };

    let dispatcher = Arc::new(FileDownloadDispatcher::new(
        parsed.output_dir.as_path(),
        ImageFetcher::new()?,
    ));
    let pipeline = Arc::new(DownloadPipeline::new(
        Transcoder::new()?,
        store,
        Arc::clone(&dispatcher) as Arc<dyn DownloadDispatcher>,
    ));

    let outcomes = match pipeline.download_visible(Some(parsed.sources), &settings).await {
        Some(batch) => batch.wait().await,
        None => Vec::new(),
    };
    let flushed = dispatcher.flush().await;

    let saved = outcomes
        .iter()
        .filter_map(|outcome| outcome.saved())
        .map(|saved| {
            json!({
                "index": saved.index,
                "filename": saved.filename,
                "degradation": saved.degradation.map(|d| d.message()),
                "prompt": saved.record.as_ref().map(|r| r.prompt.as_str()),
            })
        })
        .collect::<Vec<_>>();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "outputDir": display_path(parsed.output_dir.as_path()),
            "written": flushed.written,
            "failed": flushed.failed,
            "images": saved,
        }))?
    );
    Ok(())
}

fn run_history_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let search = match args.as_slice() {
        [] => None,
        [flag, term] if flag == "--search" => Some(term.clone()),
        _ => {
            return Err(std::io::Error::other("Usage: naistrip history [--search <term>]").into());
        }
    };
    let history = HistoryStore::new(open_store_for_cli()?);
    let mut records = match search {
        Some(term) => history.search(term.as_str())?,
        None => history.list()?,
    };
    records.reverse();
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

fn run_analytics_cli() -> Result<(), Box<dyn std::error::Error>> {
    let records = HistoryStore::new(open_store_for_cli()?).list()?;
    match summarize(&records) {
        Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
        None => println!(
            "analytics needs at least {MIN_RECORDS_FOR_ANALYTICS} records ({} saved)",
            records.len()
        ),
    }
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

fn print_usage() {
    eprintln!(
        concat!(
            "Usage:\n",
            "  naistrip inspect <file.png>\n",
            "  naistrip download [--settings <path>] [--out <dir>] <url|data-url|file>...\n",
            "  naistrip history [--search <term>]\n",
            "  naistrip history-clear\n",
            "  naistrip analytics\n",
            "  naistrip logs\n",
            "\n",
            "Environment:\n",
            "  NAISTRIP_DB  store path (default var/naistrip/store.db)\n",
            "  RUST_LOG     log filter (default info)\n"
        )
    );
}

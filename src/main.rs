//! llmhub CLI
//!
//! Browse the catalog and the hub, download GGUF artifacts in the background
//! and chat with them.

use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use llmhub::hub::{catalog, format_size, resolve_artifact, HfClient};
use llmhub::inference::{GenerationParams, StreamEvent};
use llmhub::logging::init_tracing;
use llmhub::storage::{settings, MemoryStore};
use llmhub::types::{DownloadJob, HubConfig, JobStatus, Role};
use llmhub::{ChatService, HubError};

/// Owner id used for records created from the command line
const CLI_OWNER: i64 = 1;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the models directory
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List curated models
    Catalog {
        /// Filter by substring
        query: Option<String>,
    },
    /// Search the hub for models
    Search {
        query: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// List files of a hub repository
    Files {
        repo: String,
        /// Include non-GGUF files
        #[arg(long)]
        all: bool,
    },
    /// Download one artifact
    Download {
        /// Catalog id, owner/repo[/file] or a huggingface.co link
        source: String,
        /// File in the repository, when the source names none
        #[arg(long = "file")]
        filename: Option<String>,
    },
    /// Download (if needed) and answer one prompt
    Chat {
        /// Catalog id, owner/repo[/file] or a huggingface.co link
        source: String,
        prompt: String,
        #[arg(long = "file")]
        filename: Option<String>,
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value = "0.7")]
        temperature: f32,
        #[arg(long, default_value = "512")]
        max_tokens: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), HubError> {
    init_tracing("llmhub=info");
    let cli = Cli::parse();

    let mut config = settings::load_config(cli.config.as_deref());
    if let Some(dir) = cli.models_dir {
        config.models_dir = dir;
    }

    match cli.command {
        Commands::Catalog { query } => {
            for item in catalog::search_catalog(query.as_deref()) {
                println!("{:<20} {}", item.id, item.label);
                println!("{:<20} {} / {}", "", item.repo_id, item.filename);
            }
        }
        Commands::Search { query, limit } => {
            let client = HfClient::new(&config)?;
            for model in client.search_models(&query, limit).await? {
                println!(
                    "{:<60} {:>10} downloads {:>6} likes",
                    model.repo_id,
                    model.downloads.unwrap_or(0),
                    model.likes.unwrap_or(0)
                );
            }
        }
        Commands::Files { repo, all } => {
            let client = HfClient::new(&config)?;
            for file in client.list_repo_files(&repo, !all).await? {
                println!("{}", file);
            }
        }
        Commands::Download { source, filename } => {
            let (repo, filename) = resolve_artifact(&source, filename.as_deref())?;
            let store = MemoryStore::new();
            let service = ChatService::from_config(config, Arc::new(store.clone()))?;
            let job = download(&store, &service, &repo, &filename).await?;
            if job.status != JobStatus::Done {
                return Err(HubError::Fetch(job.error.unwrap_or_else(|| "Download failed".to_string())));
            }
        }
        Commands::Chat {
            source,
            prompt,
            filename,
            system,
            temperature,
            max_tokens,
        } => {
            let (repo, filename) = resolve_artifact(&source, filename.as_deref())?;
            let store = MemoryStore::new();
            let service = ChatService::from_config(config, Arc::new(store.clone()))?;
            let job = download(&store, &service, &repo, &filename).await?;
            if job.status != JobStatus::Done {
                return Err(HubError::Fetch(job.error.unwrap_or_else(|| "Download failed".to_string())));
            }

            let chat_id = 1;
            let question = store.add_message(chat_id, Role::User, &prompt);
            let params = GenerationParams {
                temperature,
                max_tokens,
                system_prompt: system,
                ..GenerationParams::default()
            };
            let mut events = service
                .stream_completion(chat_id, job.model_id, question.id, params)
                .await?;

            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Start => {}
                    StreamEvent::Token(text) => {
                        print!("{}", text);
                        let _ = io::stdout().flush();
                    }
                    StreamEvent::Done(count) => {
                        println!();
                        tracing::info!("{} tokens", count);
                    }
                    StreamEvent::Error(message) => {
                        println!();
                        return Err(HubError::Generation(message));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Register and run a download, printing progress until it ends.
async fn download(
    store: &MemoryStore,
    service: &ChatService,
    repo: &str,
    filename: &str,
) -> Result<DownloadJob, HubError> {
    let (model, job) = store.register_download(CLI_OWNER, repo, filename)?;
    println!("Downloading {} from {}", model.filename, model.repo_id);

    let handle = service.start_download(job.id);
    let poll = poll_interval(service.config());
    loop {
        let current = store
            .job(job.id)
            .ok_or_else(|| HubError::Validation(format!("Job {} disappeared", job.id)))?;
        print!("\r{:<8} {:>12}", current.status.as_str(), format_size(current.progress_bytes));
        let _ = io::stdout().flush();

        if current.status.is_terminal() {
            println!();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            if let Some(error) = &current.error {
                eprintln!("Error: {}", error);
            }
            return Ok(current);
        }
        tokio::time::sleep(poll).await;
    }
}

fn poll_interval(config: &HubConfig) -> Duration {
    config.progress_interval().max(Duration::from_millis(200))
}

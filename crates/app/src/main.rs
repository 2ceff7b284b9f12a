use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use pdf_rag_core::{
    discover_pdf_files, extract_page_texts, AnswerStreamer, AskRequest, BroadcastPublisher,
    CharacterNgramEmbedder, DocumentIntake, DocumentStatusView, DocumentStore, Embedder,
    FanoutPublisher, IngestionOptions, IngestionWorker, JobQueue, LocalRecordStore,
    LopdfExtractor, MemoryJobQueue, OpenAiClient, OpenAiConfig, ProgressPublisher, QdrantStore,
    ReingestPolicy, RetrievalOptions, RetryPolicy, Scope, TracingPublisher, UploadTags,
    UploadedFile, WorkerReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Qdrant base URL
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection
    #[arg(long, env = "QDRANT_COLLECTION", default_value = "pdf_chunks")]
    qdrant_collection: String,

    /// Qdrant API key
    #[arg(long, env = "QDRANT_API_KEY")]
    qdrant_api_key: Option<String>,

    /// Embedding backend.
    #[arg(long, env = "RAG_EMBEDDER", value_enum, default_value_t = EmbedderKind::Openai)]
    embedder: EmbedderKind,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    openai_api_key: String,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Vector size of the embedding model (the n-gram embedder uses this too).
    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value = "1536")]
    embedding_dimensions: usize,

    #[arg(long, env = "CHAT_MODEL", default_value = "gpt-4o-mini")]
    chat_model: String,

    /// JSON file holding document, thread and message records.
    #[arg(long, env = "RAG_RECORDS", default_value = "storage/records.json")]
    records: PathBuf,

    /// Directory uploaded PDFs are copied into.
    #[arg(long, env = "UPLOAD_DIR", default_value = "storage/uploads")]
    upload_dir: PathBuf,

    #[arg(long, env = "MAX_UPLOAD_MB", default_value = "250")]
    max_upload_mb: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbedderKind {
    Openai,
    Ngram,
}

#[derive(Args, Clone)]
struct WorkerArgs {
    /// Chunks per embedding request.
    #[arg(long, default_value = "64")]
    batch_size: usize,

    /// Delete a document's earlier points before re-ingesting it.
    #[arg(long, default_value_t = false)]
    replace: bool,

    /// Jobs processed at the same time by this process.
    #[arg(long, env = "WORKER_CONCURRENCY", default_value = "1")]
    concurrency: usize,

    /// Deliveries per job before it is dead-lettered.
    #[arg(long, env = "MAX_JOB_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    /// Base retry delay in milliseconds, doubled per attempt.
    #[arg(long, default_value = "2000")]
    retry_delay_ms: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Create the Qdrant collection and payload indexes if missing.
    Setup,
    /// Register PDFs and ingest them.
    Ingest {
        /// A single PDF.
        #[arg(long, conflicts_with = "folder", required_unless_present = "folder")]
        file: Option<PathBuf>,
        /// Folder searched recursively for PDFs.
        #[arg(long)]
        folder: Option<PathBuf>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        district: Option<String>,
        #[arg(long, default_value = "admin")]
        owner: String,
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Re-ingest documents left queued or processing by an interrupted run.
    Resume {
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Ask a question and stream the answer as server-sent events.
    Ask {
        #[arg(long)]
        question: String,
        #[arg(long, default_value = "user")]
        owner: String,
        /// Category filter; "all" searches every category.
        #[arg(long, default_value = "all")]
        category: String,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        district: Option<String>,
        /// Continue this thread when it belongs to the owner.
        #[arg(long)]
        thread: Option<String>,
        #[arg(long, default_value = "10")]
        top_k: usize,
    },
    /// Print the status of one document.
    Status { id: String },
    /// List documents, newest first.
    List,
    /// Delete a document and its vectors.
    Delete { id: String },
    /// Print the extracted text of a PDF.
    Pages {
        #[arg(long)]
        file: PathBuf,
        /// Maximum number of pages to print.
        #[arg(long, default_value = "2")]
        max_pages: usize,
    },
}

impl Cli {
    fn embedder(&self) -> anyhow::Result<Arc<dyn Embedder>> {
        let embedder: Arc<dyn Embedder> = match self.embedder {
            EmbedderKind::Openai => Arc::new(OpenAiClient::new(self.openai_config())?),
            EmbedderKind::Ngram => Arc::new(CharacterNgramEmbedder {
                dimensions: self.embedding_dimensions,
            }),
        };
        Ok(embedder)
    }

    fn openai_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.openai_base_url.clone(),
            api_key: self.openai_api_key.clone(),
            embedding_model: self.embedding_model.clone(),
            embedding_dimensions: self.embedding_dimensions,
            chat_model: self.chat_model.clone(),
            ..OpenAiConfig::default()
        }
    }

    fn qdrant(&self, vector_size: usize) -> anyhow::Result<Arc<QdrantStore>> {
        let store = QdrantStore::new(&self.qdrant_url, &self.qdrant_collection, vector_size)?
            .with_api_key(self.qdrant_api_key.clone());
        Ok(Arc::new(store))
    }

    async fn records(&self) -> anyhow::Result<Arc<LocalRecordStore>> {
        let store = LocalRecordStore::open(&self.records)
            .await
            .with_context(|| format!("opening records at {}", self.records.display()))?;
        Ok(Arc::new(store))
    }
}

impl WorkerArgs {
    fn options(&self) -> IngestionOptions {
        IngestionOptions {
            batch_size: self.batch_size,
            reingest: if self.replace {
                ReingestPolicy::Replace
            } else {
                ReingestPolicy::Append
            },
            ..IngestionOptions::default()
        }
    }

    fn queue(&self) -> Arc<MemoryJobQueue> {
        Arc::new(MemoryJobQueue::new(RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_delay_ms),
        }))
    }
}

struct Pipeline {
    intake: DocumentIntake,
    worker: IngestionWorker,
    queue: Arc<MemoryJobQueue>,
}

async fn build_pipeline(cli: &Cli, args: &WorkerArgs) -> anyhow::Result<Pipeline> {
    let records = cli.records().await?;
    let embedder = cli.embedder()?;
    let vectors = cli.qdrant(embedder.dimensions())?;
    vectors.ensure_collection().await?;
    let queue = args.queue();

    let broadcast = BroadcastPublisher::default();
    print_progress(&broadcast);
    let events = FanoutPublisher::new(vec![
        Arc::new(broadcast) as Arc<dyn ProgressPublisher>,
        Arc::new(TracingPublisher),
    ]);

    let worker = IngestionWorker::new(
        records.clone(),
        Arc::new(LopdfExtractor),
        embedder,
        vectors.clone(),
        Arc::new(events),
        args.options(),
    )?;
    let intake = DocumentIntake::new(records, vectors, queue.clone(), &cli.upload_dir)
        .with_max_upload_bytes(cli.max_upload_mb.saturating_mul(1024 * 1024));

    Ok(Pipeline {
        intake,
        worker,
        queue,
    })
}

/// Mirrors the admin documents channel on stdout, one JSON event per line.
fn print_progress(broadcast: &BroadcastPublisher) {
    let mut receiver = broadcast.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(error) => warn!(%error, "unprintable progress event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn drain(pipeline: &Pipeline, concurrency: usize) -> WorkerReport {
    let queue: Arc<dyn JobQueue> = pipeline.queue.clone();
    let report = pipeline.worker.run_until_idle(queue, concurrency).await;
    for dead in pipeline.queue.dead_letters().await {
        warn!(
            document_id = %dead.job.document_id,
            attempts = dead.job.attempt,
            reason = %dead.reason,
            "document not ingested"
        );
    }
    report
}

fn print_report(report: WorkerReport) {
    println!(
        "{} ingested, {} failed at {}",
        report.succeeded,
        report.dead_lettered,
        Utc::now().to_rfc3339()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-rag boot"
    );

    match &cli.command {
        Command::Setup => {
            let embedder = cli.embedder()?;
            let vectors = cli.qdrant(embedder.dimensions())?;
            vectors.ensure_collection().await?;
            println!(
                "collection {} ready ({} dimensions)",
                vectors.collection(),
                embedder.dimensions()
            );
        }
        Command::Ingest {
            file,
            folder,
            category,
            state,
            district,
            owner,
            worker,
        } => {
            let files = match (file, folder) {
                (Some(file), _) => vec![file.clone()],
                (None, Some(folder)) => discover_pdf_files(folder),
                (None, None) => bail!("pass --file or --folder"),
            };
            if files.is_empty() {
                bail!("no pdf files found");
            }

            let pipeline = build_pipeline(&cli, worker).await?;
            let tags = UploadTags {
                owner_id: owner.clone(),
                category: category.clone(),
                state: state.clone(),
                district: district.clone(),
            };

            let mut registered = 0usize;
            for path in files {
                let upload = match UploadedFile::from_path(&path).await {
                    Ok(upload) => upload,
                    Err(error) => {
                        warn!(path = %path.display(), %error, "skipped pdf");
                        continue;
                    }
                };
                match pipeline.intake.register_upload(upload, tags.clone()).await {
                    Ok(document) => {
                        registered += 1;
                        println!("queued {} {}", document.id, path.display());
                    }
                    Err(error) => warn!(path = %path.display(), %error, "skipped pdf"),
                }
            }
            if registered == 0 {
                bail!("no files could be registered");
            }

            print_report(drain(&pipeline, worker.concurrency).await);
        }
        Command::Resume { worker } => {
            let pipeline = build_pipeline(&cli, worker).await?;
            let requeued = pipeline.intake.requeue_stale().await?;
            info!(count = requeued.len(), "requeued unsettled documents");
            print_report(drain(&pipeline, worker.concurrency).await);
        }
        Command::Ask {
            question,
            owner,
            category,
            state,
            district,
            thread,
            top_k,
        } => {
            let records = cli.records().await?;
            let embedder = cli.embedder()?;
            let vectors = cli.qdrant(embedder.dimensions())?;
            let generator = Arc::new(OpenAiClient::new(cli.openai_config())?);
            let streamer = AnswerStreamer::new(
                records.clone(),
                records,
                embedder,
                vectors,
                generator,
                RetrievalOptions {
                    top_k: *top_k,
                    ..RetrievalOptions::default()
                },
            );

            let mut events = streamer.ask(AskRequest {
                owner_id: owner.clone(),
                question: question.clone(),
                scope: Scope::new(Some(category.as_str()), state.as_deref(), district.as_deref()),
                thread_id: thread.clone(),
            })?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        warn!("answer cancelled");
                        break;
                    }
                    next = events.next() => match next {
                        Some(event) => {
                            print!("{}", event.to_sse());
                            if event.is_terminal() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        }
        Command::Status { id } => {
            let records = cli.records().await?;
            let status = records
                .get_document(id)
                .await?
                .map(|document| DocumentStatusView::from(&document))
                .with_context(|| format!("document {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::List => {
            let records = cli.records().await?;
            for document in records.list_documents().await? {
                println!(
                    "{} status={} category={} pages={} chunks={} file={}",
                    document.id,
                    document.status.as_str(),
                    document.category,
                    document.progress.pages_done,
                    document.progress.chunks_done,
                    document.filename
                );
                if !document.error_message.is_empty() {
                    println!("  error: {}", document.error_message);
                }
            }
        }
        Command::Delete { id } => {
            let records = cli.records().await?;
            let embedder = cli.embedder()?;
            let vectors = cli.qdrant(embedder.dimensions())?;
            let intake = DocumentIntake::new(
                records,
                vectors,
                Arc::new(MemoryJobQueue::default()),
                &cli.upload_dir,
            );
            intake.delete_document(id).await?;
            println!("deleted {id}");
        }
        Command::Pages { file, max_pages } => {
            let pages = extract_page_texts(&LopdfExtractor, file)?;
            for page in pages.iter().take(*max_pages) {
                if !page.text.trim().is_empty() {
                    println!("[page {}]\n{}", page.number, page.text);
                }
            }
            if pages.len() > *max_pages {
                println!("... output truncated to first {max_pages} page(s)");
            }
        }
    }

    Ok(())
}

use crate::chunking::{chunk_text, ChunkingConfig};
use crate::embeddings::check_batch;
use crate::error::IngestError;
use crate::events::ProgressEvent;
use crate::extractor::{PageStream, PageText, PdfExtractor};
use crate::filter::VectorFilter;
use crate::models::{
    ChunkPayload, Document, DocumentUpdate, IngestJob, IngestStage, IngestionOptions, Progress,
    ReingestPolicy, VectorPoint,
};
use crate::traits::{DocumentStore, Embedder, JobDisposition, JobQueue, ProgressPublisher, VectorIndex};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long an idle lane waits on the queue before checking again.
const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub document_id: String,
    pub pages: u32,
    pub chunks: u64,
    pub batches: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl WorkerReport {
    fn merge(&mut self, other: WorkerReport) {
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

#[derive(Debug, Default)]
struct Tally {
    pages_seen: u32,
    chunks_done: u64,
    batches: usize,
}

/// Chunks waiting for the next embedding call. Owned by one pipeline run.
#[derive(Debug, Default)]
struct PendingBatch {
    texts: Vec<String>,
    payloads: Vec<ChunkPayload>,
}

impl PendingBatch {
    fn push(&mut self, text: String, payload: ChunkPayload) {
        self.texts.push(text);
        self.payloads.push(payload);
    }

    fn len(&self) -> usize {
        self.texts.len()
    }

    fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    fn take(&mut self) -> (Vec<String>, Vec<ChunkPayload>) {
        (
            std::mem::take(&mut self.texts),
            std::mem::take(&mut self.payloads),
        )
    }
}

/// Drives one document through extract, chunk, embed and upsert, keeping
/// the record and the progress channel up to date.
#[derive(Clone)]
pub struct IngestionWorker {
    records: Arc<dyn DocumentStore>,
    extractor: Arc<dyn PdfExtractor>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorIndex>,
    events: Arc<dyn ProgressPublisher>,
    options: IngestionOptions,
    chunking: ChunkingConfig,
}

impl IngestionWorker {
    pub fn new(
        records: Arc<dyn DocumentStore>,
        extractor: Arc<dyn PdfExtractor>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorIndex>,
        events: Arc<dyn ProgressPublisher>,
        options: IngestionOptions,
    ) -> Result<Self, IngestError> {
        let chunking = ChunkingConfig::try_from(&options)?;
        if options.batch_size == 0 {
            return Err(IngestError::InvalidArgument(
                "batch size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            records,
            extractor,
            embedder,
            vectors,
            events,
            options,
            chunking,
        })
    }

    pub fn options(&self) -> &IngestionOptions {
        &self.options
    }

    /// Ingests one document. A missing record is reported without touching
    /// any store; every other failure leaves the document `failed`.
    pub async fn process(&self, document_id: &str) -> Result<IngestSummary, IngestError> {
        let document = self
            .records
            .get_document(document_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(document_id.to_string()))?;

        let mut tally = Tally::default();
        match self.run_pipeline(&document, &mut tally).await {
            Ok(summary) => Ok(summary),
            Err(error) => {
                self.mark_failed(&document.id, &tally, &error).await;
                Err(error)
            }
        }
    }

    async fn run_pipeline(
        &self,
        document: &Document,
        tally: &mut Tally,
    ) -> Result<IngestSummary, IngestError> {
        let started = self
            .records
            .update_document(&document.id, DocumentUpdate::started())
            .await?;
        self.announce(&started).await;
        info!(document_id = %document.id, filename = %document.filename, "ingestion started");

        if self.options.reingest == ReingestPolicy::Replace {
            self.vectors
                .delete_points(&VectorFilter::document(&document.id))
                .await
                .map_err(IngestError::VectorStore)?;
            debug!(document_id = %document.id, "removed points from earlier runs");
        }

        let mut pages = self.open_pages(document.storage_path.clone()).await?;
        let mut batch = PendingBatch::default();

        loop {
            let (next, returned) = next_page(pages).await?;
            pages = returned;
            let Some(page) = next else {
                break;
            };
            let page = page?;
            tally.pages_seen += 1;

            for (chunk_index, text) in chunk_text(&page.text, self.chunking).into_iter().enumerate() {
                batch.push(text.clone(), payload_for(document, &page, chunk_index, text));

                if batch.len() >= self.options.batch_size {
                    self.flush(document, &mut batch, tally).await?;
                }
            }
        }

        if !batch.is_empty() {
            self.flush(document, &mut batch, tally).await?;
        }

        let ready = self
            .records
            .update_document(
                &document.id,
                DocumentUpdate::ready(tally.pages_seen, tally.chunks_done),
            )
            .await?;
        self.announce(&ready).await;
        info!(
            document_id = %document.id,
            pages_done = tally.pages_seen,
            chunks_done = tally.chunks_done,
            "ingestion finished"
        );

        Ok(IngestSummary {
            document_id: document.id.clone(),
            pages: tally.pages_seen,
            chunks: tally.chunks_done,
            batches: tally.batches,
        })
    }

    async fn open_pages(&self, path: PathBuf) -> Result<PageStream, IngestError> {
        let extractor = self.extractor.clone();
        tokio::task::spawn_blocking(move || extractor.open(&path))
            .await
            .map_err(|error| IngestError::Extraction(format!("extraction task failed: {error}")))?
    }

    async fn flush(
        &self,
        document: &Document,
        batch: &mut PendingBatch,
        tally: &mut Tally,
    ) -> Result<(), IngestError> {
        let (texts, payloads) = batch.take();

        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(IngestError::Embedding)?;
        check_batch(texts.len(), &vectors, self.embedder.dimensions())
            .map_err(IngestError::Embedding)?;

        let points = vectors
            .into_iter()
            .zip(payloads)
            .map(|(vector, payload)| VectorPoint {
                id: Uuid::new_v4(),
                vector,
                payload,
            })
            .collect::<Vec<_>>();

        self.vectors
            .upsert_points(&points)
            .await
            .map_err(IngestError::VectorStore)?;

        tally.chunks_done += points.len() as u64;
        tally.batches += 1;
        debug!(
            document_id = %document.id,
            batch = points.len(),
            pages_done = tally.pages_seen,
            chunks_done = tally.chunks_done,
            "flushed batch"
        );

        let progress = Progress::at(IngestStage::EmbedUpsert, tally.pages_seen, tally.chunks_done);
        match self
            .records
            .update_document(&document.id, DocumentUpdate::progress(progress))
            .await
        {
            Ok(updated) => self.announce(&updated).await,
            Err(error) => {
                warn!(document_id = %document.id, %error, "could not record batch progress")
            }
        }

        Ok(())
    }

    async fn mark_failed(&self, document_id: &str, tally: &Tally, cause: &IngestError) {
        error!(
            document_id,
            pages_done = tally.pages_seen,
            chunks_done = tally.chunks_done,
            error = %cause,
            "ingestion failed"
        );

        let update = DocumentUpdate::failed(tally.pages_seen, tally.chunks_done, cause.to_string());
        match self.records.update_document(document_id, update).await {
            Ok(failed) => self.announce(&failed).await,
            Err(error) => error!(document_id, %error, "could not record ingestion failure"),
        }
    }

    async fn announce(&self, document: &Document) {
        let event = ProgressEvent::from_document(document);
        if let Err(error) = self.events.publish(&event).await {
            warn!(document_id = %document.id, %error, "progress event dropped");
        }
    }

    /// Processes one claimed job and acknowledges it on the queue.
    pub async fn handle_job(&self, queue: &dyn JobQueue, job: IngestJob) -> WorkerReport {
        let mut report = WorkerReport::default();
        info!(
            job_id = %job.id,
            document_id = %job.document_id,
            attempt = job.attempt,
            "claimed ingestion job"
        );

        match self.process(&job.document_id).await {
            Ok(_) => {
                if let Err(error) = queue.complete(&job).await {
                    error!(job_id = %job.id, %error, "could not acknowledge job");
                }
                report.succeeded += 1;
            }
            Err(cause) => match queue.fail(&job, &cause).await {
                Ok(JobDisposition::Retrying { attempt, delay }) => {
                    warn!(
                        job_id = %job.id,
                        document_id = %job.document_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "ingestion job will be retried"
                    );
                    report.retried += 1;
                }
                Ok(JobDisposition::DeadLettered) => report.dead_lettered += 1,
                Err(error) => error!(job_id = %job.id, %error, "could not record job failure"),
            },
        }

        report
    }

    /// Works the queue until nothing is pending or in flight.
    pub async fn run_until_idle(&self, queue: Arc<dyn JobQueue>, concurrency: usize) -> WorkerReport {
        self.run_lanes(queue, concurrency, None).await
    }

    /// Works the queue until `shutdown` flips to true. A job in progress is
    /// finished before its lane stops.
    pub async fn run(
        &self,
        queue: Arc<dyn JobQueue>,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> WorkerReport {
        self.run_lanes(queue, concurrency, Some(shutdown)).await
    }

    async fn run_lanes(
        &self,
        queue: Arc<dyn JobQueue>,
        concurrency: usize,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> WorkerReport {
        let mut lanes = JoinSet::new();
        for _ in 0..concurrency.max(1) {
            let worker = self.clone();
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            lanes.spawn(async move { worker.lane(queue, shutdown).await });
        }

        let mut report = WorkerReport::default();
        while let Some(joined) = lanes.join_next().await {
            match joined {
                Ok(lane) => report.merge(lane),
                Err(error) => error!(%error, "worker lane panicked"),
            }
        }
        report
    }

    async fn lane(
        &self,
        queue: Arc<dyn JobQueue>,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) -> WorkerReport {
        let mut report = WorkerReport::default();

        loop {
            let claimed = match shutdown.as_mut() {
                Some(signal) => {
                    if *signal.borrow() {
                        break;
                    }
                    tokio::select! {
                        changed = signal.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                        claimed = queue.claim(IDLE_POLL) => claimed,
                    }
                }
                None => queue.claim(IDLE_POLL).await,
            };

            match claimed {
                Ok(Some(job)) => report.merge(self.handle_job(queue.as_ref(), job).await),
                Ok(None) if shutdown.is_none() && queue.outstanding().await == 0 => break,
                Ok(None) => {}
                Err(error) => {
                    error!(%error, "could not claim ingestion job");
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }

        report
    }
}

fn payload_for(document: &Document, page: &PageText, chunk_index: usize, text: String) -> ChunkPayload {
    ChunkPayload {
        document_id: document.id.clone(),
        category: document.category.clone(),
        state: document.state.clone(),
        district: document.district.clone(),
        page_number: page.number,
        chunk_index,
        text,
    }
}

/// Pulls the next page on the blocking pool and hands the stream back.
async fn next_page(
    mut pages: PageStream,
) -> Result<(Option<Result<PageText, IngestError>>, PageStream), IngestError> {
    tokio::task::spawn_blocking(move || {
        let next = pages.next();
        (next, pages)
    })
    .await
    .map_err(|error| IngestError::Extraction(format!("extraction task failed: {error}")))
}

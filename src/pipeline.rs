/// Batch orchestrator.
///
/// A blocking reader task streams fixed-size chunks over a bounded channel;
/// up to `chunk_workers` chunks are refined, enriched and scored at once and
/// written back in input order. Top tiers then go through the deep
/// (narrative) path in small batches with a pause between batches.
use crate::cache_store::{CacheStore, CacheTtls};
use crate::config::Config;
use crate::enrichment::{EnrichmentEngine, Gateways};
use crate::errors::{PipelineError, ResultExt};
use crate::gateway_client::{GatewaySettings, HttpGateway};
use crate::market_data::MarketData;
use crate::models::{LeadRecord, NarrativeSource, OutputRow, RawRecord, RejectionReason};
use crate::refinery::{ColumnMapping, ColumnSynonyms, Refinery, RefineryPolicy};
use crate::scoring::ScoringMatrix;
use crate::synthesis::{HttpNarrativeClient, MessageSynthesizer, NarrativeGenerator};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Chunks buffered between the reader and the workers.
const READ_AHEAD_CHUNKS: usize = 2;

// ============ Run statistics ============

/// Per-run aggregate audit of data quality.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub run_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub rows_in: usize,
    pub rows_rejected: usize,
    /// Keyed by rejection label, e.g. `"missing phone"`.
    pub rejected_by_reason: BTreeMap<String, usize>,
    pub tax_ids_flagged: usize,
    pub rows_by_tier: BTreeMap<String, usize>,
    pub rows_exported: usize,
    pub degraded_records: usize,
    /// layer → confidence → count.
    pub confidence_counts: BTreeMap<String, BTreeMap<String, usize>>,
    pub narratives_generated: usize,
    pub narratives_fallback: usize,
    pub chunks_processed: usize,
    pub cancelled: bool,
}

impl RunStats {
    fn merge(&mut self, chunk: ChunkStats) {
        self.rows_in += chunk.rows_in;
        for (reason, count) in chunk.rejected {
            self.rows_rejected += count;
            *self
                .rejected_by_reason
                .entry(reason.label().to_string())
                .or_default() += count;
        }
        self.tax_ids_flagged += chunk.tax_ids_flagged;
        for (tier, count) in chunk.by_tier {
            *self.rows_by_tier.entry(tier).or_default() += count;
        }
        self.rows_exported += chunk.exported;
        self.degraded_records += chunk.degraded;
        for (layer, per_confidence) in chunk.confidence {
            let entry = self.confidence_counts.entry(layer).or_default();
            for (confidence, count) in per_confidence {
                *entry.entry(confidence).or_default() += count;
            }
        }
        self.narratives_generated += chunk.narratives_generated;
        self.narratives_fallback += chunk.narratives_fallback;
        self.chunks_processed += 1;
    }

    /// Rows whose tier landed in `tier`, 0 when none did.
    pub fn tier_count(&self, tier: &str) -> usize {
        self.rows_by_tier.get(tier).copied().unwrap_or(0)
    }

    pub fn rejected(&self, reason: RejectionReason) -> usize {
        self.rejected_by_reason
            .get(reason.label())
            .copied()
            .unwrap_or(0)
    }

    pub fn log_summary(&self) {
        tracing::info!(
            "✓ Run {} finished in {}ms: {} rows in, {} rejected, {} exported, {} degraded, {} chunks",
            self.run_id,
            self.elapsed_ms,
            self.rows_in,
            self.rows_rejected,
            self.rows_exported,
            self.degraded_records,
            self.chunks_processed
        );
        for (reason, count) in &self.rejected_by_reason {
            tracing::info!("  rejected ({}): {}", reason, count);
        }
        for (tier, count) in &self.rows_by_tier {
            tracing::info!("  tier {}: {}", tier, count);
        }
        if self.tax_ids_flagged > 0 {
            tracing::warn!("⚠️ {} rows kept with a flagged tax identifier", self.tax_ids_flagged);
        }
        if self.cancelled {
            tracing::warn!("⚠️ Run was cancelled, remaining input was discarded");
        }
    }

    pub fn write_sidecar(&self, path: &Path) -> Result<(), PipelineError> {
        let raw = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("writing run stats {}", path.display()))?;
        tracing::info!("✓ Run stats written to {}", path.display());
        Ok(())
    }
}

/// `<output>.stats.json`.
pub fn default_stats_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".stats.json");
    PathBuf::from(name)
}

#[derive(Debug, Default)]
struct ChunkStats {
    rows_in: usize,
    rejected: BTreeMap<RejectionReason, usize>,
    tax_ids_flagged: usize,
    by_tier: BTreeMap<String, usize>,
    exported: usize,
    degraded: usize,
    confidence: BTreeMap<String, BTreeMap<String, usize>>,
    narratives_generated: usize,
    narratives_fallback: usize,
}

struct ChunkOutcome {
    index: usize,
    rows: Vec<OutputRow>,
    stats: ChunkStats,
}

enum ReaderMessage {
    Headers(Vec<String>),
    Chunk(Vec<RawRecord>),
}

// ============ Chunk processing ============

/// Everything a chunk worker needs. Cheap to clone into a task.
#[derive(Clone)]
struct ChunkProcessor {
    config: Arc<Config>,
    refinery: Arc<Refinery>,
    engine: Arc<EnrichmentEngine>,
    scoring: ScoringMatrix,
    synthesizer: Arc<MessageSynthesizer>,
}

impl ChunkProcessor {
    async fn process(self, index: usize, rows: Vec<RawRecord>) -> ChunkOutcome {
        let mut stats = ChunkStats {
            rows_in: rows.len(),
            ..Default::default()
        };

        let mut leads = Vec::with_capacity(rows.len());
        for raw in &rows {
            let record = match self.refinery.clean(raw) {
                Ok(record) => record,
                Err(reason) => {
                    tracing::debug!("Row {} rejected: {}", raw.row, reason);
                    *stats.rejected.entry(reason).or_default() += 1;
                    continue;
                }
            };
            if record.tax_id_flagged {
                stats.tax_ids_flagged += 1;
            }

            let context = self.engine.enrich(&record).await;
            let score = self.scoring.score(&context, &record);
            let messages = self
                .config
                .is_message_tier(score.tier)
                .then(|| self.synthesizer.fast_path(&record, &context));

            *stats.by_tier.entry(score.tier.to_string()).or_default() += 1;
            if context.is_degraded() {
                stats.degraded += 1;
            }
            for (layer, confidence) in context.confidences() {
                *stats
                    .confidence
                    .entry(layer.to_string())
                    .or_default()
                    .entry(confidence.to_string())
                    .or_default() += 1;
            }

            leads.push(LeadRecord {
                record,
                context,
                score,
                messages,
            });
        }

        let leads = self.deep_path(leads, &mut stats).await;

        let rows: Vec<OutputRow> = leads
            .iter()
            .filter(|lead| self.config.is_exported(lead.score.tier))
            .map(|lead| OutputRow::from_lead(lead, self.config.is_message_tier(lead.score.tier)))
            .collect();
        stats.exported = rows.len();

        tracing::info!(
            "✓ Chunk {} processed: {} rows in, {} scored, {} exported",
            index,
            stats.rows_in,
            leads.len(),
            stats.exported
        );
        ChunkOutcome { index, rows, stats }
    }

    /// Narrative for deep tiers, `deep_batch_size` leads at a time with a
    /// pause between batches. Order of `leads` is preserved.
    async fn deep_path(&self, leads: Vec<LeadRecord>, stats: &mut ChunkStats) -> Vec<LeadRecord> {
        let (deep, mut rest): (Vec<_>, Vec<_>) = leads
            .into_iter()
            .enumerate()
            .partition(|(_, lead)| self.config.is_deep_tier(lead.score.tier));
        if deep.is_empty() {
            return rest.into_iter().map(|(_, lead)| lead).collect();
        }

        let batch_size = self.config.deep_batch_size.max(1);
        let pause = Duration::from_millis(self.config.deep_batch_pause_ms);
        let mut pending = deep.into_iter().peekable();
        let mut done = Vec::new();

        while pending.peek().is_some() {
            let mut batch = JoinSet::new();
            // A failed task still owes its lead a template narrative.
            let mut unfinished: HashMap<task::Id, (usize, LeadRecord)> = HashMap::new();
            for (position, lead) in pending.by_ref().take(batch_size) {
                let synthesizer = self.synthesizer.clone();
                let mut owned = lead.clone();
                let handle = batch.spawn(async move {
                    let source = synthesizer.deep_path(&mut owned).await;
                    (position, owned, source)
                });
                unfinished.insert(handle.id(), (position, lead));
            }

            while let Some(joined) = batch.join_next_with_id().await {
                let (position, lead, source) = match joined {
                    Ok((id, finished)) => {
                        unfinished.remove(&id);
                        finished
                    }
                    Err(e) => {
                        let Some((position, mut lead)) = unfinished.remove(&e.id()) else {
                            tracing::error!("❌ Narrative task failed: {}", e);
                            continue;
                        };
                        tracing::error!(
                            "❌ Narrative task for row {} failed, using template: {}",
                            lead.record.row,
                            e
                        );
                        let source = self.synthesizer.template_path(&mut lead);
                        (position, lead, source)
                    }
                };
                match source {
                    NarrativeSource::Generated => stats.narratives_generated += 1,
                    NarrativeSource::Template => stats.narratives_fallback += 1,
                }
                done.push((position, lead));
            }

            if pending.peek().is_some() && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        rest.extend(done);
        rest.sort_by_key(|(position, _)| *position);
        rest.into_iter().map(|(_, lead)| lead).collect()
    }
}

// ============ Pipeline ============

pub struct Pipeline {
    config: Arc<Config>,
    synonyms: ColumnSynonyms,
    cache: CacheStore,
    engine: Arc<EnrichmentEngine>,
    scoring: ScoringMatrix,
    synthesizer: Arc<MessageSynthesizer>,
}

impl Pipeline {
    /// Builds every component from configuration. Invalid settings are
    /// fatal here, before any row is read.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;

        let market = MarketData::load(config.market_data_path.as_deref())?;
        let synonyms = ColumnSynonyms::load(config.column_synonyms_path.as_deref())?;
        let cache = CacheStore::in_memory(config.cache_capacity, CacheTtls::from(&config));
        let gateways = Gateways::from_config(&config)?;

        let narrative: Option<Arc<dyn NarrativeGenerator>> = match &config.narrative_url {
            Some(url) => {
                let settings = GatewaySettings {
                    timeout: Duration::from_secs(config.narrative_timeout_secs),
                    max_retries: 0,
                    ..GatewaySettings::from(&config)
                };
                tracing::info!("✓ Narrative generator configured");
                Some(Arc::new(HttpNarrativeClient::new(HttpGateway::new(
                    "narrative",
                    url,
                    settings,
                )?)))
            }
            None => None,
        };

        Self::with_components(config, market, synonyms, cache, gateways, narrative)
    }

    /// Assembles a pipeline from prebuilt parts.
    pub fn with_components(
        config: Config,
        market: Arc<MarketData>,
        synonyms: ColumnSynonyms,
        cache: CacheStore,
        gateways: Gateways,
        narrative: Option<Arc<dyn NarrativeGenerator>>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let engine = EnrichmentEngine::new(
            market.clone(),
            cache.clone(),
            gateways,
            config.force_refresh,
            config.as_of(),
        );
        let synthesizer = MessageSynthesizer::new(
            market.clone(),
            narrative,
            Duration::from_secs(config.narrative_timeout_secs),
        );

        Ok(Self {
            config: Arc::new(config),
            synonyms,
            cache,
            engine: Arc::new(engine),
            scoring: ScoringMatrix::new(market),
            synthesizer: Arc::new(synthesizer),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Streams `input` to `output`. Cancellation is honoured at chunk
    /// boundaries: chunks in flight finish, the rest of the input is dropped.
    pub async fn run<R, W>(
        &self,
        input: R,
        output: W,
        cancel: CancellationToken,
    ) -> Result<RunStats, PipelineError>
    where
        R: Read + Send + 'static,
        W: Write,
    {
        let started = Instant::now();
        let mut stats = RunStats {
            run_id: Uuid::new_v4(),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        tracing::info!(
            "Run {} started (chunk size {}, {} workers)",
            stats.run_id,
            self.config.chunk_size,
            self.config.chunk_workers
        );

        let (tx, mut rx) = mpsc::channel(READ_AHEAD_CHUNKS);
        let reader = tokio::task::spawn_blocking({
            let chunk_size = self.config.chunk_size;
            let cancel = cancel.clone();
            move || read_chunks(input, chunk_size, tx, cancel)
        });

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(output);
        writer.write_record(OutputRow::COLUMNS)?;

        let processor = match rx.recv().await {
            Some(Ok(ReaderMessage::Headers(headers))) => {
                let mapping = ColumnMapping::resolve(&headers, &self.synonyms);
                ChunkProcessor {
                    config: self.config.clone(),
                    refinery: Arc::new(Refinery::new(
                        mapping,
                        RefineryPolicy::from(self.config.as_ref()),
                    )),
                    engine: self.engine.clone(),
                    scoring: self.scoring.clone(),
                    synthesizer: self.synthesizer.clone(),
                }
            }
            Some(Ok(ReaderMessage::Chunk(_))) => {
                return Err(PipelineError::Csv("input chunk arrived before headers".to_string()))
            }
            Some(Err(e)) => return Err(e),
            None => {
                join_reader(reader).await?;
                writer.flush()?;
                tracing::warn!("⚠️ Input is empty");
                stats.elapsed_ms = started.elapsed().as_millis() as u64;
                return Ok(stats);
            }
        };

        let workers = self.config.chunk_workers.max(1);
        let mut in_flight = JoinSet::new();
        // Completed chunks waiting on an earlier one. Counted against the
        // worker window so a stalled chunk stops the reader instead of
        // letting the rest of the input pile up here.
        let mut finished: BTreeMap<usize, ChunkOutcome> = BTreeMap::new();
        let mut next_index = 0usize;
        let mut next_to_write = 0usize;
        let mut input_done = false;

        loop {
            while !input_done && in_flight.len() + finished.len() < workers {
                if cancel.is_cancelled() {
                    stats.cancelled = true;
                    input_done = true;
                    break;
                }
                match rx.recv().await {
                    Some(Ok(ReaderMessage::Chunk(rows))) => {
                        in_flight.spawn(processor.clone().process(next_index, rows));
                        next_index += 1;
                    }
                    Some(Ok(ReaderMessage::Headers(_))) => {}
                    Some(Err(e)) => return Err(e),
                    None => input_done = true,
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let outcome =
                joined.map_err(|e| PipelineError::Io(format!("chunk worker failed: {}", e)))?;
            finished.insert(outcome.index, outcome);

            while let Some(outcome) = finished.remove(&next_to_write) {
                for row in &outcome.rows {
                    writer.serialize(row)?;
                }
                writer.flush()?;
                stats.merge(outcome.stats);
                next_to_write += 1;
            }
        }

        drop(rx);
        if !stats.cancelled {
            join_reader(reader).await?;
        }

        writer.flush()?;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        stats.log_summary();
        Ok(stats)
    }

    /// File-to-file run: restores and saves the cache snapshot when
    /// configured and writes the stats sidecar.
    pub async fn run_files(
        &self,
        input: &Path,
        output: &Path,
        stats_path: Option<&Path>,
        cancel: CancellationToken,
    ) -> Result<RunStats, PipelineError> {
        if let Some(snapshot) = &self.config.cache_snapshot_path {
            if let Err(e) = self.cache.load_snapshot(snapshot).await {
                tracing::warn!("⚠️ Cache snapshot not loaded: {}", e);
            }
        }

        let reader = std::fs::File::open(input)
            .with_context(|| format!("opening input {}", input.display()))?;
        let writer = std::fs::File::create(output)
            .with_context(|| format!("creating output {}", output.display()))?;

        let stats = self
            .run(
                std::io::BufReader::new(reader),
                std::io::BufWriter::new(writer),
                cancel,
            )
            .await?;

        if let Some(snapshot) = &self.config.cache_snapshot_path {
            if let Err(e) = self.cache.save_snapshot(snapshot).await {
                tracing::warn!("⚠️ Cache snapshot not saved: {}", e);
            }
        }

        let sidecar = stats_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_stats_path(output));
        stats.write_sidecar(&sidecar)?;
        Ok(stats)
    }
}

async fn join_reader(
    reader: tokio::task::JoinHandle<Result<(), PipelineError>>,
) -> Result<(), PipelineError> {
    reader
        .await
        .map_err(|e| PipelineError::Io(format!("reader task failed: {}", e)))?
}

/// Blocking CSV reader. Invalid UTF-8 is replaced, short rows are padded by
/// the mapping lookup, and a closed channel stops reading.
fn read_chunks<R: Read>(
    input: R,
    chunk_size: usize,
    tx: mpsc::Sender<Result<ReaderMessage, PipelineError>>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = match reader.byte_headers() {
        Ok(headers) => headers
            .iter()
            .map(|h| String::from_utf8_lossy(h).into_owned())
            .collect(),
        Err(e) => {
            let _ = tx.blocking_send(Err(e.into()));
            return Ok(());
        }
    };
    if tx.blocking_send(Ok(ReaderMessage::Headers(headers))).is_err() {
        return Ok(());
    }

    let mut chunk = Vec::with_capacity(chunk_size);
    for (i, record) in reader.byte_records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                let failed = Err(e).context(format!("reading row {}", i + 1));
                let _ = tx.blocking_send(failed);
                return Ok(());
            }
        };
        chunk.push(RawRecord {
            row: i + 1,
            cells: record
                .iter()
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect(),
        });

        if chunk.len() == chunk_size {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
            if tx.blocking_send(Ok(ReaderMessage::Chunk(full))).is_err() {
                return Ok(());
            }
        }
    }

    if !chunk.is_empty() && !cancel.is_cancelled() {
        let _ = tx.blocking_send(Ok(ReaderMessage::Chunk(chunk)));
    }
    Ok(())
}

//! The learning-moment pipeline: one run per (user, query).
//!
//! A run moves through `initial → line_assigned → knowledge_updated →
//! moment_classified`, then through up to `max_attempts` rounds of
//! `strategizing → discovering → filtering`, and ends in
//! `recommendations_ready` or `exhausted`. Lines, knowledge and the run
//! record are written only once a terminal state is reached.
//!
//! Runs for the same user are serialized. Runs for different users share
//! nothing but the storage handle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{OwnedMutexGuard, Semaphore, mpsc};
use tracing::{debug, info, instrument, warn};

use learnline_discovery::{AnsweringService, RawPage, SearchService};
use learnline_extract::ContentExtractor;
use learnline_shared::{
    AppConfig, AttemptFailure, ExhaustedReport, ExtractedDocument, Interaction, InteractionKind,
    KnowledgeDelta, KnowledgeState, LearnlineError, LineId, PipelineState, ProgressEvent, Query,
    QueryLine, RecommendationResult, Result, RunOutcome, SearchStrategy, content_id,
};
use learnline_storage::Storage;

use crate::filter::{Candidate, RelevanceFilter};
use crate::interactions::follow_up_queries;
use crate::knowledge::KnowledgeStateTracker;
use crate::lines::{LineChoice, QueryLineManager};
use crate::moments::MomentClassifier;
use crate::strategy::{FailureFeedback, StrategyGenerator};
use crate::suggestions::SuggestionBuilder;
use crate::text::Lexicon;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Receives pipeline progress events. Must never block.
pub trait ProgressReporter: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded channel.
///
/// A dropped receiver only loses events; the run is unaffected.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelProgress {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

fn step(progress: &dyn ProgressReporter, step: PipelineState, detail: impl Into<String>) {
    progress.emit(ProgressEvent::Step {
        step,
        detail: Some(detail.into()),
    });
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The external services a run calls out to.
#[derive(Clone)]
pub struct Services {
    pub answering: Arc<dyn AnsweringService>,
    pub search: Arc<dyn SearchService>,
    pub extractor: Arc<dyn ContentExtractor>,
}

/// Candidates surviving one discovery round, in query rank then discovery rank order.
struct Discovery {
    candidates: Vec<Candidate>,
    dropped_calls: usize,
}

/// A search result waiting for its extracted document.
struct Slot {
    content_id: String,
    page: RawPage,
    query_rank: usize,
    discovery_rank: usize,
    document: Option<ExtractedDocument>,
}

/// One run lock per user with a run in flight or waiting.
type UserLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Holds a user's lock. Dropping it removes the user's entry once nobody else
/// holds or waits on it.
struct UserGuard<'a> {
    locks: &'a UserLocks,
    user_id: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.user_id);
        }
    }
}

pub struct Pipeline {
    config: AppConfig,
    storage: Storage,
    services: Services,
    lines: QueryLineManager,
    tracker: KnowledgeStateTracker,
    classifier: MomentClassifier,
    strategist: StrategyGenerator,
    filter: RelevanceFilter,
    suggestions: SuggestionBuilder,
    user_locks: UserLocks,
}

impl Pipeline {
    /// Build a pipeline over `storage`. Fails if `config` does not validate.
    pub fn new(config: AppConfig, storage: Storage, services: Services) -> Result<Self> {
        config.validate()?;
        let lexicon = Arc::new(Lexicon::with_entries(&config.entities));
        Ok(Self {
            lines: QueryLineManager::new(config.lines.clone(), Arc::clone(&lexicon)),
            tracker: KnowledgeStateTracker::new(Arc::clone(&lexicon)),
            classifier: MomentClassifier::new(config.moments.clone(), Arc::clone(&lexicon)),
            strategist: StrategyGenerator::new(
                config.pipeline.max_queries_per_strategy,
                Arc::clone(&lexicon),
            ),
            filter: RelevanceFilter::new(config.filter.clone(), Arc::clone(&lexicon)),
            suggestions: SuggestionBuilder::new(lexicon),
            config,
            storage,
            services,
            user_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Wait for this user's previous run (or mutation) to finish.
    async fn lock_user(&self, user_id: &str) -> UserGuard<'_> {
        let lock = {
            let mut locks = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(user_id.to_string()).or_default())
        };
        UserGuard {
            locks: &self.user_locks,
            user_id: user_id.to_string(),
            held: Some(lock.lock_owned().await),
        }
    }

    /// Run one query through the pipeline.
    ///
    /// `Exhausted` is a normal outcome. Errors are reserved for invalid input,
    /// storage failures (including a line changed by another writer), the
    /// answering service failing after its retries, and every search call of a
    /// round failing.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn run(
        &self,
        user_id: &str,
        query: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome> {
        let user_id = require("user id", user_id)?;
        let query = require("query", query)?;

        let _guard = self.lock_user(user_id).await;
        let start = Instant::now();
        step(progress, PipelineState::Initial, format!("\"{query}\""));

        match self.run_locked(user_id, query, progress).await {
            Ok(outcome) => {
                info!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    ready = matches!(outcome, RunOutcome::RecommendationsReady(_)),
                    "pipeline run finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "pipeline run aborted");
                progress.emit(ProgressEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_locked(
        &self,
        user_id: &str,
        query_text: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome> {
        let limits = &self.config.pipeline;
        self.storage.ensure_user(user_id).await?;
        let mut lines = self
            .storage
            .list_lines(user_id, limits.recent_lines_limit, true)
            .await?;

        // --- Line assignment ---
        let continued = match self.lines.choose(&lines, query_text) {
            LineChoice::Continue { line_id, score } => {
                debug!(%line_id, score, "continuing line");
                lines.iter().position(|l| l.id == line_id)
            }
            LineChoice::Open { best_score } => {
                debug!(best = ?best_score, "opening a new line");
                None
            }
        };
        let context = continued.map_or(&[][..], |i| lines[i].queries.as_slice());
        let answer = self.services.answering.ask(query_text, context).await?;
        let query = Query {
            text: query_text.to_string(),
            response: answer.response_text,
            citations: answer.citations,
            asked_at: Utc::now(),
        };
        let mut line = match continued {
            Some(i) => {
                let mut line = lines.remove(i);
                self.lines.record(&mut line, query.clone());
                line
            }
            None => self.lines.open(user_id, query.clone()),
        };
        let related_ids = self
            .lines
            .find_related(&line, &lines, limits.related_candidate_limit);
        line.related_line_ids.extend(related_ids);
        step(
            progress,
            PipelineState::LineAssigned,
            format!(
                "{} line {} ({} queries, focus: {})",
                if continued.is_some() { "continued" } else { "opened" },
                line.id,
                line.queries.len(),
                line.current_focus
            ),
        );

        // --- Knowledge ---
        let loaded = self.storage.load_knowledge(user_id).await?;
        let base_version = loaded.version;
        let interactions = self
            .storage
            .list_interactions(user_id, limits.interaction_limit)
            .await?;
        let mut delta = self.tracker.update(&loaded, &line, &query);
        let from_interactions = self.tracker.apply_interactions(&interactions);
        delta.changes.extend(from_interactions.changes);
        delta.seen_content.extend(from_interactions.seen_content);
        let mut knowledge = loaded;
        knowledge.merge(&delta);
        line.learning_path = self.tracker.gaps_and_next_topics(&line, &knowledge);
        step(
            progress,
            PipelineState::KnowledgeUpdated,
            format!(
                "{} concept(s) demonstrated, {} gap(s)",
                delta.demonstrated().count(),
                line.learning_path.knowledge_gaps.len()
            ),
        );

        // --- Moment ---
        let moment = self.classifier.classify(&line, &knowledge);
        step(
            progress,
            PipelineState::MomentClassified,
            match &moment {
                Some(m) => format!("{} ({:.2}): {}", m.kind, m.confidence, m.reasoning),
                None => "no learning moment".to_string(),
            },
        );
        let mut scope: Vec<LineId> = vec![line.id];
        scope.extend(line.related_line_ids.iter().copied());
        let line_content = self
            .storage
            .recommended_content(user_id, &scope)
            .await?;
        let follow_ups =
            follow_up_queries(&interactions, &line_content, limits.max_queries_per_strategy);

        // --- Strategy / discovery / filtering rounds ---
        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut feedback: Option<FailureFeedback> = None;
        let mut recommendations = Vec::new();
        let mut attempts = 0;
        for attempt in 1..=limits.max_attempts.max(1) {
            attempts = attempt;
            let strategy = self.strategist.generate(
                &line,
                moment.as_ref(),
                &knowledge,
                feedback.as_ref(),
                &follow_ups,
            );
            step(
                progress,
                PipelineState::Strategizing,
                format!(
                    "attempt {attempt}: {}",
                    strategy
                        .queries
                        .iter()
                        .map(|q| q.query_text.as_str())
                        .collect::<Vec<_>>()
                        .join(" | ")
                ),
            );

            step(
                progress,
                PipelineState::Discovering,
                format!("{} search queries", strategy.queries.len()),
            );
            let discovery = self.discover(&strategy).await?;

            step(
                progress,
                PipelineState::Filtering,
                format!("{} candidates", discovery.candidates.len()),
            );
            let mut kept = Vec::new();
            let mut rejections = Vec::new();
            for candidate in &discovery.candidates {
                let evaluation =
                    self.filter
                        .evaluate(candidate, &line, moment.as_ref(), &knowledge);
                if let Some(recommendation) = evaluation.recommendation(candidate) {
                    kept.push(recommendation);
                } else if let Some(rejection) = evaluation.rejection(candidate) {
                    rejections.push(rejection);
                }
            }

            if !kept.is_empty() {
                kept.sort_by(|a, b| b.value_score.total_cmp(&a.value_score));
                kept.truncate(limits.max_recommendations);
                info!(attempt, kept = kept.len(), "recommendations ready");
                recommendations = kept;
                break;
            }

            info!(
                attempt,
                rejected = rejections.len(),
                dropped = discovery.dropped_calls,
                "attempt produced no recommendations"
            );
            failures.push(AttemptFailure {
                attempt,
                queries: strategy.queries.iter().map(|q| q.query_text.clone()).collect(),
                rejections: rejections.clone(),
                dropped_calls: discovery.dropped_calls,
            });
            feedback = Some(FailureFeedback {
                previous: strategy,
                rejections,
            });
        }

        // --- Terminal state ---
        let related: Vec<QueryLine> = lines
            .iter()
            .filter(|l| line.related_line_ids.contains(&l.id))
            .cloned()
            .collect();
        let suggestions = self
            .suggestions
            .suggest(&line, moment.as_ref(), &knowledge, &related);

        let outcome = if recommendations.is_empty() {
            RunOutcome::Exhausted(ExhaustedReport {
                moment,
                line_id: line.id,
                line_analysis: line.analysis(),
                failures,
                suggestions,
            })
        } else {
            RunOutcome::RecommendationsReady(RecommendationResult {
                moment,
                line_id: line.id,
                line_analysis: line.analysis(),
                recommendations,
                suggestions,
                attempts,
            })
        };

        self.storage.save_line(&mut line).await?;
        let knowledge_version = self.persist_knowledge(&knowledge, base_version, &delta).await?;
        self.storage
            .record_run(user_id, query_text, knowledge_version, &outcome)
            .await?;

        progress.emit(match &outcome {
            RunOutcome::RecommendationsReady(result) => ProgressEvent::Complete {
                data: result.clone(),
            },
            RunOutcome::Exhausted(report) => ProgressEvent::Exhausted {
                data: report.clone(),
            },
        });
        Ok(outcome)
    }

    /// Save `state`; if another writer moved the stored version, re-merge
    /// `delta` over the fresh state once and save that instead.
    async fn persist_knowledge(
        &self,
        state: &KnowledgeState,
        base_version: u64,
        delta: &KnowledgeDelta,
    ) -> Result<u64> {
        match self.storage.save_knowledge(state, base_version).await {
            Ok(()) => Ok(state.version),
            Err(LearnlineError::Conflict(message)) => {
                warn!(%message, "knowledge state moved during the run, re-merging");
                let mut fresh = self.storage.load_knowledge(&state.user_id).await?;
                let expected = fresh.version;
                fresh.merge(delta);
                self.storage.save_knowledge(&fresh, expected).await?;
                Ok(fresh.version)
            }
            Err(e) => Err(e),
        }
    }

    /// Search every strategy query and extract the results, both with a
    /// bounded number of concurrent calls.
    ///
    /// A failed search call or extraction drops only its own query or page.
    /// When every search call fails the round aborts with
    /// [`LearnlineError::DiscoveryUnavailable`].
    #[instrument(skip_all, fields(attempt = strategy.attempt))]
    async fn discover(&self, strategy: &SearchStrategy) -> Result<Discovery> {
        let semaphore = Arc::new(Semaphore::new(self.config.discovery.concurrency.max(1)));

        let mut searches = Vec::with_capacity(strategy.queries.len());
        for query in &strategy.queries {
            let search = Arc::clone(&self.services.search);
            let sem = Arc::clone(&semaphore);
            let text = query.query_text.clone();
            searches.push(tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| LearnlineError::DiscoveryUnavailable(e.to_string()))?;
                search.search(&text).await
            }));
        }

        let mut slots: Vec<Slot> = Vec::new();
        let mut seen = HashSet::new();
        let mut dropped_calls = 0;
        let mut failed_searches = 0;
        let mut last_error = String::new();
        for (query_rank, handle) in searches.into_iter().enumerate() {
            let query = &strategy.queries[query_rank].query_text;
            let outcome = handle
                .await
                .map_err(|e| LearnlineError::DiscoveryUnavailable(e.to_string()))
                .and_then(|result| result);
            match outcome {
                Ok(pages) => {
                    debug!(%query, pages = pages.len(), "search returned");
                    for (discovery_rank, page) in pages.into_iter().enumerate() {
                        let id = content_id(&page.url);
                        if seen.insert(id.clone()) {
                            slots.push(Slot {
                                content_id: id,
                                page,
                                query_rank,
                                discovery_rank,
                                document: None,
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!(%query, error = %e, "search call failed, dropping query");
                    dropped_calls += 1;
                    failed_searches += 1;
                    last_error = e.to_string();
                }
            }
        }
        if failed_searches > 0 && failed_searches == strategy.queries.len() {
            return Err(LearnlineError::DiscoveryUnavailable(format!(
                "all {failed_searches} search calls failed, last: {last_error}"
            )));
        }

        let ttl = chrono::Duration::hours(self.config.discovery.cache_ttl_hours as i64);
        for slot in &mut slots {
            match self.storage.get_cached_content(&slot.content_id, ttl).await {
                Ok(Some(cached)) => {
                    debug!(url = %slot.page.url, "content cache hit");
                    slot.document = Some(cached.document);
                }
                Ok(None) => {}
                Err(e) => warn!(url = %slot.page.url, error = %e, "content cache read failed"),
            }
        }

        let mut extractions = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            if slot.document.is_some() {
                continue;
            }
            let extractor = Arc::clone(&self.services.extractor);
            let sem = Arc::clone(&semaphore);
            let url = slot.page.url.clone();
            let raw = slot.page.raw_content.clone();
            extractions.push((
                index,
                tokio::spawn(async move {
                    let _permit = sem
                        .acquire_owned()
                        .await
                        .map_err(|e| LearnlineError::DiscoveryUnavailable(e.to_string()))?;
                    extractor.extract(&url, &raw).await
                }),
            ));
        }
        for (index, handle) in extractions {
            let slot = &mut slots[index];
            let outcome = handle
                .await
                .map_err(|e| LearnlineError::parse(e.to_string()))
                .and_then(|result| result);
            match outcome {
                Ok(document) => {
                    if let Err(e) = self
                        .storage
                        .put_cached_content(&slot.content_id, &slot.page.url, &document)
                        .await
                    {
                        warn!(url = %slot.page.url, error = %e, "content cache write failed");
                    }
                    slot.document = Some(document);
                }
                Err(e) => {
                    warn!(url = %slot.page.url, error = %e, "extraction failed, dropping page");
                    dropped_calls += 1;
                }
            }
        }

        let mut candidates: Vec<Candidate> = slots
            .into_iter()
            .filter_map(|slot| {
                slot.document.map(|document| Candidate {
                    content_id: slot.content_id,
                    url: slot.page.url,
                    document,
                    query_rank: slot.query_rank,
                    discovery_rank: slot.discovery_rank,
                })
            })
            .collect();
        candidates.sort_by_key(|c| (c.query_rank, c.discovery_rank));

        info!(
            candidates = candidates.len(),
            dropped = dropped_calls,
            "discovery round complete"
        );
        Ok(Discovery {
            candidates,
            dropped_calls,
        })
    }

    // -----------------------------------------------------------------------
    // Per-user mutations outside a run
    // -----------------------------------------------------------------------

    /// Validate and store one interaction. It feeds the user's next run.
    #[instrument(skip_all, fields(user_id = %interaction.user_id, kind = interaction.kind.name()))]
    pub async fn record_interaction(&self, interaction: &Interaction) -> Result<String> {
        validate_interaction(interaction)?;
        let _guard = self.lock_user(&interaction.user_id).await;
        self.storage.ensure_user(&interaction.user_id).await?;
        self.storage.insert_interaction(interaction).await
    }

    /// Stop a line from being continued. It stays available as related context.
    pub async fn deactivate_line(&self, user_id: &str, line_id: &LineId) -> Result<bool> {
        let user_id = require("user id", user_id)?;
        let _guard = self.lock_user(user_id).await;
        self.storage.set_line_active(user_id, line_id, false).await
    }

    /// Forget how well `concept` is understood. Returns `false` for unknown concepts.
    pub async fn reset_concept(&self, user_id: &str, concept: &str) -> Result<bool> {
        let user_id = require("user id", user_id)?;
        let concept = require("concept", concept)?.to_lowercase();
        let _guard = self.lock_user(user_id).await;
        let mut state = self.storage.load_knowledge(user_id).await?;
        let base_version = state.version;
        if !state.reset_concept(&concept) {
            return Ok(false);
        }
        self.storage.save_knowledge(&state, base_version).await?;
        info!(%concept, "concept reset");
        Ok(true)
    }
}

/// Trimmed `value`, or a validation error naming `what` when it is empty.
fn require<'a>(what: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LearnlineError::validation(format!("{what} must not be empty")));
    }
    Ok(value)
}

/// Boundary checks for an incoming interaction.
pub fn validate_interaction(interaction: &Interaction) -> Result<()> {
    require("user id", &interaction.user_id)?;
    require("content id", &interaction.content_id)?;
    match &interaction.kind {
        InteractionKind::ProgressUpdate { progress } if !(0.0..=1.0).contains(progress) => Err(
            LearnlineError::validation(format!("progress {progress} is outside [0, 1]")),
        ),
        InteractionKind::FollowUpQuery { query } => require("follow-up query", query).map(|_| ()),
        InteractionKind::Highlight {
            highlighted_text, ..
        } => require("highlighted text", highlighted_text).map(|_| ()),
        _ => Ok(()),
    }
}

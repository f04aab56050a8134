//! Mention loop: fetch, deduplicate, generate, publish, record.

use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dedup::DedupStore;
use crate::error::{BotError, ErrorKind, Result};
use crate::fetcher::MentionFetcher;
use crate::generator::{GeneratorSettings, ResponseGenerator, mention_body};
use crate::ollama::InferenceBackend;
use crate::publisher::{PublishResult, Publisher};
use crate::rate_limit::{BackoffPolicy, CallOutcome, RateLimiter};
use crate::state::{PersistedState, StateFile};
use crate::types::{
    Account, Checkpoint, GeneratedReply, Mention, MentionBatch, Outcome, Quota, ThreadMessage,
};
use crate::x_api::SocialApi;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Idle,
    Fetching,
    Processing,
    Publishing,
    Recording,
    CoolingDown,
}

/// Tally of a single fetch-and-process cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub already_processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CycleReport {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Remote {
    Platform,
    Backend,
}

#[derive(Debug, Clone)]
struct LoopSettings {
    poll_interval: Duration,
    max_attempts: u32,
    max_context_messages: usize,
    shutdown_grace: Duration,
    dedup_capacity: usize,
}

pub struct Orchestrator<S, B> {
    settings: LoopSettings,
    social: S,
    fetcher: MentionFetcher,
    generator: ResponseGenerator<B>,
    publisher: Publisher,
    store: DedupStore,
    checkpoint: Checkpoint,
    state_file: Option<StateFile>,
    platform_limiter: RateLimiter,
    backend_limiter: RateLimiter,
    shutdown: CancellationToken,
    state: State,
}

impl<S: SocialApi, B: InferenceBackend> Orchestrator<S, B> {
    pub fn new(
        config: &Config,
        social: S,
        account: Account,
        backend: B,
        shutdown: CancellationToken,
    ) -> Self {
        let policy = BackoffPolicy {
            floor: config.backoff_floor,
            ceiling: config.backoff_ceiling,
        };

        Self {
            settings: LoopSettings {
                poll_interval: config.poll_interval,
                max_attempts: config.max_attempts,
                max_context_messages: config.max_context_messages,
                shutdown_grace: config.shutdown_grace,
                dedup_capacity: config.dedup_capacity,
            },
            social,
            fetcher: MentionFetcher::new(account),
            generator: ResponseGenerator::new(backend, GeneratorSettings::from(config)),
            publisher: Publisher::new(config.max_reply_chars),
            store: DedupStore::new(config.dedup_capacity),
            checkpoint: Checkpoint::starting_at(config.start_time),
            state_file: None,
            platform_limiter: RateLimiter::new("platform", policy)
                .with_min_interval(config.request_delay),
            backend_limiter: RateLimiter::new("inference backend", policy),
            shutdown,
            state: State::Idle,
        }
    }

    /// Save state to `file` after every recorded outcome and completed cycle.
    #[must_use]
    pub fn with_state_file(mut self, file: StateFile) -> Self {
        self.state_file = Some(file);
        self
    }

    /// Resume from a previous run. The saved checkpoint replaces the configured start time.
    pub fn restore(&mut self, saved: PersistedState) {
        info!(
            "Resuming after mention {:?} with {} known mentions",
            saved.checkpoint.after_id,
            saved.records.len()
        );
        self.checkpoint = saved.checkpoint;
        self.store = DedupStore::from_records(saved.records, self.settings.dedup_capacity);
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    #[must_use]
    pub fn social(&self) -> &S {
        &self.social
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        self.generator.backend()
    }

    /// Poll for mentions until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns the first process-fatal error, such as rejected credentials.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Watching mentions of @{} every {:?}",
            self.fetcher.account().handle,
            self.settings.poll_interval
        );

        loop {
            let result = match self.run_cycle().await {
                Ok(report) => {
                    if report.fetched > 0 {
                        info!(
                            "Cycle done: {} fetched, {} replied, {} failed, {} skipped",
                            report.fetched, report.succeeded, report.failed, report.skipped
                        );
                    } else {
                        debug!("No new mentions");
                    }
                    self.transition(State::Idle);
                    if self.checkpoint.backlog.is_some() {
                        debug!("Backlog pending, fetching again without waiting");
                        Ok(())
                    } else {
                        self.sleep(self.settings.poll_interval).await
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {}
                Err(BotError::Shutdown) => {
                    self.persist().await;
                    info!("Mention loop stopped");
                    return Ok(());
                }
                Err(e) => {
                    self.persist().await;
                    return Err(e);
                }
            }
        }
    }

    /// Fetch new mentions and process each one, oldest first.
    ///
    /// The checkpoint only advances once every fetched mention has a terminal
    /// outcome. A fetch cut short leaves a backlog that the next cycle continues.
    ///
    /// # Errors
    ///
    /// Returns [`BotError::Shutdown`] when interrupted, or a process-fatal error.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let MentionBatch {
            items: mentions,
            resume_below,
        } = self.fetch().await?;
        let next = self
            .checkpoint
            .advanced_past(&mentions, resume_below.as_deref());
        let mut report = CycleReport {
            fetched: mentions.len(),
            ..CycleReport::default()
        };

        for mention in mentions {
            if self.store.has_processed(&mention.id) {
                debug!("Mention {} was already processed", mention.id);
                report.already_processed += 1;
                continue;
            }
            let outcome = self.process_mention(mention).await?;
            report.count(outcome);
        }

        self.checkpoint = next;
        self.persist().await;
        Ok(report)
    }

    /// Take a single mention to a terminal outcome.
    ///
    /// A mention that already has an outcome is returned as-is without any
    /// platform or backend call.
    ///
    /// # Errors
    ///
    /// Returns [`BotError::Shutdown`] when interrupted, or a process-fatal error.
    pub async fn process_mention(&mut self, mut mention: Mention) -> Result<Outcome> {
        self.transition(State::Processing);
        if let Some(outcome) = self.store.outcome(&mention.id) {
            debug!("Mention {} already recorded as {outcome}", mention.id);
            return Ok(outcome);
        }

        info!(
            "Processing mention {} from @{}: {}",
            mention.id, mention.author, mention.text
        );

        let bare = mention_body(&mention.text).is_empty();
        if bare && mention.in_reply_to.is_none() {
            info!("Mention {} has nothing to reply to, skipping", mention.id);
            return self.record(&mention.id, Outcome::Skipped).await;
        }

        self.load_context(&mut mention).await?;
        if bare && mention.context.is_empty() {
            info!(
                "Mention {} tags a post that could not be loaded, skipping",
                mention.id
            );
            return self.record(&mention.id, Outcome::Skipped).await;
        }

        match self.generate(&mention).await? {
            Some(reply) => self.publish(&mention, &reply).await,
            None => self.record(&mention.id, Outcome::Failed).await,
        }
    }

    /// Walk the reply chain above `mention`, stopping at the context limit.
    async fn load_context(&mut self, mention: &mut Mention) -> Result<()> {
        if !mention.context.is_empty() {
            return Ok(());
        }

        let limit = self.settings.max_context_messages;
        let mut chain = Vec::new();
        let mut parent = mention.in_reply_to.clone();

        while chain.len() < limit
            && let Some(id) = parent.take()
        {
            self.pace(Remote::Platform).await?;
            match self
                .cancellable(self.fetcher.lookup(&self.social, &id))
                .await
            {
                Ok(response) => {
                    self.succeeded(Remote::Platform, response.quota);
                    parent.clone_from(&response.body.in_reply_to);
                    chain.push(ThreadMessage::from(response.body));
                }
                Err(e) => {
                    let what = format!("Looking up post {id} above mention {}", mention.id);
                    self.absorb(Remote::Platform, e, &what)?;
                    break;
                }
            }
        }

        debug!(
            "Mention {} has {} messages of context",
            mention.id,
            chain.len()
        );
        chain.reverse();
        mention.context = chain;
        Ok(())
    }

    /// Generate a reply, retrying until the attempt ceiling.
    ///
    /// Only failed generations count as attempts.
    ///
    /// Returns `None` once the mention should be recorded as failed.
    async fn generate(&mut self, mention: &Mention) -> Result<Option<GeneratedReply>> {
        let max = self.settings.max_attempts;
        loop {
            let attempts = self.store.attempts(&mention.id);
            if attempts >= max {
                warn!(
                    "Giving up on mention {} after {attempts} generation attempts",
                    mention.id
                );
                return Ok(None);
            }

            self.pace(Remote::Backend).await?;
            match self.cancellable(self.generator.generate(mention)).await {
                Ok(reply) => {
                    self.backend_limiter.report(CallOutcome::Success, Utc::now());
                    debug!(
                        "Reply to mention {} generated in {:?}",
                        mention.id, reply.latency
                    );
                    return Ok(Some(reply));
                }
                Err(e) => {
                    if !matches!(e.kind(), ErrorKind::RateLimited(_) | ErrorKind::FatalProcess) {
                        self.store.record_attempt(&mention.id, Utc::now());
                    }
                    let what = format!(
                        "Generation for mention {} (attempt {}/{max})",
                        mention.id,
                        self.store.attempts(&mention.id)
                    );
                    if self.absorb(Remote::Backend, e, &what)? == ErrorKind::FatalMention {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Publish `reply`, retrying transient failures up to the attempt ceiling.
    async fn publish(&mut self, mention: &Mention, reply: &GeneratedReply) -> Result<Outcome> {
        self.transition(State::Publishing);
        let max = self.settings.max_attempts;
        let mut attempts = 0;

        loop {
            if attempts >= max {
                warn!(
                    "Giving up on mention {} after {attempts} publish attempts",
                    mention.id
                );
                return self.record(&mention.id, Outcome::Failed).await;
            }

            self.pace(Remote::Platform).await?;
            match self.publish_with_grace(&mention.id, &reply.text).await? {
                Ok(result) => {
                    self.succeeded(Remote::Platform, result.quota);
                    info!(
                        "Replied to @{} ({}) with {}: {}",
                        mention.author, mention.id, result.reply_id, reply.text
                    );
                    return self.record(&mention.id, Outcome::Succeeded).await;
                }
                Err(e) => {
                    if !matches!(e.kind(), ErrorKind::RateLimited(_)) {
                        attempts += 1;
                    }
                    let what = format!(
                        "Publishing reply to mention {} (attempt {attempts}/{max})",
                        mention.id
                    );
                    if self.absorb(Remote::Platform, e, &what)? == ErrorKind::FatalMention {
                        return self.record(&mention.id, Outcome::Failed).await;
                    }
                }
            }
        }
    }

    /// Publish once. A shutdown request gives the call the grace period to land.
    ///
    /// The outer error is [`BotError::Shutdown`] when the call had to be abandoned.
    async fn publish_with_grace(
        &self,
        mention_id: &str,
        text: &str,
    ) -> Result<Result<PublishResult>> {
        let call = self.publisher.publish(&self.social, mention_id, text);
        tokio::pin!(call);

        tokio::select! {
            result = &mut call => return Ok(result),
            () = self.shutdown.cancelled() => {}
        }

        warn!(
            "Shutdown requested while replying to mention {mention_id}, waiting up to {:?}",
            self.settings.shutdown_grace
        );
        if let Ok(result) = tokio::time::timeout(self.settings.shutdown_grace, call).await {
            Ok(result)
        } else {
            warn!("Abandoned the reply to mention {mention_id}; it stays unrecorded");
            Err(BotError::Shutdown)
        }
    }

    async fn record(&mut self, mention_id: &str, outcome: Outcome) -> Result<Outcome> {
        self.transition(State::Recording);
        if self.store.mark_processed(mention_id, outcome, Utc::now()) {
            info!("Mention {mention_id} {outcome}");
        }
        self.persist().await;
        Ok(outcome)
    }

    async fn fetch(&mut self) -> Result<MentionBatch<Mention>> {
        loop {
            self.transition(State::Fetching);
            self.pace(Remote::Platform).await?;
            match self
                .cancellable(self.fetcher.fetch(&self.social, &self.checkpoint))
                .await
            {
                Ok(response) => {
                    self.succeeded(Remote::Platform, response.quota);
                    return Ok(response.body);
                }
                Err(e) => {
                    if self.absorb(Remote::Platform, e, "Fetching mentions")?
                        == ErrorKind::FatalMention
                    {
                        self.platform_limiter
                            .report(CallOutcome::TransientError, Utc::now());
                    }
                }
            }
        }
    }

    /// Wait until the limiter for `remote` admits a call.
    async fn pace(&mut self, remote: Remote) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(BotError::Shutdown);
        }

        let wait = self.limiter(remote).admit(Utc::now());
        if wait.is_zero() {
            return Ok(());
        }

        let resume = self.state;
        self.transition(State::CoolingDown);
        debug!(
            "Waiting {wait:?} before calling the {}",
            self.limiter(remote).name()
        );
        self.sleep(wait).await?;
        self.transition(resume);
        Ok(())
    }

    /// Feed a failed call back to its limiter. Process-fatal errors are returned.
    fn absorb(&mut self, remote: Remote, err: BotError, what: &str) -> Result<ErrorKind> {
        let kind = err.kind();
        let now = Utc::now();
        match kind {
            ErrorKind::FatalProcess => return Err(err),
            ErrorKind::RateLimited(reset_at) => {
                warn!("{what} was rate limited until {reset_at}");
                self.limiter_mut(remote)
                    .report(CallOutcome::RateLimited { reset_at }, now);
            }
            ErrorKind::Transient => {
                warn!("{what} failed: {err}");
                self.limiter_mut(remote)
                    .report(CallOutcome::TransientError, now);
            }
            ErrorKind::FatalMention => warn!("{what} failed permanently: {err}"),
        }
        Ok(kind)
    }

    fn succeeded(&mut self, remote: Remote, quota: Option<Quota>) {
        let limiter = self.limiter_mut(remote);
        limiter.report(CallOutcome::Success, Utc::now());
        if let Some(quota) = quota {
            limiter.observe_quota(quota);
        }
    }

    fn limiter(&self, remote: Remote) -> &RateLimiter {
        match remote {
            Remote::Platform => &self.platform_limiter,
            Remote::Backend => &self.backend_limiter,
        }
    }

    fn limiter_mut(&mut self, remote: Remote) -> &mut RateLimiter {
        match remote {
            Remote::Platform => &mut self.platform_limiter,
            Remote::Backend => &mut self.backend_limiter,
        }
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            debug!("{} -> {next}", self.state);
            self.state = next;
        }
    }

    async fn cancellable<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            () = self.shutdown.cancelled() => Err(BotError::Shutdown),
            result = call => result,
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            () = self.shutdown.cancelled() => Err(BotError::Shutdown),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn persist(&self) {
        let Some(file) = &self.state_file else {
            return;
        };
        let state = PersistedState {
            checkpoint: self.checkpoint.clone(),
            records: self.store.snapshot(),
        };
        if let Err(e) = file.save(&state).await {
            warn!("Failed to save state to {}: {e}", file.path().display());
        }
    }
}

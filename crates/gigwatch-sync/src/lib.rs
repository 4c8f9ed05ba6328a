//! Pipeline orchestration: configuration, the scrape→score→announce cycle,
//! the dispatcher, the watch loop and the operator event service.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gigwatch_bot::{CardOutcome, ChatGateway, JobCard, MessageRef};
use gigwatch_core::{
    AppliedRecord, CardState, OperatorAction, OperatorCommand, OperatorEvent, SentRecord,
    StagedPosting,
};
use gigwatch_eval::{evaluate_pending, Evaluator};
use gigwatch_scraper::{scrape_into_raw, BrowserPage};
use gigwatch_store::{AppliedLog, RawStore, SentLog, StagedStore};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gigwatch-sync";

pub const SENT_LOG_FILE: &str = "jobs-sent.csv";
pub const APPLIED_LOG_FILE: &str = "jobs-applied.csv";

const DEFAULT_QUERY_URLS: [&str; 3] = [
    "https://www.upwork.com/nx/search/jobs/?amount=100-499,500-999,1000-4999,5000-&q=statistics&t=0,1&page=1&per_page=50",
    "https://www.upwork.com/nx/search/jobs/?amount=100-499,500-999,1000-4999,5000-&per_page=50&q=data%20analyst&t=0,1",
    "https://www.upwork.com/nx/search/jobs/?amount=100-499,500-999,1000-4999,5000-&per_page=50&q=data%20scientist&t=0,1",
];

/// Runtime configuration, resolved once at startup and passed by reference.
/// Business logic never reads the environment on its own.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub discord_bot_token: String,
    pub discord_application_id: String,
    pub discord_public_key: String,
    pub discord_guild_id: String,
    pub discord_channel_id: String,
    pub raw_path: PathBuf,
    pub staging_path: PathBuf,
    pub sent_path: PathBuf,
    pub applied_path: PathBuf,
    pub query_urls: Vec<String>,
    pub scoring_model: String,
    pub letter_model: String,
    pub watch_interval: Duration,
    pub bind_addr: String,
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} is not set"))
}

fn parse_query_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // the model credential is checked first so a missing key is the
        // startup failure the operator sees
        let openai_api_key = required_var("OPENAI_API_KEY")?;
        let query_urls = match std::env::var("GIGWATCH_QUERY_URLS") {
            Ok(raw) => {
                let urls = parse_query_urls(&raw);
                if urls.is_empty() {
                    DEFAULT_QUERY_URLS.map(String::from).to_vec()
                } else {
                    urls
                }
            }
            Err(_) => DEFAULT_QUERY_URLS.map(String::from).to_vec(),
        };
        Ok(Self {
            openai_api_key,
            discord_bot_token: required_var("DISCORD_BOT_TOKEN")?,
            discord_application_id: required_var("DISCORD_APP_ID")?,
            discord_public_key: required_var("DISCORD_PUBLIC_KEY")?,
            discord_guild_id: required_var("DISCORD_GUILD_ID")?,
            discord_channel_id: required_var("DISCORD_CHANNEL_ID")?,
            raw_path: PathBuf::from(required_var("RAW_PATH")?),
            staging_path: PathBuf::from(required_var("STAGING_PATH")?),
            sent_path: PathBuf::from(required_var("SENT_PATH")?),
            applied_path: PathBuf::from(required_var("APPLIED_PATH")?),
            query_urls,
            scoring_model: std::env::var("GIGWATCH_SCORING_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            letter_model: std::env::var("GIGWATCH_LETTER_MODEL")
                .unwrap_or_else(|_| "gpt-4.1".to_string()),
            watch_interval: Duration::from_secs(
                std::env::var("GIGWATCH_WATCH_INTERVAL_SECS")
                    .ok()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(3600),
            ),
            bind_addr: std::env::var("GIGWATCH_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8787".to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tiles_found: usize,
    pub raw_appended: usize,
    pub evaluated: usize,
    pub dispatched: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DispatchSummary {
    pub approved: usize,
    pub already_sent: usize,
    pub dispatched: usize,
}

/// A dispatched card the operator has not acted on yet.
#[derive(Debug, Clone)]
struct PendingCard {
    staged: StagedPosting,
    state: CardState,
}

/// The whole pipeline wired to its ports. Cheap to share behind an [`Arc`];
/// a manual `run` command may overlap a scheduled cycle, in which case the
/// stores' id-based dedup is the only guard against duplicates.
pub struct Pipeline {
    browser: Arc<dyn BrowserPage>,
    evaluator: Arc<dyn Evaluator>,
    gateway: Arc<dyn ChatGateway>,
    raw: RawStore,
    staged: StagedStore,
    sent: SentLog,
    applied: AppliedLog,
    query_urls: Vec<String>,
    pending: Mutex<HashMap<String, PendingCard>>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        browser: Arc<dyn BrowserPage>,
        evaluator: Arc<dyn Evaluator>,
        gateway: Arc<dyn ChatGateway>,
    ) -> Self {
        Self {
            browser,
            evaluator,
            gateway,
            raw: RawStore::new(&config.raw_path),
            staged: StagedStore::new(&config.staging_path),
            sent: SentLog::new(config.sent_path.join(SENT_LOG_FILE)),
            applied: AppliedLog::new(config.applied_path.join(APPLIED_LOG_FILE)),
            query_urls: config.query_urls.clone(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &dyn ChatGateway {
        self.gateway.as_ref()
    }

    /// One full scrape → evaluate → dispatch cycle, narrated into the
    /// operator channel.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting pipeline cycle");
        self.gateway.post_text("🚀 Running job pipeline...").await?;

        let mut tiles_found = 0;
        let mut raw_appended = 0;
        for url in &self.query_urls {
            let summary = scrape_into_raw(self.browser.as_ref(), url, &self.raw).await?;
            tiles_found += summary.found;
            raw_appended += summary.appended;
            self.gateway
                .post_text(&format!(
                    "🖨️ Raw step: {} postings on the page, {} new.",
                    summary.found, summary.appended
                ))
                .await?;
        }

        let eval = evaluate_pending(self.evaluator.as_ref(), &self.raw, &self.staged).await?;
        self.gateway
            .post_text(&format!(
                "🖨️ Staging step: evaluated {} pending postings.",
                eval.staged
            ))
            .await?;

        let dispatch = self.dispatch_new(None).await?;
        self.gateway.post_text("✅ Job pipeline finished!").await?;

        let summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            tiles_found,
            raw_appended,
            evaluated: eval.staged,
            dispatched: dispatch.dispatched,
        };
        info!(
            %run_id,
            raw_appended = summary.raw_appended,
            evaluated = summary.evaluated,
            dispatched = summary.dispatched,
            "pipeline cycle finished"
        );
        Ok(summary)
    }

    /// Announce approved postings that are not in the sent set yet, weakest
    /// match first. Each posting is logged as sent immediately after its
    /// card goes out, so a crash mid-run never re-announces earlier cards.
    pub async fn dispatch_new(
        &self,
        sent_override: Option<Vec<String>>,
    ) -> Result<DispatchSummary> {
        let candidates = self.staged.approved()?;
        let sent_ids = match sent_override {
            Some(ids) => ids,
            None => self.sent.ids()?,
        };
        self.gateway
            .post_text(&format!(
                "🖨️ Sending step: {} approved postings, {} already sent.",
                candidates.len(),
                sent_ids.len()
            ))
            .await?;

        let approved = candidates.len();
        let already_sent = sent_ids.len();
        let sent_set: HashSet<String> = sent_ids.into_iter().collect();
        let fresh: Vec<StagedPosting> = candidates
            .into_iter()
            .filter(|candidate| !sent_set.contains(&candidate.posting.id))
            .collect();
        self.gateway
            .post_text(&format!("🖨️ Sending step: {} new postings to announce.", fresh.len()))
            .await?;

        let mut dispatched = 0;
        for staged in fresh {
            let card = JobCard::from_staged(&staged);
            let message = self.gateway.post_job_card(&card).await?;
            self.pending.lock().await.insert(
                message.id.clone(),
                PendingCard {
                    staged: staged.clone(),
                    state: CardState::Pending,
                },
            );
            self.sent.append(&SentRecord::from_staged(&staged, Utc::now()))?;
            dispatched += 1;
        }

        Ok(DispatchSummary {
            approved,
            already_sent,
            dispatched,
        })
    }

    /// Re-announce the most recent postings by trimming the last `last` ids
    /// off the sent set before dispatching.
    pub async fn resend_last(&self, last: u32) -> Result<DispatchSummary> {
        let mut ids = self.sent.ids()?;
        let keep = ids.len().saturating_sub(last as usize);
        ids.truncate(keep);
        self.dispatch_new(Some(ids)).await
    }

    /// Drive the card state machine for an operator button press. Presses on
    /// unknown or already finalized cards are ignored.
    pub async fn handle_card_action(
        &self,
        message_id: &str,
        action: OperatorAction,
    ) -> Result<()> {
        let staged;
        let next;
        {
            let mut pending = self.pending.lock().await;
            let Some(card) = pending.get_mut(message_id) else {
                warn!(message_id, "action on unknown or finalized card, ignoring");
                return Ok(());
            };
            let Some(state) = card.state.on_action(action) else {
                return Ok(());
            };
            card.state = state;
            staged = card.staged.clone();
            next = state;
        }

        let message = MessageRef {
            id: message_id.to_string(),
        };
        match next {
            CardState::Applied => {
                let letter = match self.evaluator.cover_letter(&staged.posting).await {
                    Ok(letter) => letter,
                    Err(err) => {
                        warn!(job_id = %staged.posting.id, error = %err, "cover letter failed");
                        format!("Cover letter generation failed: {err}")
                    }
                };
                self.applied
                    .append(&AppliedRecord::from_staged(&staged, Utc::now()))?;
                self.gateway
                    .start_reply_thread(&message, "Application reply", &letter)
                    .await?;
                self.gateway.finalize_card(&message, CardOutcome::Applied).await?;
                info!(job_id = %staged.posting.id, "posting applied");
            }
            CardState::Skipped => {
                self.gateway.finalize_card(&message, CardOutcome::Skipped).await?;
                info!(job_id = %staged.posting.id, "posting skipped");
            }
            CardState::Pending => {}
        }

        self.pending.lock().await.remove(message_id);
        Ok(())
    }
}

/// RUNNING → IDLE → RUNNING until the stop token flips. The token is checked
/// between cycles and raced against the sleep, so shutdown never waits for
/// the full interval.
pub async fn watch(pipeline: Arc<Pipeline>, interval: Duration, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            break;
        }
        if let Err(err) = pipeline.run_cycle().await {
            error!(error = %err, "pipeline cycle failed");
            let _ = pipeline
                .gateway()
                .post_text(&format!("⚠️ Cycle failed: {err:#}"))
                .await;
        }
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("watch loop stopped");
}

/// Consume operator events until the channel closes or the stop token flips.
pub async fn run_event_service(
    pipeline: Arc<Pipeline>,
    mut events: mpsc::Receiver<OperatorEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Err(err) = handle_event(&pipeline, event).await {
                    error!(error = %err, "operator event failed");
                    let _ = pipeline
                        .gateway()
                        .post_text(&format!("⚠️ Exception: {err:#}"))
                        .await;
                }
            }
        }
    }
    info!("event service stopped");
}

async fn handle_event(pipeline: &Pipeline, event: OperatorEvent) -> Result<()> {
    match event {
        OperatorEvent::Card { message_id, action } => {
            pipeline.handle_card_action(&message_id, action).await
        }
        OperatorEvent::Command(OperatorCommand::Run) => {
            pipeline.run_cycle().await.map(|_| ())
        }
        OperatorEvent::Command(OperatorCommand::Resend { last }) => {
            pipeline.resend_last(last).await.map(|_| ())
        }
        OperatorEvent::Command(OperatorCommand::Purge) => {
            let deleted = pipeline.gateway().purge_channel().await?;
            pipeline
                .gateway()
                .post_text(&format!("🧹 Deleted {deleted} messages."))
                .await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gigwatch_bot::GatewayError;
    use gigwatch_core::{RawPosting, Score};
    use gigwatch_eval::EvalError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::{tempdir, TempDir};

    const SEARCH_PAGE: &str = r#"
    <html><body>
      <section class="card-list-container">
        <article class="job-tile">
          <small class="text-light">Posted today</small>
          <h2><a href="/jobs/A_~0aaa/">Scraper build</a></h2>
          <p>Scrape things.</p>
        </article>
        <article class="job-tile">
          <small class="text-light">Posted yesterday</small>
          <h2><a href="/jobs/B_~0bbb/">Dashboard build</a></h2>
          <p>Plot things.</p>
        </article>
      </section>
    </body></html>
    "#;

    struct FixtureBrowser;

    #[async_trait]
    impl BrowserPage for FixtureBrowser {
        async fn fetch_rendered(&self, _url: &str, _wait: &str) -> anyhow::Result<String> {
            Ok(SEARCH_PAGE.to_string())
        }
    }

    struct CannedEvaluator;

    #[async_trait]
    impl Evaluator for CannedEvaluator {
        fn scoring_model(&self) -> &str {
            "canned"
        }

        async fn score(&self, posting: &RawPosting) -> Score {
            let match_level = if posting.id == "0aaa" { 0.9 } else { 0.5 };
            Score {
                match_level: Some(match_level),
                should_apply: Some(true),
                reason: "fits".to_string(),
                scoring_model: "canned".to_string(),
            }
        }

        async fn cover_letter(&self, posting: &RawPosting) -> Result<String, EvalError> {
            Ok(format!("letter for {}", posting.id))
        }
    }

    #[derive(Default)]
    struct RecordingGateway {
        posts: StdMutex<Vec<String>>,
        cards: StdMutex<Vec<JobCard>>,
        finalized: StdMutex<Vec<(String, CardOutcome)>>,
        threads: StdMutex<Vec<(String, String)>>,
        next_id: AtomicU64,
    }

    #[async_trait]
    impl ChatGateway for RecordingGateway {
        async fn post_text(&self, content: &str) -> Result<(), GatewayError> {
            self.posts.lock().unwrap().push(content.to_string());
            Ok(())
        }

        async fn post_job_card(&self, card: &JobCard) -> Result<MessageRef, GatewayError> {
            self.cards.lock().unwrap().push(card.clone());
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(MessageRef {
                id: format!("msg-{id}"),
            })
        }

        async fn finalize_card(
            &self,
            message: &MessageRef,
            outcome: CardOutcome,
        ) -> Result<(), GatewayError> {
            self.finalized.lock().unwrap().push((message.id.clone(), outcome));
            Ok(())
        }

        async fn start_reply_thread(
            &self,
            message: &MessageRef,
            _name: &str,
            content: &str,
        ) -> Result<(), GatewayError> {
            self.threads
                .lock()
                .unwrap()
                .push((message.id.clone(), content.to_string()));
            Ok(())
        }

        async fn purge_channel(&self) -> Result<usize, GatewayError> {
            Ok(0)
        }
    }

    fn test_pipeline(dir: &TempDir) -> (Arc<Pipeline>, Arc<RecordingGateway>) {
        let gateway = Arc::new(RecordingGateway::default());
        let config = Config {
            openai_api_key: "test".into(),
            discord_bot_token: "test".into(),
            discord_application_id: "1".into(),
            discord_public_key: "00".into(),
            discord_guild_id: "1".into(),
            discord_channel_id: "1".into(),
            raw_path: dir.path().join("raw"),
            staging_path: dir.path().join("staging"),
            sent_path: dir.path().join("sent"),
            applied_path: dir.path().join("applied"),
            query_urls: vec!["https://www.upwork.com/nx/search/jobs/?q=x".into()],
            scoring_model: "canned".into(),
            letter_model: "canned".into(),
            watch_interval: Duration::from_secs(3600),
            bind_addr: "127.0.0.1:0".into(),
        };
        let pipeline = Arc::new(Pipeline::new(
            &config,
            Arc::new(FixtureBrowser),
            Arc::new(CannedEvaluator),
            gateway.clone(),
        ));
        (pipeline, gateway)
    }

    #[test]
    fn query_urls_parse_and_skip_blanks() {
        let urls = parse_query_urls(" https://a ,, https://b ");
        assert_eq!(urls, vec!["https://a".to_string(), "https://b".to_string()]);
    }

    #[tokio::test]
    async fn a_cycle_scrapes_scores_and_announces_weakest_first() {
        let dir = tempdir().unwrap();
        let (pipeline, gateway) = test_pipeline(&dir);

        let summary = pipeline.run_cycle().await.unwrap();
        assert_eq!(summary.raw_appended, 2);
        assert_eq!(summary.evaluated, 2);
        assert_eq!(summary.dispatched, 2);

        let cards = gateway.cards.lock().unwrap();
        let ids: Vec<&str> = cards.iter().map(|card| card.job_id.as_str()).collect();
        assert_eq!(ids, vec!["0bbb", "0aaa"]);
    }

    #[tokio::test]
    async fn repeated_cycles_announce_each_posting_once() {
        let dir = tempdir().unwrap();
        let (pipeline, gateway) = test_pipeline(&dir);

        let first = pipeline.run_cycle().await.unwrap();
        assert_eq!(first.dispatched, 2);
        let second = pipeline.run_cycle().await.unwrap();
        assert_eq!(second.raw_appended, 0);
        assert_eq!(second.evaluated, 0);
        assert_eq!(second.dispatched, 0);
        assert_eq!(gateway.cards.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resend_reannounces_only_the_trimmed_tail() {
        let dir = tempdir().unwrap();
        let (pipeline, gateway) = test_pipeline(&dir);
        pipeline.run_cycle().await.unwrap();

        let resent = pipeline.resend_last(1).await.unwrap();
        assert_eq!(resent.dispatched, 1);
        let cards = gateway.cards.lock().unwrap();
        assert_eq!(cards.len(), 3);
        assert_eq!(cards[2].job_id, "0aaa");
    }

    #[tokio::test]
    async fn apply_flow_logs_threads_and_finalizes_once() {
        let dir = tempdir().unwrap();
        let (pipeline, gateway) = test_pipeline(&dir);
        pipeline.run_cycle().await.unwrap();

        pipeline.handle_card_action("msg-0", OperatorAction::Apply).await.unwrap();
        // the card is terminal now, a second press must be a no-op
        pipeline.handle_card_action("msg-0", OperatorAction::Skip).await.unwrap();

        let finalized = gateway.finalized.lock().unwrap();
        assert_eq!(finalized.as_slice(), &[("msg-0".to_string(), CardOutcome::Applied)]);
        let threads = gateway.threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert!(threads[0].1.starts_with("letter for"));

        let applied = AppliedLog::new(dir.path().join("applied").join(APPLIED_LOG_FILE));
        assert_eq!(applied.ids().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn skip_flow_finalizes_without_logging_applied() {
        let dir = tempdir().unwrap();
        let (pipeline, gateway) = test_pipeline(&dir);
        pipeline.run_cycle().await.unwrap();

        pipeline.handle_card_action("msg-1", OperatorAction::Skip).await.unwrap();
        let finalized = gateway.finalized.lock().unwrap();
        assert_eq!(finalized.as_slice(), &[("msg-1".to_string(), CardOutcome::Skipped)]);
        assert!(gateway.threads.lock().unwrap().is_empty());

        let applied = AppliedLog::new(dir.path().join("applied").join(APPLIED_LOG_FILE));
        assert!(applied.ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn actions_on_unknown_cards_are_ignored() {
        let dir = tempdir().unwrap();
        let (pipeline, gateway) = test_pipeline(&dir);
        pipeline
            .handle_card_action("msg-missing", OperatorAction::Apply)
            .await
            .unwrap();
        assert!(gateway.finalized.lock().unwrap().is_empty());
    }
}

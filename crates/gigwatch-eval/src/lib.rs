//! LLM scoring of raw postings into the staged stage, plus on-demand cover
//! letter generation for approved postings.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gigwatch_core::{resolve_posted_at, RawPosting, Score, StagedPosting};
use gigwatch_store::{RawStore, StagedStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "gigwatch-eval";

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

const FREELANCER_PROFILE: &str = "\
- Location: Porto, Portugal
- Experience: 7+ years in data science and data engineering using Python, SQL, \
statistical modeling, machine learning and web scraping.
- Projects: built an end-to-end pipeline that collects sports results by web \
scraping, stores them as parquet datasets and serves analytics dashboards.
- Tools: Python, SQL, AWS (Lambda, EC2, SageMaker), Docker, Airflow, Power BI, Git.
- Domains: marketplaces, marketing, education and digital products.
- Preferences: freelance work around data scraping, analytics, dashboards, \
automation or predictive modeling; well-defined or recurring projects.
- Languages: Portuguese (native), English (fluent).
- Availability: full-time and part-time.";

const OPENING_HOOKS: [&str; 5] = [
    "This project sits squarely in my wheelhouse: years of scraping, modeling and \
automation work mean I can deliver reliable results fast.",
    "You need someone who has already shipped exactly this kind of data pipeline, \
and that is what I have spent the last seven years doing.",
    "From resilient scrapers to production dashboards, I build the whole path from \
raw pages to decisions, and your project fits that path precisely.",
    "Your posting describes work I do every week: extracting messy data, automating \
the boring parts and turning the result into clear analytics.",
    "If you want clean, scalable Python and a partner who understands the business \
side of the data, I am the right fit for this project.",
];

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("model request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model endpoint returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("model returned no choices")]
    EmptyResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

/// Thin chat-completions client over the OpenAI REST API.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .context("building model http client")?;
        Ok(Self { http, api_key })
    }

    pub async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, EvalError> {
        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: user.to_string(),
                },
            ],
        };

        let resp = self
            .http
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(EvalError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatCompletionResponse = resp.json().await?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(EvalError::EmptyResponse)
    }
}

/// Scoring + cover letter seam so the pipeline and the card flow can be
/// exercised without a live model endpoint.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn scoring_model(&self) -> &str;

    /// Score one posting. Never fails: transport and decode problems come
    /// back as a score with absent `match_level`/`should_apply` and a
    /// diagnostic `reason`, so the posting still advances to staged.
    async fn score(&self, posting: &RawPosting) -> Score;

    async fn cover_letter(&self, posting: &RawPosting) -> Result<String, EvalError>;
}

/// Production [`Evaluator`] backed by [`OpenAiClient`]; the cover letter
/// model is configured separately from the scoring model.
pub struct OpenAiEvaluator {
    client: OpenAiClient,
    scoring_model: String,
    letter_model: String,
}

impl OpenAiEvaluator {
    pub fn new(client: OpenAiClient, scoring_model: String, letter_model: String) -> Self {
        Self {
            client,
            scoring_model,
            letter_model,
        }
    }
}

#[async_trait]
impl Evaluator for OpenAiEvaluator {
    fn scoring_model(&self) -> &str {
        &self.scoring_model
    }

    async fn score(&self, posting: &RawPosting) -> Score {
        let (system, user) = build_scoring_prompt(posting);
        match self.client.chat(&self.scoring_model, &system, &user).await {
            Ok(content) => score_from_response(&self.scoring_model, &content),
            Err(err) => {
                warn!(job_id = %posting.id, error = %err, "scoring call failed");
                Score {
                    match_level: None,
                    should_apply: None,
                    reason: format!("scoring call failed: {err}"),
                    scoring_model: self.scoring_model.clone(),
                }
            }
        }
    }

    async fn cover_letter(&self, posting: &RawPosting) -> Result<String, EvalError> {
        let (system, user) = build_letter_prompt(posting);
        self.client.chat(&self.letter_model, &system, &user).await
    }
}

fn label(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("not specified")
}

fn build_scoring_prompt(posting: &RawPosting) -> (String, String) {
    let system = "You are a freelance job evaluator specialized in data science, \
data engineering and automation. You judge how well a marketplace job post fits \
a given freelancer profile. Always respond in clean, valid JSON with no extra \
commentary."
        .to_string();

    let user = format!(
        "## Freelancer Profile\n{profile}\n\n\
## Job Post\n\
- Title: {title}\n\
- Description: {description}\n\
- Experience Level Required: {experience}\n\
- Fixed Price: {fixed}\n\
- Duration: {duration}\n\n\
## Instructions\n\
Evaluate how well the job post fits the freelancer profile and respond in valid \
JSON with exactly these keys:\n\
- match_level: a float between 0.0 and 1.0 for the compatibility score\n\
- apply: true or false\n\
- reason: a short explanation of the decision\n\n\
## JSON Format\n\
{{\n  \"match_level\": float,\n  \"apply\": boolean,\n  \"reason\": string\n}}\n",
        profile = FREELANCER_PROFILE,
        title = posting.title,
        description = posting.description.as_deref().unwrap_or_default(),
        experience = label(&posting.experience_level),
        fixed = if posting.is_fixed_price { "yes" } else { "no" },
        duration = label(&posting.duration_label),
    );
    (system, user)
}

fn opening_hook(posting: &RawPosting) -> &'static str {
    let mut hasher = DefaultHasher::new();
    posting.id.hash(&mut hasher);
    OPENING_HOOKS[(hasher.finish() % OPENING_HOOKS.len() as u64) as usize]
}

fn build_letter_prompt(posting: &RawPosting) -> (String, String) {
    let system = "You are a professional freelancer who writes personalized, \
convincing marketplace cover letters."
        .to_string();

    let user = format!(
        "Generate a customized cover letter for the following job opportunity.\n\n\
---\n\
**Job Title:** {title}\n\
**Job Description:** {description}\n\
**Experience Level Required:** {experience}\n\
**Fixed Price:** {fixed}\n\
**Duration:** {duration}\n\
---\n\n\
**Profile Information:**\n{profile}\n\n\
**Instructions:**\n\
1. Open with these two attention-grabbing sentences, verbatim:\n\"{hook}\"\n\
2. Continue with one brief paragraph highlighting the most relevant experience \
for this job, specific rather than generic, with a confident and business-minded \
tone.\n\
3. End with a short call to action inviting the client to discuss further.\n\
4. Keep the whole letter around 150-180 words.\n",
        title = posting.title,
        description = posting.description.as_deref().unwrap_or_default(),
        experience = label(&posting.experience_level),
        fixed = if posting.is_fixed_price { "yes" } else { "no" },
        duration = label(&posting.duration_label),
        profile = FREELANCER_PROFILE,
        hook = opening_hook(posting),
    );
    (system, user)
}

/// The region between the first `{` and the last `}`, the model chatter
/// around it discarded.
fn extract_json_region(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&content[start..=end])
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    match_level: f64,
    #[serde(default)]
    apply: bool,
    #[serde(default)]
    reason: String,
}

/// Decode a scoring response into a [`Score`]. An undecodable payload
/// produces a diagnostic score rather than an error so the posting is never
/// re-evaluated in a loop.
pub fn score_from_response(model: &str, content: &str) -> Score {
    let verdict = extract_json_region(content)
        .and_then(|region| serde_json::from_str::<RawVerdict>(region).ok());
    match verdict {
        Some(verdict) => Score {
            match_level: Some(verdict.match_level.clamp(0.0, 1.0)),
            should_apply: Some(verdict.apply),
            reason: verdict.reason,
            scoring_model: model.to_string(),
        },
        None => Score {
            match_level: None,
            should_apply: None,
            reason: "invalid JSON in scoring response".to_string(),
            scoring_model: model.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalSummary {
    /// Raw rows not yet present in the staged stage.
    pub pending: usize,
    /// Rows appended to the staged stage this run.
    pub staged: usize,
}

/// Score every raw posting that has not reached the staged stage yet and
/// append the results as one batch.
///
/// Posting dates are resolved up front as validation; an unrecognized
/// "posted ... ago" string aborts the whole batch before any model call is
/// wasted on it.
pub async fn evaluate_pending(
    evaluator: &dyn Evaluator,
    raw: &RawStore,
    staged: &StagedStore,
) -> Result<EvalSummary> {
    let staged_ids = staged.distinct_ids()?;
    let pending = raw.scan_where(|posting| !staged_ids.contains(&posting.id))?;
    info!(pending = pending.len(), "evaluating pending postings");

    let mut enriched = Vec::with_capacity(pending.len());
    for (index, posting) in pending.iter().enumerate() {
        let posted_at = resolve_posted_at(
            posting.scraped_at,
            posting.posted_relative_text.as_deref().unwrap_or_default(),
        )?;
        debug!(job_id = %posting.id, %posted_at, "resolved posting date");

        let score = evaluator.score(posting).await;
        enriched.push(StagedPosting {
            posting: posting.clone(),
            score,
        });
        if index % 10 == 0 {
            info!(evaluated = index + 1, total = pending.len(), "scoring progress");
        }
    }

    if !enriched.is_empty() {
        staged.append(&enriched)?;
    }
    Ok(EvalSummary {
        pending: pending.len(),
        staged: enriched.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn raw(id: &str, posted: &str) -> RawPosting {
        RawPosting {
            id: id.to_string(),
            title: format!("Job {id}"),
            url: format!("https://www.upwork.com/jobs/~{id}/"),
            description: Some("build a scraping pipeline".to_string()),
            posted_relative_text: Some(posted.to_string()),
            type_level: Some("Hourly".to_string()),
            experience_level: Some("Expert".to_string()),
            is_fixed_price: false,
            duration_label: Some("1 to 3 months".to_string()),
            scraped_at: Utc::now(),
        }
    }

    struct CannedEvaluator;

    #[async_trait]
    impl Evaluator for CannedEvaluator {
        fn scoring_model(&self) -> &str {
            "canned"
        }

        async fn score(&self, _posting: &RawPosting) -> Score {
            Score {
                match_level: Some(0.9),
                should_apply: Some(true),
                reason: "fits".to_string(),
                scoring_model: "canned".to_string(),
            }
        }

        async fn cover_letter(&self, _posting: &RawPosting) -> Result<String, EvalError> {
            Ok("letter".to_string())
        }
    }

    #[test]
    fn json_region_survives_model_chatter() {
        let content = r#"Sure! {"match_level": 0.8, "apply": true, "reason": "fits"} Hope this helps!"#;
        let score = score_from_response("gpt-4o-mini", content);
        assert_eq!(score.match_level, Some(0.8));
        assert_eq!(score.should_apply, Some(true));
        assert_eq!(score.reason, "fits");
        assert_eq!(score.scoring_model, "gpt-4o-mini");
    }

    #[test]
    fn unbalanced_braces_degrade_to_diagnostic_score() {
        let score = score_from_response("gpt-4o-mini", r#"{"match_level": 0.8"#);
        assert_eq!(score.match_level, None);
        assert_eq!(score.should_apply, None);
        assert_eq!(score.reason, "invalid JSON in scoring response");
        assert_eq!(score.scoring_model, "gpt-4o-mini");

        let reversed = score_from_response("gpt-4o-mini", "} no json here {");
        assert_eq!(reversed.match_level, None);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let score = score_from_response("gpt-4o-mini", "{}");
        assert_eq!(score.match_level, Some(0.0));
        assert_eq!(score.should_apply, Some(false));
        assert_eq!(score.reason, "");
    }

    #[test]
    fn out_of_range_match_level_is_clamped() {
        let score = score_from_response(
            "gpt-4o-mini",
            r#"{"match_level": 1.7, "apply": true, "reason": "overshoot"}"#,
        );
        assert_eq!(score.match_level, Some(1.0));

        let negative = score_from_response(
            "gpt-4o-mini",
            r#"{"match_level": -0.3, "apply": false, "reason": "undershoot"}"#,
        );
        assert_eq!(negative.match_level, Some(0.0));
    }

    #[test]
    fn opening_hook_is_stable_per_posting() {
        let posting = raw("abc", "today");
        assert_eq!(opening_hook(&posting), opening_hook(&posting));
    }

    #[tokio::test]
    async fn pending_postings_advance_exactly_once() {
        let dir = tempdir().unwrap();
        let raw_store = RawStore::new(dir.path().join("raw"));
        let staged_store = StagedStore::new(dir.path().join("staged"));
        raw_store.append(&[raw("one", "today"), raw("two", "yesterday")]).unwrap();

        let first = evaluate_pending(&CannedEvaluator, &raw_store, &staged_store)
            .await
            .unwrap();
        assert_eq!(first.pending, 2);
        assert_eq!(first.staged, 2);

        let second = evaluate_pending(&CannedEvaluator, &raw_store, &staged_store)
            .await
            .unwrap();
        assert_eq!(second.pending, 0);
        assert_eq!(second.staged, 0);
        assert_eq!(staged_store.scan().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unrecognized_posted_text_aborts_the_batch() {
        let dir = tempdir().unwrap();
        let raw_store = RawStore::new(dir.path().join("raw"));
        let staged_store = StagedStore::new(dir.path().join("staged"));
        raw_store
            .append(&[raw("bad", "posted 2 fortnights ago"), raw("good", "today")])
            .unwrap();

        let result = evaluate_pending(&CannedEvaluator, &raw_store, &staged_store).await;
        assert!(result.is_err());
        assert!(staged_store.scan().unwrap().is_empty());
    }
}

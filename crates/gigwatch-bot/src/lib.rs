//! Operator-facing chat surface: the gateway contract the dispatcher talks
//! to, its Discord REST implementation, and the interaction webhook endpoint
//! that turns button presses and slash commands into operator events.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use ed25519_dalek::{Signature, VerifyingKey};
use gigwatch_core::{OperatorAction, OperatorCommand, OperatorEvent, StagedPosting};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "gigwatch-bot";

const DISCORD_API: &str = "https://discord.com/api/v10";

/// Embed limits imposed by the chat service.
const DESCRIPTION_MAX: usize = 4096;
const FIELD_VALUE_MAX: usize = 1024;
const MESSAGE_CONTENT_MAX: usize = 2000;

const PENDING_COLOR: u32 = 0xF1C40F;
const APPLIED_COLOR: u32 = 0x2ECC71;
const SKIPPED_COLOR: u32 = 0xE74C3C;

/// Thread auto-archive window in minutes (7 days, the maximum).
const THREAD_AUTO_ARCHIVE_MINUTES: u32 = 10080;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("chat request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat service returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected chat service payload: {0}")]
    Payload(String),
}

/// Handle to a message the gateway created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub id: String,
}

/// Terminal outcome of a dispatched job card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardOutcome {
    Applied,
    Skipped,
}

fn truncate_chars(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        value.chars().take(max).collect()
    }
}

/// Renderable notification for one approved posting. Built once from the
/// staged row with the chat service's length caps already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCard {
    pub job_id: String,
    pub title: String,
    pub url: String,
    pub description: String,
    pub experience_level: String,
    pub duration_label: String,
    pub is_fixed_price: bool,
    pub match_level: Option<f64>,
    pub reason: String,
}

impl JobCard {
    pub fn from_staged(staged: &StagedPosting) -> Self {
        Self {
            job_id: staged.posting.id.clone(),
            title: staged.posting.title.clone(),
            url: staged.posting.url.clone(),
            description: truncate_chars(
                staged.posting.description.as_deref().unwrap_or_default(),
                DESCRIPTION_MAX,
            ),
            experience_level: staged
                .posting
                .experience_level
                .clone()
                .unwrap_or_else(|| "not specified".to_string()),
            duration_label: staged
                .posting
                .duration_label
                .clone()
                .unwrap_or_else(|| "not specified".to_string()),
            is_fixed_price: staged.posting.is_fixed_price,
            match_level: staged.score.match_level,
            reason: truncate_chars(&staged.score.reason, FIELD_VALUE_MAX),
        }
    }
}

fn card_embed(card: &JobCard) -> Value {
    let match_level = card
        .match_level
        .map(|level| format!("{level:.2}"))
        .unwrap_or_else(|| "n/a".to_string());
    json!({
        "title": card.title,
        "description": card.description,
        "url": card.url,
        "color": PENDING_COLOR,
        "fields": [
            { "name": "Job ID", "value": card.job_id, "inline": true },
            { "name": "Experience Level", "value": card.experience_level, "inline": true },
            { "name": "Duration", "value": card.duration_label, "inline": true },
            { "name": "Fixed Price?", "value": if card.is_fixed_price { "✅" } else { "❌" }, "inline": true },
            { "name": "Match Level", "value": match_level, "inline": true },
            { "name": "Reason", "value": card.reason, "inline": false },
        ],
    })
}

fn pending_components() -> Value {
    json!([{
        "type": 1,
        "components": [
            { "type": 2, "style": 2, "label": "Apply", "custom_id": "apply", "emoji": { "name": "😎" } },
            { "type": 2, "style": 2, "label": "Skip", "custom_id": "skip", "emoji": { "name": "❌" } },
        ],
    }])
}

fn finalized_components(outcome: CardOutcome) -> Value {
    let (apply, skip) = match outcome {
        CardOutcome::Applied => (
            json!({ "type": 2, "style": 3, "label": "Applied", "custom_id": "apply", "emoji": { "name": "✅" }, "disabled": true }),
            json!({ "type": 2, "style": 2, "label": "Skip", "custom_id": "skip", "emoji": { "name": "❌" }, "disabled": true }),
        ),
        CardOutcome::Skipped => (
            json!({ "type": 2, "style": 2, "label": "Apply", "custom_id": "apply", "emoji": { "name": "😎" }, "disabled": true }),
            json!({ "type": 2, "style": 4, "label": "Skipped", "custom_id": "skip", "emoji": { "name": "🙅" }, "disabled": true }),
        ),
    };
    json!([{ "type": 1, "components": [apply, skip] }])
}

fn outcome_banner(outcome: CardOutcome) -> (&'static str, u32) {
    match outcome {
        CardOutcome::Applied => ("Application sent — the cover letter is in the thread.", APPLIED_COLOR),
        CardOutcome::Skipped => ("You skipped this posting.", SKIPPED_COLOR),
    }
}

/// Everything the dispatcher and the card flow need from the chat service.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Plain progress line in the operator channel.
    async fn post_text(&self, content: &str) -> Result<(), GatewayError>;

    /// Job card with Apply/Skip actions; returns the created message.
    async fn post_job_card(&self, card: &JobCard) -> Result<MessageRef, GatewayError>;

    /// Repaint a card into its terminal state and disable both actions.
    async fn finalize_card(
        &self,
        message: &MessageRef,
        outcome: CardOutcome,
    ) -> Result<(), GatewayError>;

    /// Open a thread on a card message and post `content` into it.
    async fn start_reply_thread(
        &self,
        message: &MessageRef,
        name: &str,
        content: &str,
    ) -> Result<(), GatewayError>;

    /// Delete the channel history; returns how many messages went away.
    async fn purge_channel(&self) -> Result<usize, GatewayError>;
}

/// REST implementation of [`ChatGateway`] against the Discord v10 API.
/// Inbound traffic (buttons, slash commands) arrives separately through the
/// interaction endpoint; this client only ever pushes.
#[derive(Debug, Clone)]
pub struct DiscordGateway {
    http: reqwest::Client,
    token: String,
    application_id: String,
    guild_id: String,
    channel_id: String,
}

impl DiscordGateway {
    pub fn new(
        token: String,
        application_id: String,
        guild_id: String,
        channel_id: String,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building chat http client")?;
        Ok(Self {
            http,
            token,
            application_id,
            guild_id,
            channel_id,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, GatewayError> {
        let resp = request
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(resp.json().await?)
    }

    async fn get_message(&self, message_id: &str) -> Result<Value, GatewayError> {
        let url = format!(
            "{DISCORD_API}/channels/{}/messages/{message_id}",
            self.channel_id
        );
        self.send(self.http.get(url)).await
    }

    /// Register the guild-scoped operator commands. Overwrites the previous
    /// set, so it is safe to call on every startup.
    pub async fn register_commands(&self) -> Result<(), GatewayError> {
        let url = format!(
            "{DISCORD_API}/applications/{}/guilds/{}/commands",
            self.application_id, self.guild_id
        );
        let commands = json!([
            {
                "name": "run",
                "type": 1,
                "description": "Run one scrape/score/notify cycle now",
            },
            {
                "name": "resend",
                "type": 1,
                "description": "Re-announce the most recent postings",
                "options": [{
                    "type": 4,
                    "name": "last",
                    "description": "How many recent postings to re-announce",
                    "required": false,
                }],
            },
            {
                "name": "purge",
                "type": 1,
                "description": "Delete the channel history",
            },
        ]);
        self.send(self.http.put(url).json(&commands)).await?;
        info!("registered operator commands");
        Ok(())
    }
}

#[async_trait]
impl ChatGateway for DiscordGateway {
    async fn post_text(&self, content: &str) -> Result<(), GatewayError> {
        let url = format!("{DISCORD_API}/channels/{}/messages", self.channel_id);
        let body = json!({ "content": truncate_chars(content, MESSAGE_CONTENT_MAX) });
        self.send(self.http.post(url).json(&body)).await?;
        Ok(())
    }

    async fn post_job_card(&self, card: &JobCard) -> Result<MessageRef, GatewayError> {
        let url = format!("{DISCORD_API}/channels/{}/messages", self.channel_id);
        let body = json!({
            "embeds": [card_embed(card)],
            "components": pending_components(),
        });
        let created = self.send(self.http.post(url).json(&body)).await?;
        let id = created["id"]
            .as_str()
            .ok_or_else(|| GatewayError::Payload("created message has no id".to_string()))?;
        Ok(MessageRef { id: id.to_string() })
    }

    async fn finalize_card(
        &self,
        message: &MessageRef,
        outcome: CardOutcome,
    ) -> Result<(), GatewayError> {
        let mut existing = self.get_message(&message.id).await?;
        let embeds = existing
            .get_mut("embeds")
            .map(Value::take)
            .unwrap_or(Value::Null);
        let mut embeds = match embeds {
            Value::Array(embeds) if !embeds.is_empty() => embeds,
            _ => {
                return Err(GatewayError::Payload(format!(
                    "message {} has no embeds to finalize",
                    message.id
                )))
            }
        };
        let (banner, color) = outcome_banner(outcome);
        embeds[0]["description"] = Value::String(banner.to_string());
        embeds[0]["color"] = json!(color);

        let url = format!(
            "{DISCORD_API}/channels/{}/messages/{}",
            self.channel_id, message.id
        );
        let body = json!({
            "embeds": embeds,
            "components": finalized_components(outcome),
        });
        self.send(self.http.patch(url).json(&body)).await?;
        Ok(())
    }

    async fn start_reply_thread(
        &self,
        message: &MessageRef,
        name: &str,
        content: &str,
    ) -> Result<(), GatewayError> {
        let thread_url = format!(
            "{DISCORD_API}/channels/{}/messages/{}/threads",
            self.channel_id, message.id
        );
        let thread = self
            .send(self.http.post(thread_url).json(&json!({
                "name": name,
                "auto_archive_duration": THREAD_AUTO_ARCHIVE_MINUTES,
            })))
            .await?;
        let thread_id = thread["id"]
            .as_str()
            .ok_or_else(|| GatewayError::Payload("created thread has no id".to_string()))?;

        let message_url = format!("{DISCORD_API}/channels/{thread_id}/messages");
        let body = json!({ "content": truncate_chars(content, MESSAGE_CONTENT_MAX) });
        self.send(self.http.post(message_url).json(&body)).await?;
        Ok(())
    }

    async fn purge_channel(&self) -> Result<usize, GatewayError> {
        let mut deleted = 0usize;
        // one-by-one deletion, capped at ten pages of history
        for _ in 0..10 {
            let url = format!(
                "{DISCORD_API}/channels/{}/messages?limit=100",
                self.channel_id
            );
            let page = self.send(self.http.get(url)).await?;
            let Some(messages) = page.as_array() else {
                return Err(GatewayError::Payload(
                    "channel history is not an array".to_string(),
                ));
            };
            if messages.is_empty() {
                break;
            }
            for entry in messages {
                let Some(id) = entry["id"].as_str() else {
                    continue;
                };
                let url = format!(
                    "{DISCORD_API}/channels/{}/messages/{id}",
                    self.channel_id
                );
                self.send(self.http.delete(url)).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Verifies the Ed25519 signature Discord attaches to every interaction
/// callback.
#[derive(Debug)]
pub struct InteractionVerifier {
    key: VerifyingKey,
}

impl InteractionVerifier {
    pub fn from_hex(public_key_hex: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(public_key_hex).context("decoding interaction public key")?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .ok()
            .context("interaction public key must be 32 bytes")?;
        let key = VerifyingKey::from_bytes(&bytes).context("invalid ed25519 public key")?;
        Ok(Self { key })
    }

    pub fn verify(&self, timestamp: &str, body: &[u8], signature_hex: &str) -> bool {
        let Ok(signature_bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(signature_bytes) = <[u8; 64]>::try_from(signature_bytes.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&signature_bytes);
        let mut message = timestamp.as_bytes().to_vec();
        message.extend_from_slice(body);
        self.key.verify_strict(&message, &signature).is_ok()
    }
}

#[derive(Clone)]
pub struct InteractionState {
    pub verifier: Arc<InteractionVerifier>,
    pub events: mpsc::Sender<OperatorEvent>,
}

pub fn interactions_router(state: InteractionState) -> Router {
    Router::new()
        .route("/interactions", post(handle_interaction))
        .with_state(state)
}

/// Bind and serve the interaction endpoint until `shutdown` resolves.
pub async fn serve_interactions(
    addr: String,
    state: InteractionState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding interaction endpoint on {addr}"))?;
    info!(%addr, "interaction endpoint listening");
    axum::serve(listener, interactions_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving interaction endpoint")
}

async fn handle_interaction(
    State(state): State<InteractionState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("x-signature-ed25519")
        .and_then(|value| value.to_str().ok());
    let timestamp = headers
        .get("x-signature-timestamp")
        .and_then(|value| value.to_str().ok());
    let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
        return (StatusCode::UNAUTHORIZED, "missing signature headers").into_response();
    };
    if !state.verifier.verify(timestamp, &body, signature) {
        return (StatusCode::UNAUTHORIZED, "invalid request signature").into_response();
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match payload["type"].as_u64() {
        // ping
        Some(1) => Json(json!({ "type": 1 })).into_response(),
        // slash command
        Some(2) => {
            let name = payload["data"]["name"].as_str().unwrap_or_default();
            let (command, ack) = match name {
                "run" => (OperatorCommand::Run, "🚀 Running a pipeline cycle...".to_string()),
                "resend" => {
                    let last = payload["data"]["options"]
                        .as_array()
                        .and_then(|options| options.first())
                        .and_then(|option| option["value"].as_u64())
                        .unwrap_or(10) as u32;
                    (
                        OperatorCommand::Resend { last },
                        format!("🔁 Re-announcing the last {last} postings..."),
                    )
                }
                "purge" => (OperatorCommand::Purge, "🧹 Deleting channel history...".to_string()),
                other => {
                    warn!(command = other, "unknown operator command");
                    return StatusCode::BAD_REQUEST.into_response();
                }
            };
            forward_event(&state, OperatorEvent::Command(command)).await;
            Json(json!({ "type": 4, "data": { "content": ack, "flags": 64 } })).into_response()
        }
        // message component press
        Some(3) => {
            let action = match payload["data"]["custom_id"].as_str() {
                Some("apply") => OperatorAction::Apply,
                Some("skip") => OperatorAction::Skip,
                _ => return StatusCode::BAD_REQUEST.into_response(),
            };
            let Some(message_id) = payload["message"]["id"].as_str() else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            forward_event(
                &state,
                OperatorEvent::Card {
                    message_id: message_id.to_string(),
                    action,
                },
            )
            .await;
            // deferred update; the event service repaints the card
            Json(json!({ "type": 6 })).into_response()
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn forward_event(state: &InteractionState, event: OperatorEvent) {
    if state.events.send(event).await.is_err() {
        warn!("operator event channel closed, dropping event");
    }
}

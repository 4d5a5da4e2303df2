//! The five operations this core exposes to an external HTTP/RPC adapter
//! (SPEC_FULL.md §6): create session, send message, status, reconnect,
//! abort. Everything an adapter needs — auth, routing, CORS, the access-code
//! flow — stays out of this crate; this module is the thin seam where the
//! adapter's validated `(user_id, session_id)` meets the registry and
//! orchestrator.
//!
//! Grounded on squall's `tools/review.rs` top-level tool functions, which
//! play the same role there: validate inputs, consult the registry/executor,
//! and return a structured outcome rather than a raw panic or bare string.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::CouncilError;
use crate::model::{Event, Mode, Stage};
use crate::orchestrator::Orchestrator;
use crate::registry::{ChannelSubscriber, ProcessingRegistry, SubscriptionHandle};
use crate::session::SessionStore;
use crate::transport;

const MAX_CONTENT_CHARS: usize = 4000;
const SUBSCRIBER_BUFFER: usize = 256;

/// A `sessionId` path parameter must be a UUID-v4 before it ever reaches the
/// registry or a persistence lookup.
pub fn validate_session_id(session_id: &str) -> Result<(), CouncilError> {
    match Uuid::parse_str(session_id) {
        Ok(uuid) if uuid.get_version_num() == 4 => Ok(()),
        _ => Err(CouncilError::Validation("session id must be a UUID v4".to_string())),
    }
}

/// Message content must be non-empty and at most 4000 characters (counted in
/// `char`s, not bytes, so multi-byte text isn't penalized for its encoding).
pub fn validate_content(content: &str) -> Result<(), CouncilError> {
    if content.is_empty() {
        return Err(CouncilError::Validation("content must not be empty".to_string()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(CouncilError::Validation(format!("content exceeds {MAX_CONTENT_CHARS} characters")));
    }
    Ok(())
}

pub struct CreatedSession {
    pub session_id: String,
    pub title: String,
    pub created_at: u64,
}

/// Operation 1: create session. Rejected with [`CouncilError::SessionLimitReached`]
/// once the user already owns `config.max_sessions_per_user` sessions.
pub async fn create_session<S: SessionStore>(
    store: &S,
    config: &Config,
    user_id: &str,
) -> Result<CreatedSession, CouncilError> {
    if store.count_for_user(user_id).await? >= config.max_sessions_per_user {
        return Err(CouncilError::SessionLimitReached);
    }
    let session = store.create(user_id).await?;
    Ok(CreatedSession { session_id: session.session_id, title: session.title, created_at: session.created_at })
}

/// Operation 2: send message. Validates content and resolves the default
/// mode, then checks — in order — whether the upstream gateway credential
/// and the requested mode are configured, whether the registry is at
/// capacity, and whether this `(user_id, session_id)` is already processing.
/// None of these checks mutate the registry; only a fully-accepted send
/// calls `register`. On success, spawns the orchestrator and stream-transport
/// tasks and returns the subscriber's event receiver plus the handle needed
/// to `remove_client` on disconnect.
#[allow(clippy::too_many_arguments)]
pub async fn send_message<S: SessionStore + 'static>(
    registry: &Arc<ProcessingRegistry>,
    orchestrator: &Arc<Orchestrator<S>>,
    config: &Config,
    user_id: &str,
    session_id: &str,
    content: String,
    mode: Option<Mode>,
    title_callback: Option<Box<dyn FnOnce(String) + Send>>,
) -> Result<(mpsc::Receiver<Event>, SubscriptionHandle), CouncilError> {
    validate_session_id(session_id)?;
    validate_content(&content)?;
    let mode = mode.unwrap_or_default();

    if config.gateway_api_key.is_empty() {
        return Err(CouncilError::UnconfiguredUpstream);
    }
    if !config.modes.contains_key(&mode) {
        return Err(CouncilError::ModeUnconfigured(mode));
    }
    if registry.is_at_capacity().await {
        return Err(CouncilError::AtCapacity { active: registry.active_count().await, max: config.max_concurrent_processing });
    }
    if registry.is_processing(user_id, session_id).await {
        return Err(CouncilError::AlreadyProcessing(session_id.to_string()));
    }

    let cancel = CancellationToken::new();
    let generation = registry.register(user_id, session_id, content.clone(), mode, cancel.clone()).await;
    let (rx, handle) = transport::subscribe(registry, user_id, session_id, SUBSCRIBER_BUFFER)
        .await
        .expect("record was just registered under the lock above");

    let events = orchestrator.process_council_message(
        user_id.to_string(),
        session_id.to_string(),
        content,
        mode,
        cancel,
        title_callback,
    );
    tokio::spawn(transport::drive(
        Arc::clone(registry),
        user_id.to_string(),
        session_id.to_string(),
        generation,
        events,
        config.heartbeat_interval,
    ));

    Ok((rx, handle))
}

pub struct PartialResults {
    pub stage1_count: usize,
    pub stage2_count: usize,
    pub has_stage3: bool,
}

pub struct Status {
    pub is_processing: bool,
    pub can_reconnect: bool,
    pub current_stage: Option<Stage>,
    pub started_at: Option<u64>,
    pub partial_results: PartialResults,
}

/// Operation 3: status.
pub async fn status(registry: &ProcessingRegistry, user_id: &str, session_id: &str) -> Status {
    match registry.get_snapshot(user_id, session_id).await {
        Some(snapshot) => Status {
            is_processing: true,
            can_reconnect: true,
            current_stage: snapshot.current_stage,
            started_at: Some(snapshot.started_at),
            partial_results: PartialResults {
                stage1_count: snapshot.stage1_count,
                stage2_count: snapshot.stage2_count,
                has_stage3: snapshot.has_stage3,
            },
        },
        None => Status {
            is_processing: false,
            can_reconnect: false,
            current_stage: None,
            started_at: None,
            partial_results: PartialResults { stage1_count: 0, stage2_count: 0, has_stage3: false },
        },
    }
}

/// Operation 4: reconnect. Builds the §4.6 replay sequence, delivers it into
/// a fresh subscriber channel ahead of any live events, then attaches that
/// subscriber so it keeps receiving the live stream. Returns `None`
/// (adapter surfaces 404) when no active processing exists for this key.
pub async fn reconnect(
    registry: &Arc<ProcessingRegistry>,
    user_id: &str,
    session_id: &str,
) -> Option<(mpsc::Receiver<Event>, SubscriptionHandle)> {
    let replay = transport::reconnect_replay(registry, user_id, session_id).await?;
    // Sized so every replay event is delivered via try_send without blocking
    // on a receiver that hasn't started reading yet.
    let capacity = SUBSCRIBER_BUFFER.max(replay.len() + 8);
    let (tx, rx) = mpsc::channel(capacity);
    for event in replay {
        let _ = tx.try_send(event);
    }
    let subscriber = Arc::new(ChannelSubscriber(tx));
    let handle = Arc::clone(registry).add_client(user_id, session_id, subscriber).await?;
    Some((rx, handle))
}

/// Operation 5: abort. Fires cooperative cancellation for the active job.
/// Returns [`CouncilError::NotProcessing`] (adapter surfaces 404) when there
/// is nothing to abort.
pub async fn abort(registry: &ProcessingRegistry, user_id: &str, session_id: &str) -> Result<(), CouncilError> {
    if !registry.is_processing(user_id, session_id).await {
        return Err(CouncilError::NotProcessing(session_id.to_string()));
    }
    registry.abort(user_id, session_id).await;
    Ok(())
}

//! Query → answer → speech.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prism_core::PlaybackController;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::answer::{AnswerRequest, AnswerService};
use crate::search::{format_hits, search_query, SearchService};
use crate::state::{Conversation, ConversationTurn, Sender};
use crate::vision::FrameSource;

const TURN_CHANNEL_CAP: usize = 64;
const SEARCH_RESULTS: usize = 5;

pub struct Assistant {
    playback: Arc<PlaybackController>,
    answers: Arc<dyn AnswerService>,
    search: Option<Arc<dyn SearchService>>,
    frames: Option<Arc<dyn FrameSource>>,
    camera: AtomicBool,
    history_turns: usize,
    conversation: Mutex<Conversation>,
    /// Serializes queries so turns never interleave.
    inflight: Mutex<()>,
    turns_tx: broadcast::Sender<ConversationTurn>,
}

impl Assistant {
    pub fn new(playback: Arc<PlaybackController>, answers: Arc<dyn AnswerService>) -> Self {
        let (turns_tx, _) = broadcast::channel(TURN_CHANNEL_CAP);
        Self {
            playback,
            answers,
            search: None,
            frames: None,
            camera: AtomicBool::new(false),
            history_turns: 10,
            conversation: Mutex::new(Conversation::new()),
            inflight: Mutex::new(()),
            turns_tx,
        }
    }

    pub fn with_search(mut self, search: Arc<dyn SearchService>) -> Self {
        self.search = Some(search);
        self
    }

    /// Attach a camera. It starts enabled.
    pub fn with_frames(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self.camera.store(true, Ordering::Release);
        self
    }

    pub fn with_history_turns(mut self, turns: usize) -> Self {
        self.history_turns = turns.max(1);
        self
    }

    pub fn subscribe_turns(&self) -> broadcast::Receiver<ConversationTurn> {
        self.turns_tx.subscribe()
    }

    /// Returns whether the camera is now on. Turning it on without a frame
    /// source leaves it off.
    pub fn set_camera(&self, enabled: bool) -> bool {
        let enabled = enabled && self.frames.is_some();
        self.camera.store(enabled, Ordering::Release);
        enabled
    }

    pub fn camera_enabled(&self) -> bool {
        self.camera.load(Ordering::Acquire)
    }

    pub fn camera_source(&self) -> Option<String> {
        self.frames.as_ref().map(|f| f.describe())
    }

    pub fn transcript(&self) -> Vec<ConversationTurn> {
        self.conversation.lock().turns().to_vec()
    }

    /// Answer `query` on a blocking worker.
    pub async fn submit(self: &Arc<Self>, query: String) -> Option<ConversationTurn> {
        let this = Arc::clone(self);
        match tokio::task::spawn_blocking(move || this.handle_query(&query)).await {
            Ok(turn) => turn,
            Err(e) => {
                error!("answer worker failed: {e}");
                None
            }
        }
    }

    /// Record the question, generate the answer and speak it. Blocks for the
    /// whole round trip. Returns the assistant turn.
    pub fn handle_query(&self, query: &str) -> Option<ConversationTurn> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        let _inflight = self.inflight.lock();

        let user_turn = ConversationTurn::new(Sender::User, query);
        let (history, search_for) = {
            let mut conversation = self.conversation.lock();
            let history = conversation.recent(self.history_turns).to_vec();
            let search_for = search_query(query, &conversation);
            conversation.push(user_turn.clone());
            (history, search_for)
        };
        let _ = self.turns_tx.send(user_turn);

        let frame = match (&self.frames, self.camera_enabled()) {
            (Some(frames), true) => match frames.capture() {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!("camera frame unavailable: {e:#}");
                    None
                }
            },
            _ => None,
        };

        let search_results = match (search_for, &self.search) {
            (Some(q), Some(search)) => match search.search(&q, SEARCH_RESULTS) {
                Ok(hits) => Some(format_hits(&hits)),
                Err(e) => {
                    warn!("web search failed: {e:#}");
                    None
                }
            },
            _ => None,
        };

        let request = AnswerRequest {
            query,
            history: &history,
            frame: frame.as_ref(),
            search_results: search_results.as_deref(),
        };
        let (text, speakable) = match self.answers.generate(&request) {
            Ok(answer) => (answer, true),
            Err(e) => {
                error!("answer failed: {e:#}");
                (format!("Error: {e}"), false)
            }
        };

        let turn = ConversationTurn::new(Sender::Assistant, text);
        self.conversation.lock().push(turn.clone());
        let _ = self.turns_tx.send(turn.clone());

        if speakable {
            match self.playback.speak(&turn.text) {
                Some(session) => info!(session, "speaking answer"),
                None => warn!("answer had nothing speakable"),
            }
        }
        Some(turn)
    }
}

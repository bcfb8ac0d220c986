//! Pipeline orchestration: drives ASR → LLM → TTS against the session
//! state machine.
//!
//! Each utterance runs as a spawned task holding a [`CancellationToken`].
//! Cancellation is cooperative: the task stops at the next await point and
//! does no further socket sends; the canceler emits `tts_cancel` on its
//! behalf and resets the state machine. All LLM+TTS emission happens under
//! the session's pipeline lock so pushes and pipelines never interleave
//! frames on one socket.

use crate::emotion::{self, Mood};
use crate::error::Result;
use crate::pipeline::asr::{self, SpeechRecognizer};
use crate::pipeline::llm::{self, ChatModel, TokenStream};
use crate::pipeline::tts::TtsRouter;
use crate::protocol::ServerMessage;
use crate::segment::SentenceSegmenter;
use crate::sensor::SensorEngine;
use crate::session::{PipelineHandle, PipelineState, Session};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// One-shot prompt for the shake-triggered random fact push.
const RANDOM_FACT_PROMPT: &str = "请用一句话分享一个随机的有趣冷知识，轻松有趣一点。";

/// How long a random-fact push waits for the pipeline lock before giving up.
const FACT_LOCK_WAIT: Duration = Duration::from_millis(500);

/// How one pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnEnd {
    Completed,
    Cancelled,
}

/// What a streamed LLM reply produced.
struct ReplyOutcome {
    full_text: String,
    spoke: bool,
}

/// Drives the response pipeline for every session.
pub struct Orchestrator {
    asr: Arc<dyn SpeechRecognizer>,
    llm: Arc<dyn ChatModel>,
    tts: Arc<TtsRouter>,
    sensor: Arc<SensorEngine>,
    vad_threshold: f32,
    max_history_turns: usize,
}

impl Orchestrator {
    /// Wire the orchestrator to its collaborators.
    pub fn new(
        asr: Arc<dyn SpeechRecognizer>,
        llm: Arc<dyn ChatModel>,
        tts: Arc<TtsRouter>,
        sensor: Arc<SensorEngine>,
        vad_threshold: f32,
        max_history_turns: usize,
    ) -> Self {
        Self {
            asr,
            llm,
            tts,
            sensor,
            vad_threshold,
            max_history_turns,
        }
    }

    /// Handle `audio_start`: interrupt any active reply, then record.
    ///
    /// If a reply was interrupted while SPEAKING, the canceled pipeline's
    /// `tts_cancel` has already been emitted by [`Self::cancel_pipeline`].
    ///
    /// # Errors
    ///
    /// Returns an error if the post-cancel transition to RECORDING fails.
    pub async fn on_audio_start(&self, session: &Arc<Session>) -> Result<()> {
        self.cancel_pipeline(session).await;
        session.clear_audio();
        session.transition(PipelineState::Recording)
    }

    /// Handle `audio_end`: start the pipeline for the buffered utterance.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::WallaceError::InvalidTransition`] when the
    /// session is not RECORDING.
    pub fn on_audio_end(self: &Arc<Self>, session: &Arc<Session>) -> Result<()> {
        session.transition(PipelineState::Processing)?;

        let orchestrator = Arc::clone(self);
        let session_task = Arc::clone(session);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            orchestrator.run_pipeline(session_task, task_cancel).await;
        });
        session.install_pipeline(PipelineHandle { cancel, task });
        Ok(())
    }

    /// Cancel the running pipeline (and random-fact push) and await their
    /// completion. Emits `tts_cancel` when the session was SPEAKING at the
    /// moment of cancellation. Idempotent; a no-op on an idle session.
    pub async fn cancel_pipeline(&self, session: &Arc<Session>) {
        let was_speaking = session.state() == PipelineState::Speaking;
        let handles = [session.take_pipeline(), session.take_fact_task()];

        let mut cancelled_live_task = false;
        for handle in handles.into_iter().flatten() {
            if !handle.task.is_finished() {
                cancelled_live_task = true;
            }
            handle.cancel.cancel();
            let _ = handle.task.await;
        }

        if was_speaking {
            let _ = session.send(&ServerMessage::TtsCancel);
        }
        if cancelled_live_task || was_speaking {
            info!(user_id = session.user_id(), "pipeline cancelled");
        }
        session.force_idle();
    }

    /// Spawn the shake-triggered random fact push, retaining its handle.
    pub fn spawn_random_fact(self: &Arc<Self>, session: &Arc<Session>) {
        let orchestrator = Arc::clone(self);
        let session_task = Arc::clone(session);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            orchestrator.run_random_fact(session_task, task_cancel).await;
        });
        session.install_fact_task(PipelineHandle { cancel, task });
    }

    async fn run_pipeline(&self, session: Arc<Session>, cancel: CancellationToken) {
        match self.drive_turn(&session, &cancel).await {
            Ok(TurnEnd::Completed) => {}
            Ok(TurnEnd::Cancelled) => {
                // The canceler owns state recovery and the tts_cancel frame.
            }
            Err(e) => {
                error!(user_id = session.user_id(), "pipeline error: {e}");
                session.force_idle();
            }
        }
    }

    /// The full turn: VAD → ASR → LLM → sentence-segmented TTS.
    async fn drive_turn(
        &self,
        session: &Arc<Session>,
        cancel: &CancellationToken,
    ) -> Result<TurnEnd> {
        let samples = session.take_audio();

        if !asr::has_speech(&samples, self.vad_threshold) {
            session.transition(PipelineState::Idle)?;
            return Ok(TurnEnd::Completed);
        }

        let text = tokio::select! {
            () = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
            result = self.asr.transcribe(&samples) => result?,
        };
        if text.is_empty() {
            session.transition(PipelineState::Idle)?;
            return Ok(TurnEnd::Completed);
        }

        // Listen-only mode: transcribe, log, stay silent.
        if session.treehouse_mode() {
            info!(user_id = session.user_id(), "[treehouse] {text}");
            session.transition(PipelineState::Idle)?;
            return Ok(TurnEnd::Completed);
        }

        // No frames may hit the socket until the emission lock is ours.
        let _guard = tokio::select! {
            () = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
            guard = session.pipeline_lock().lock() => guard,
        };

        let sensor_context = self.sensor.context(session);
        let messages = llm::build_messages(
            session.personality(),
            &session.memory(),
            &sensor_context,
            &session.history_window(self.max_history_turns),
            &text,
        );

        let stream = tokio::select! {
            () = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
            result = self.llm.chat_stream(messages) => result?,
        };

        session.transition(PipelineState::Speaking)?;

        let Some(reply) = self
            .stream_reply(session, cancel, stream, Mood::Thinking)
            .await?
        else {
            return Ok(TurnEnd::Cancelled);
        };

        let (mood, cleaned) = emotion::extract(&reply.full_text);
        session.send(&ServerMessage::Text {
            content: cleaned.clone(),
            partial: false,
            mood: Some(mood.as_str().to_owned()),
        })?;
        if reply.spoke {
            session.send(&ServerMessage::TtsEnd)?;
        }

        session.push_turn(text, cleaned);
        session.transition(PipelineState::Idle)?;

        self.sync_memory_after_turn(session).await;
        Ok(TurnEnd::Completed)
    }

    /// Consume the token stream, synthesizing each completed sentence.
    ///
    /// Returns `None` when cancelled mid-stream.
    async fn stream_reply(
        &self,
        session: &Arc<Session>,
        cancel: &CancellationToken,
        mut stream: TokenStream,
        start_mood: Mood,
    ) -> Result<Option<ReplyOutcome>> {
        let mut segmenter = SentenceSegmenter::new();
        let mut full_text = String::new();
        let mut spoke = false;

        loop {
            let token = tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                token = stream.next() => token,
            };
            let Some(token) = token else {
                break;
            };
            let token = token?;
            full_text.push_str(&token);
            for sentence in segmenter.push(&token) {
                if self
                    .speak_sentence(session, cancel, &sentence, start_mood, &mut spoke)
                    .await?
                    == TurnEnd::Cancelled
                {
                    return Ok(None);
                }
            }
        }

        if let Some(rest) = segmenter.flush()
            && self
                .speak_sentence(session, cancel, &rest, start_mood, &mut spoke)
                .await?
                == TurnEnd::Cancelled
        {
            return Ok(None);
        }

        Ok(Some(ReplyOutcome { full_text, spoke }))
    }

    /// Synthesize one sentence and stream its frames to the device.
    ///
    /// The first spoken sentence emits `tts_start` with `start_mood`.
    /// Mood tags are stripped before synthesis; a sentence that is empty
    /// after stripping is skipped entirely.
    async fn speak_sentence(
        &self,
        session: &Arc<Session>,
        cancel: &CancellationToken,
        sentence: &str,
        start_mood: Mood,
        spoke: &mut bool,
    ) -> Result<TurnEnd> {
        let speakable = emotion::strip(sentence);
        if speakable.is_empty() {
            return Ok(TurnEnd::Completed);
        }

        if !*spoke {
            session.send(&ServerMessage::TtsStart {
                mood: start_mood.as_str().to_owned(),
            })?;
            *spoke = true;
        }

        let mut frames = self.tts.synthesize(&speakable, session.tts_backend());
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
                frame = frames.next() => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            session.send_frame(frame)?;
        }
        Ok(TurnEnd::Completed)
    }

    async fn run_random_fact(&self, session: Arc<Session>, cancel: CancellationToken) {
        // Contend briefly; an active pipeline or push wins.
        let Ok(_guard) =
            tokio::time::timeout(FACT_LOCK_WAIT, session.pipeline_lock().lock()).await
        else {
            return;
        };
        if session.state() != PipelineState::Idle {
            return;
        }

        match self.drive_random_fact(&session, &cancel).await {
            Ok(TurnEnd::Completed) => {}
            Ok(TurnEnd::Cancelled) => {}
            Err(e) => {
                error!(user_id = session.user_id(), "random fact push error: {e}");
                session.force_idle();
            }
        }
    }

    /// Degenerate pipeline for the shake event: no ASR, no history update.
    async fn drive_random_fact(
        &self,
        session: &Arc<Session>,
        cancel: &CancellationToken,
    ) -> Result<TurnEnd> {
        session.transition(PipelineState::Recording)?;
        session.transition(PipelineState::Processing)?;

        let messages = llm::build_messages(
            session.personality(),
            &session.memory(),
            "",
            &[],
            RANDOM_FACT_PROMPT,
        );
        let stream = tokio::select! {
            () = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
            result = self.llm.chat_stream(messages) => result?,
        };

        session.transition(PipelineState::Speaking)?;

        let Some(reply) = self
            .stream_reply(session, cancel, stream, Mood::Surprised)
            .await?
        else {
            return Ok(TurnEnd::Cancelled);
        };

        let (mood, cleaned) = emotion::extract(&reply.full_text);
        session.send(&ServerMessage::Text {
            content: cleaned,
            partial: false,
            mood: Some(mood.as_str().to_owned()),
        })?;
        if reply.spoke {
            session.send(&ServerMessage::TtsEnd)?;
        }

        session.transition(PipelineState::Idle)?;
        Ok(TurnEnd::Completed)
    }

    /// Bump the interaction counter and flush memory when the throttle
    /// window has elapsed and the profile actually changed.
    async fn sync_memory_after_turn(&self, session: &Arc<Session>) {
        session.with_memory_mut(|memory| memory.interaction_count += 1);

        let Some(store) = session.memory_store() else {
            return;
        };
        let memory = session.memory();
        if !store.should_sync() || !store.has_changes(&memory) {
            return;
        }

        match store.save_async(memory.clone()).await {
            Ok(()) => {
                store.mark_synced(&memory);
                if let Ok(data) = serde_json::to_value(&memory) {
                    let _ = session.send(&ServerMessage::MemorySync { data });
                }
            }
            Err(e) => {
                // In-memory state stays authoritative until the next attempt.
                error!(user_id = session.user_id(), "memory sync failed: {e}");
            }
        }
    }
}

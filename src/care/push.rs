//! Server-initiated care pushes.
//!
//! A push generates a short LLM reply for a prompt and sends
//! `care{content, mood}` followed by PCM frames — but only when it is safe:
//! the user must be present, and the session's pipeline lock must be
//! acquired within the push timeout so a push never talks over an active
//! reply.

use crate::emotion::Mood;
use crate::error::Result;
use crate::pipeline::llm::{ChatMessage, ChatModel};
use crate::pipeline::tts::TtsRouter;
use crate::protocol::ServerMessage;
use crate::session::{Session, SessionRegistry};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Compact system prompt for care generation.
const CARE_SYSTEM_PROMPT: &str = "你是 Wallace，生成一句简短的关怀语句。";

/// Generates and delivers care pushes across the registry.
pub struct PushCoordinator {
    llm: Arc<dyn ChatModel>,
    tts: Arc<TtsRouter>,
    registry: Arc<SessionRegistry>,
    push_timeout: Duration,
}

impl PushCoordinator {
    /// Wire the coordinator to its collaborators.
    ///
    /// The registry handle is read-only here: the coordinator iterates
    /// sessions but never inserts or removes them.
    pub fn new(
        llm: Arc<dyn ChatModel>,
        tts: Arc<TtsRouter>,
        registry: Arc<SessionRegistry>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            tts,
            registry,
            push_timeout,
        }
    }

    /// Push to every active session, isolating per-session failures.
    pub async fn push_all(&self, prompt: &str, mood: Mood) {
        for session in self.registry.sessions() {
            if let Err(e) = self.push_to_session(&session, prompt, mood).await {
                error!(user_id = session.user_id(), "care push failed: {e}");
            }
        }
    }

    /// Push to one session, respecting presence and the pipeline lock.
    ///
    /// # Errors
    ///
    /// Returns an error when the LLM call or the socket send fails. Skips
    /// (without error) when the user is away or the lock stays contended
    /// past the push timeout.
    pub async fn push_to_session(
        &self,
        session: &Arc<Session>,
        prompt: &str,
        mood: Mood,
    ) -> Result<()> {
        if !session.proximity_present() {
            debug!(user_id = session.user_id(), "skipping care push: user not present");
            return Ok(());
        }

        let Ok(_guard) =
            tokio::time::timeout(self.push_timeout, session.pipeline_lock().lock()).await
        else {
            debug!(user_id = session.user_id(), "skipping care push: pipeline busy");
            return Ok(());
        };

        let messages = vec![
            ChatMessage::system(CARE_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];
        let mut stream = self.llm.chat_stream(messages).await?;
        let mut text = String::new();
        while let Some(token) = stream.next().await {
            text.push_str(&token?);
        }

        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        session.send(&ServerMessage::Care {
            content: text.to_owned(),
            mood: mood.as_str().to_owned(),
        })?;

        let mut frames = self.tts.synthesize(text, session.tts_backend());
        while let Some(frame) = frames.next().await {
            session.send_frame(frame)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::WallaceError;
    use crate::pipeline::FRAME_SIZE;
    use crate::pipeline::llm::TokenStream;
    use crate::pipeline::tts::{FrameStream, TtsBackend};
    use crate::session::{Outbound, TtsBackendKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct StaticLlm {
        reply: String,
        calls: AtomicUsize,
    }

    impl StaticLlm {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_owned(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatModel for StaticLlm {
        async fn chat_stream(&self, _messages: Vec<ChatMessage>) -> Result<TokenStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.reply.clone();
            Ok(Box::pin(futures_util::stream::iter(vec![Ok(reply)])))
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    struct BrokenLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatModel for BrokenLlm {
        async fn chat_stream(&self, _messages: Vec<ChatMessage>) -> Result<TokenStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(WallaceError::Llm("down".to_owned()))
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    struct OneFrame;

    #[async_trait]
    impl TtsBackend for OneFrame {
        async fn synthesize(&self, text: &str) -> Result<FrameStream> {
            if text.trim().is_empty() {
                return Ok(Box::pin(futures_util::stream::iter(Vec::new())));
            }
            Ok(Box::pin(futures_util::stream::iter(vec![Ok(vec![
                0u8;
                FRAME_SIZE
            ])])))
        }
    }

    fn router() -> Arc<TtsRouter> {
        Arc::new(TtsRouter::new(Arc::new(OneFrame), Arc::new(OneFrame)))
    }

    fn make_session(user: &str) -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Session::new(user, tx, TtsBackendKind::Edge)), rx)
    }

    fn coordinator(
        llm: Arc<dyn ChatModel>,
        registry: Arc<SessionRegistry>,
        timeout: Duration,
    ) -> PushCoordinator {
        PushCoordinator::new(llm, router(), registry, timeout)
    }

    #[tokio::test]
    async fn push_sends_care_then_frames() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, mut rx) = make_session("u1");
        let coordinator = coordinator(
            Arc::new(StaticLlm::new("喝口水吧。")),
            registry,
            Duration::from_secs(1),
        );

        coordinator
            .push_to_session(&session, "提醒喝水", Mood::Caring)
            .await
            .unwrap();

        let Outbound::Text(json) = rx.try_recv().unwrap() else {
            panic!("expected care message first");
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "care");
        assert_eq!(value["content"], "喝口水吧。");
        assert_eq!(value["mood"], "caring");

        assert!(matches!(rx.try_recv().unwrap(), Outbound::Binary(_)));
    }

    #[tokio::test]
    async fn push_skips_absent_user() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, mut rx) = make_session("u1");
        session.set_proximity_present(false);
        let llm = Arc::new(StaticLlm::new("不该生成。"));
        let coordinator = coordinator(llm.clone(), registry, Duration::from_secs(1));

        coordinator
            .push_to_session(&session, "提醒", Mood::Caring)
            .await
            .unwrap();

        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn push_skips_when_lock_contended() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, mut rx) = make_session("u1");
        let llm = Arc::new(StaticLlm::new("不该生成。"));
        let coordinator = coordinator(llm.clone(), registry, Duration::from_millis(20));

        let _guard = session.pipeline_lock().lock().await;
        coordinator
            .push_to_session(&session, "提醒", Mood::Caring)
            .await
            .unwrap();

        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn push_empty_reply_sends_nothing() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, mut rx) = make_session("u1");
        let coordinator = coordinator(
            Arc::new(StaticLlm::new("   ")),
            registry,
            Duration::from_secs(1),
        );

        coordinator
            .push_to_session(&session, "提醒", Mood::Caring)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn push_all_isolates_failures() {
        let registry = Arc::new(SessionRegistry::new());
        let (first, _rx1) = make_session("u1");
        let (second, _rx2) = make_session("u2");
        registry.insert(first);
        registry.insert(second);

        let llm = Arc::new(BrokenLlm {
            calls: AtomicUsize::new(0),
        });
        let coordinator = coordinator(llm.clone(), Arc::clone(&registry), Duration::from_secs(1));

        // Both sessions are attempted even though each attempt errors.
        coordinator.push_all("提醒", Mood::Caring).await;
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }
}

//! Scripted Upstream Backend
//!
//! A deterministic [`UpstreamBackend`] for tests and offline runs. Each
//! backend follows one [`Script`], records every request it receives, and
//! never touches the network.
//!
//! # Example
//!
//! ```ignore
//! use relay_core::backend::scripted::ScriptedBackend;
//!
//! let backend = ScriptedBackend::with_fragments(["He", "llo ", "wor", "ld"]);
//! let mut stream = backend.open_stream(&request).await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{
    FragmentStream, StreamToken, UpstreamBackend, UpstreamRequest, UpstreamResponse,
    FRAGMENT_CHANNEL_CAPACITY,
};

/// What a scripted backend does when a stream is opened
#[derive(Clone, Debug)]
pub enum Script {
    /// Yield these fragments, then complete
    Fragments(Vec<String>),
    /// Refuse to open the stream
    FailOpen(String),
    /// Yield these fragments, then fail mid-stream
    FailAfter(Vec<String>, String),
    /// Split the last user message into word fragments
    Echo,
    /// Hand the producer side of each stream to the test
    Manual(mpsc::UnboundedSender<mpsc::Sender<StreamToken>>),
}

/// Deterministic backend driven by a [`Script`]
#[derive(Clone)]
pub struct ScriptedBackend {
    script: Script,
    /// Delay before each produced fragment
    fragment_delay: Duration,
    /// Every request received, in order
    requests: Arc<Mutex<Vec<UpstreamRequest>>>,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("script", &self.script)
            .field("fragment_delay", &self.fragment_delay)
            .field("open_count", &self.open_count())
            .finish()
    }
}

impl ScriptedBackend {
    fn from_script(script: Script) -> Self {
        Self {
            script,
            fragment_delay: Duration::ZERO,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A backend that yields `fragments` and completes
    pub fn with_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_script(Script::Fragments(
            fragments.into_iter().map(Into::into).collect(),
        ))
    }

    /// A backend whose streams cannot be opened
    pub fn failing_open(reason: impl Into<String>) -> Self {
        Self::from_script(Script::FailOpen(reason.into()))
    }

    /// A backend that yields `fragments` and then fails
    pub fn failing_after<I, S>(fragments: I, reason: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_script(Script::FailAfter(
            fragments.into_iter().map(Into::into).collect(),
            reason.into(),
        ))
    }

    /// A backend that echoes the last user message word by word
    #[must_use]
    pub fn echo() -> Self {
        Self::from_script(Script::Echo)
    }

    /// A backend whose streams are fed by the test
    ///
    /// Every opened stream delivers its producer through the returned
    /// receiver. Dropping a producer without sending
    /// [`StreamToken::Complete`] reads as an upstream disconnect.
    #[must_use]
    pub fn manual() -> (Self, mpsc::UnboundedReceiver<mpsc::Sender<StreamToken>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::from_script(Script::Manual(tx)), rx)
    }

    /// Sleep this long before each produced fragment
    #[must_use]
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    /// Number of streams or completions requested so far
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Every request received so far
    #[must_use]
    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().clone()
    }

    fn record(&self, request: &UpstreamRequest) {
        self.requests.lock().push(request.clone());
    }

    /// Fragments for a request plus the failure to end with, if any
    fn plan(&self, request: &UpstreamRequest) -> (Vec<String>, Option<String>) {
        match self.script {
            Script::Fragments(ref fragments) => (fragments.clone(), None),
            Script::FailAfter(ref fragments, ref reason) => {
                (fragments.clone(), Some(reason.clone()))
            }
            Script::Echo => (echo_fragments(request), None),
            Script::FailOpen(_) | Script::Manual(_) => (Vec::new(), None),
        }
    }
}

/// Split text into word fragments that concatenate back to the original
fn echo_fragments(request: &UpstreamRequest) -> Vec<String> {
    let text = request.last_user_message().unwrap_or_default();
    text.split_inclusive(' ').map(str::to_string).collect()
}

#[async_trait]
impl UpstreamBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn health_check(&self) -> bool {
        !matches!(self.script, Script::FailOpen(_))
    }

    async fn open_stream(&self, request: &UpstreamRequest) -> anyhow::Result<FragmentStream> {
        self.record(request);

        let (tx, stream) = FragmentStream::channel(FRAGMENT_CHANNEL_CAPACITY);

        match self.script {
            Script::FailOpen(ref reason) => anyhow::bail!("{reason}"),
            Script::Manual(ref handoff) => {
                handoff
                    .send(tx)
                    .map_err(|_| anyhow::anyhow!("Scripted stream handoff closed"))?;
                return Ok(stream);
            }
            _ => {}
        }

        let (fragments, failure) = self.plan(request);
        let delay = self.fragment_delay;

        tokio::spawn(async move {
            for fragment in fragments {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(StreamToken::Fragment(fragment)).await.is_err() {
                    return;
                }
            }
            let last = match failure {
                Some(reason) => StreamToken::Error(reason),
                None => StreamToken::Complete,
            };
            let _ = tx.send(last).await;
        });

        Ok(stream)
    }

    async fn complete(&self, request: &UpstreamRequest) -> anyhow::Result<UpstreamResponse> {
        let start = Instant::now();
        self.record(request);

        if let Script::FailOpen(ref reason) = self.script {
            anyhow::bail!("{reason}");
        }
        if matches!(self.script, Script::Manual(_)) {
            anyhow::bail!("Manual scripts only support streaming");
        }

        let (fragments, failure) = self.plan(request);
        if let Some(reason) = failure {
            anyhow::bail!("{reason}");
        }

        Ok(UpstreamResponse {
            content: fragments.concat(),
            model: request.model.clone(),
            tokens_used: u32::try_from(fragments.len()).ok(),
            duration_ms: u64::try_from(start.elapsed().as_millis()).ok(),
        })
    }
}

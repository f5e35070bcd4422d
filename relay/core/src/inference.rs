//! Synchronous inference
//!
//! The non-streaming variant of a relay request: same envelope, same
//! allow-list, one complete response. No chunking and no pacing apply.

use crate::backend::{UpstreamBackend, UpstreamRequest};
use crate::config::RelayConfig;
use crate::messages::RequestEnvelope;
use crate::security::ValidationResult;
use crate::session::RelayError;

/// Run a request to completion and return the full generated text
///
/// # Errors
///
/// [`RelayError::ModelNotAllowed`] when the model is not on the allow-list
/// (upstream is never contacted), [`RelayError::Upstream`] when the upstream
/// call fails.
pub async fn run(
    config: &RelayConfig,
    backend: &dyn UpstreamBackend,
    envelope: RequestEnvelope,
) -> Result<String, RelayError> {
    if let ValidationResult::Invalid(reason) = config.allowed_models.validate(&envelope.model_id)
    {
        tracing::warn!(model = %envelope.model_id, "Rejected disallowed model");
        return Err(RelayError::ModelNotAllowed(reason));
    }

    let request = UpstreamRequest::new(
        envelope.model_id,
        envelope.messages,
        envelope.max_tokens.unwrap_or(config.default_max_tokens),
    )
    .with_stream(false);

    let response = backend
        .complete(&request)
        .await
        .map_err(|e| RelayError::Upstream(format!("{e:#}")))?;

    tracing::info!(
        model = %response.model,
        tokens = ?response.tokens_used,
        duration_ms = ?response.duration_ms,
        "Completed synchronous inference"
    );

    Ok(response.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedBackend;
    use crate::messages::ChatMessage;
    use crate::security::AllowList;

    fn config() -> RelayConfig {
        RelayConfig::default().with_allowed_models(AllowList::new(["modelA"]))
    }

    #[tokio::test]
    async fn test_run_returns_full_text() {
        let backend = ScriptedBackend::with_fragments(["He", "llo ", "wor", "ld"]);
        let envelope = RequestEnvelope::new("modelA", vec![ChatMessage::user("Hi")]);

        let text = run(&config(), &backend, envelope).await.unwrap();

        assert_eq!(text, "Hello world");
        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].max_tokens, 500);
        assert!(!requests[0].stream);
    }

    #[tokio::test]
    async fn test_run_rejects_disallowed_model_without_upstream_call() {
        let backend = ScriptedBackend::with_fragments(["never"]);
        let envelope = RequestEnvelope::new("modelB", vec![ChatMessage::user("Hi")]);

        let err = run(&config(), &backend, envelope).await.unwrap_err();

        assert!(matches!(err, RelayError::ModelNotAllowed(_)));
        assert!(err.to_string().contains("'modelB' is not allowed"));
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test]
    async fn test_run_reports_upstream_failure() {
        let backend = ScriptedBackend::failing_open("service unavailable");
        let envelope =
            RequestEnvelope::new("modelA", vec![ChatMessage::user("Hi")]).with_max_tokens(32);

        let err = run(&config(), &backend, envelope).await.unwrap_err();

        assert!(matches!(err, RelayError::Upstream(_)));
        assert!(err.to_string().contains("service unavailable"));
        assert_eq!(backend.requests()[0].max_tokens, 32);
    }
}

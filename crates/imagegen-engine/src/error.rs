use imagegen_contracts::{Provider, TaskType};
use thiserror::Error;

/// Fatal adapter failures, classified so callers can branch on the kind
/// (downcast through `anyhow`) instead of parsing message text.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} API key is missing")]
    MissingApiKey { provider: Provider },
    #[error("missing endpoint URL for {provider}:{task}")]
    MissingEndpoint { provider: Provider, task: TaskType },
    #[error("{provider} API error status={status} body={body_preview}")]
    Http {
        provider: Provider,
        status: u16,
        body_preview: String,
    },
    #[error("{provider} {detail}")]
    Protocol { provider: Provider, detail: String },
    #[error("{provider} async task poll timeout after {seconds}s")]
    PollTimeout { provider: Provider, seconds: u64 },
}

const SYNC_UNSUPPORTED_MARKER: &str = "does not support synchronous calls";

/// DashScope reports "this endpoint only works async" as a plain-text error
/// body, not a structured code. The substring probe is confined here and only
/// ever applied to the body of a structured HTTP error.
pub fn sync_unsupported(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ProviderError>(),
            Some(ProviderError::Http { body_preview, .. })
                if body_preview.contains(SYNC_UNSUPPORTED_MARKER)
        )
    })
}

/// True when the poll deadline elapsed without a terminal task status. The
/// task's real outcome is unknown, unlike a provider-reported failure.
pub fn poll_timed_out(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ProviderError>(),
            Some(ProviderError::PollTimeout { .. })
        )
    })
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use imagegen_contracts::Provider;

    use super::{poll_timed_out, sync_unsupported, ProviderError};

    #[test]
    fn sync_unsupported_matches_http_body_only() {
        let err = anyhow!(ProviderError::Http {
            provider: Provider::Alibaba,
            status: 400,
            body_preview: "Current model does not support synchronous calls".to_string(),
        });
        assert!(sync_unsupported(&err));

        let other = anyhow!(ProviderError::Http {
            provider: Provider::Alibaba,
            status: 400,
            body_preview: "invalid parameter".to_string(),
        });
        assert!(!sync_unsupported(&other));

        let unstructured = anyhow!("does not support synchronous calls");
        assert!(!sync_unsupported(&unstructured));
    }

    #[test]
    fn sync_unsupported_survives_context_wrapping() {
        let err = anyhow!(ProviderError::Http {
            provider: Provider::Alibaba,
            status: 400,
            body_preview: "does not support synchronous calls".to_string(),
        })
        .context("alibaba request failed");
        assert!(sync_unsupported(&err));
    }

    #[test]
    fn poll_timeout_is_distinguishable_from_task_failure() {
        let timeout = anyhow!(ProviderError::PollTimeout {
            provider: Provider::Alibaba,
            seconds: 300,
        });
        assert!(poll_timed_out(&timeout));

        let failed = anyhow!(ProviderError::Protocol {
            provider: Provider::Alibaba,
            detail: "async task failed".to_string(),
        });
        assert!(!poll_timed_out(&failed));
    }
}

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, StudyError};

/// The cancellation tokens a backend call answers to: the provider's own token
/// (cancelled on teardown) and an optional caller token.
#[derive(Debug, Clone)]
pub(crate) struct CancelScope {
    provider: CancellationToken,
    caller: Option<CancellationToken>,
}

impl CancelScope {
    pub(crate) fn new(provider: CancellationToken) -> Self {
        Self {
            provider,
            caller: None,
        }
    }

    /// Same scope, additionally bound to `caller`.
    pub(crate) fn with_caller(&self, caller: CancellationToken) -> Self {
        Self {
            provider: self.provider.clone(),
            caller: Some(caller),
        }
    }

    /// Whether the provider behind this scope has been torn down.
    pub(crate) fn provider_closed(&self) -> bool {
        self.provider.is_cancelled()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.provider.is_cancelled() || self.caller.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// Fail fast before a call reaches the backend.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.provider_closed() {
            return Err(StudyError::BackendUnavailable(
                "data layer provider has been torn down".into(),
            ));
        }
        Ok(())
    }

    /// Gate for multi-document mutations: checked once before the first write.
    pub(crate) fn check(&self) -> Result<()> {
        self.ensure_open()?;
        if self.is_cancelled() {
            return Err(StudyError::Cancelled);
        }
        Ok(())
    }

    async fn cancelled(&self) {
        match &self.caller {
            Some(caller) => {
                tokio::select! {
                    _ = self.provider.cancelled() => {}
                    _ = caller.cancelled() => {}
                }
            }
            None => self.provider.cancelled().await,
        }
    }

    /// Race a read against cancellation.
    pub(crate) async fn race<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_open()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(StudyError::Cancelled),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_caller_token_cancels_pending_read() {
        let scope = CancelScope::new(CancellationToken::new());
        let caller = CancellationToken::new();
        let bound = scope.with_caller(caller.clone());
        caller.cancel();

        let result: Result<()> = bound.race(std::future::pending()).await;
        assert!(matches!(result, Err(StudyError::Cancelled)));
        // The unbound scope is unaffected
        assert!(scope.check().is_ok());
    }

    #[tokio::test]
    async fn test_closed_provider_is_unavailable() {
        let token = CancellationToken::new();
        let scope = CancelScope::new(token.clone());
        token.cancel();

        let result = scope.race(async { Ok(1) }).await;
        assert!(matches!(result, Err(StudyError::BackendUnavailable(_))));
        assert!(matches!(scope.check(), Err(StudyError::BackendUnavailable(_))));
    }
}

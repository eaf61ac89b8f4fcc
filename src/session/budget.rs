use std::future::{Future, pending};
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

use super::error::{SessionError, SessionResult};

/// Time and cancellation limits shared by every hop of one request.
///
/// The deadline is fixed when the request starts, so redirects and the
/// digest retry all draw from the same total.
#[derive(Debug, Clone)]
pub(crate) struct RequestBudget {
    deadline: Option<Instant>,
    session: CancellationToken,
    request: Option<CancellationToken>,
}

impl RequestBudget {
    pub(crate) fn new(
        timeout: Option<Duration>,
        session: CancellationToken,
        request: Option<CancellationToken>,
    ) -> Self {
        Self {
            deadline: timeout.map(|limit| Instant::now() + limit),
            session,
            request,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.session.is_cancelled() || self.request.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Runs `fut` until it finishes, the deadline passes, or either token
    /// fires. Dropping `fut` early drops whatever connection it holds.
    pub(crate) async fn run<T, F>(&self, fut: F) -> SessionResult<T>
    where
        F: Future<Output = SessionResult<T>>,
    {
        let request_cancelled = async {
            match &self.request {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };
        let bounded = async {
            match self.deadline {
                Some(deadline) => timeout_at(deadline, fut)
                    .await
                    .unwrap_or_else(|_| Err(SessionError::Timeout)),
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.session.cancelled() => Err(SessionError::Cancelled),
            _ = request_cancelled => Err(SessionError::Cancelled),
            result = bounded => result,
        }
    }
}

use std::future::Future;

use crate::DPoPNonce;

/// Grants at most one retry for a request
#[derive(Debug, Default)]
pub struct SingleRetry {
    spent: bool,
}

impl SingleRetry {
    /// Constructs an unspent retry
    pub fn new() -> Self {
        Self::default()
    }

    /// Passes `reason` through if a retry is warranted and one is still available
    ///
    /// Once a reason has been passed through, every later call returns `None`.
    pub fn permit<T>(&mut self, reason: Option<T>) -> Option<T> {
        if self.spent {
            return None;
        }

        let reason = reason?;
        self.spent = true;
        Some(reason)
    }
}

/// Sends a request, resending it once with a fresh nonce if the server demands one
///
/// `send` is called with `None` first, meaning the last remembered nonce
/// should be used. If `challenge` finds a nonce demand in the response, `send`
/// is called once more with that nonce, and that response is final.
pub async fn retry_with_nonce<R, E, S, Fut, X>(mut send: S, challenge: X) -> Result<R, E>
where
    S: FnMut(Option<DPoPNonce>) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    X: Fn(&R) -> Option<DPoPNonce>,
{
    let mut retry = SingleRetry::new();
    let mut response = send(None).await?;

    while let Some(nonce) = retry.permit(challenge(&response)) {
        tracing::debug!(%nonce, "server demanded a DPoP nonce; retrying");
        response = send(Some(nonce)).await?;
    }

    Ok(response)
}

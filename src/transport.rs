//! Opens the streamed completion request and hands the body back as a lazy
//! chunk sequence.
//!
//! Exactly one connection per run. The cancellation token is raced against
//! the initial send here and against every chunk read in the driver loop;
//! dropping the response (any exit path) releases the connection.

use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GenerationError;
use crate::protocol::CompletionRequest;

pub struct Transport {
    client: Client,
    endpoint: String,
}

impl Transport {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Transport {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST the request and return the response once headers are in, leaving
    /// the body unconsumed for `bytes_stream()`. Non-success status becomes
    /// `Transport { status, body }`; a cancellation that fires first becomes
    /// `Aborted`.
    pub async fn open(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Response, GenerationError> {
        debug!(endpoint = %self.endpoint, streams = request.contents.len(), "opening completion stream");

        let send = self.client.post(&self.endpoint).json(request).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationError::Aborted),
            result = send => result?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Transport {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

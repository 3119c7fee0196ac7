//! Direct (unbatched) producer.

use tracing::debug;

use crate::client::SharedClient;
use crate::error::{ClientError, Result};
use crate::record::{Record, RecordId};

/// Writes each record with its own append call.
#[derive(Clone)]
pub struct Producer {
    client: SharedClient,
    stream: String,
}

impl Producer {
    /// Creates a producer for `stream`.
    #[must_use]
    pub fn new(client: SharedClient, stream: impl Into<String>) -> Self {
        Self {
            client,
            stream: stream.into(),
        }
    }

    /// Returns the target stream.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Writes one record and waits for its identifier.
    ///
    /// # Errors
    ///
    /// Propagates the broker's rejection: `NotFound` for a missing stream,
    /// `RecordTooLarge` for an oversized payload.
    pub async fn write(&self, record: Record) -> Result<RecordId> {
        let ids = self.client.append(&self.stream, vec![record]).await?;
        let id = ids.into_iter().next().ok_or_else(|| ClientError::Protocol {
            message: format!("append to {} returned no identifier", self.stream),
        })?;
        debug!(stream = %self.stream, record_id = %id, "record written");
        Ok(id)
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("address", &self.client.address())
            .field("stream", &self.stream)
            .finish()
    }
}

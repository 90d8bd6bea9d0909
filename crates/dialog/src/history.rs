//! History fetching with the dialog's retry policy.
//!
//! Only the initial load retries; pagination is user-initiated and fails
//! fast. Attempt `n` backs off `n * base_delay` before trying again.

use std::time::Duration;

use parley_store::{MessageBackend, MessagePage, PageRequest};
use snafu::ResultExt;
use tokio::time::sleep;

use crate::config::DialogConfig;
use crate::error::{DialogResult, InitialLoadFailedSnafu, PaginationFailedSnafu};

#[derive(Clone)]
pub struct HistoryLoader {
    max_attempts: u32,
    base_delay: Duration,
}

pub struct InitialLoad {
    pub page: MessagePage,
    /// How many fetches it took, 1-based.
    pub attempts: u32,
}

impl HistoryLoader {
    pub fn new(config: &DialogConfig) -> Self {
        Self {
            max_attempts: config.max_initial_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    pub async fn load_initial(
        &self,
        backend: &dyn MessageBackend,
        request: PageRequest,
    ) -> DialogResult<InitialLoad> {
        let mut attempt = 1;
        loop {
            match backend.fetch_page(request).await {
                Ok(page) => return Ok(InitialLoad { page, attempts: attempt }),
                Err(source) => {
                    if attempt >= self.max_attempts {
                        return Err(source).context(InitialLoadFailedSnafu { attempts: attempt });
                    }
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %source,
                        "initial history load failed, retrying"
                    );
                    sleep(self.base_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn load_older(
        &self,
        backend: &dyn MessageBackend,
        request: PageRequest,
    ) -> DialogResult<MessagePage> {
        backend.fetch_page(request).await.context(PaginationFailedSnafu)
    }
}

//! Sequential batch runner
//!
//! Items are dispatched strictly one after another. A fixed pacing delay
//! follows every successful item except the last; failures move straight on
//! to the next item. Cancellation stops the batch and leaves the remaining
//! items skipped.

use std::future::Future;

use common::Secret;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use transport::InvokeError;

use crate::dispatcher::{Dispatcher, sleep_or_cancel};
use crate::error::DispatchError;

/// Result of one batch item.
#[derive(Debug)]
pub enum BatchOutcome<T> {
    Completed(T),
    Failed(DispatchError),
    /// Not attempted because the batch was cancelled.
    Skipped,
}

impl<T> BatchOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, BatchOutcome::Completed(_))
    }
}

impl Dispatcher {
    /// Dispatch every item in order, one full dispatch at a time.
    ///
    /// `make_work` builds the unit of work for an item. The returned vector
    /// has one outcome per item, in item order.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn run_batch<I, T, W, Fut>(
        &self,
        items: &[I],
        mut make_work: impl FnMut(&I) -> W,
        cancel: &CancellationToken,
    ) -> Vec<BatchOutcome<T>>
    where
        W: FnMut(Secret<String>) -> Fut,
        Fut: Future<Output = Result<T, InvokeError>>,
    {
        let mut outcomes = Vec::with_capacity(items.len());
        let mut cancelled = false;

        for (index, item) in items.iter().enumerate() {
            if cancelled || cancel.is_cancelled() {
                outcomes.push(BatchOutcome::Skipped);
                continue;
            }

            match self.execute(make_work(item), cancel).await {
                Ok(value) => {
                    outcomes.push(BatchOutcome::Completed(value));
                    let is_last = index + 1 == items.len();
                    if !is_last
                        && sleep_or_cancel(self.config().batch_pacing(), cancel)
                            .await
                            .is_err()
                    {
                        cancelled = true;
                    }
                }
                Err(DispatchError::Cancelled) => {
                    outcomes.push(BatchOutcome::Failed(DispatchError::Cancelled));
                    cancelled = true;
                }
                Err(e) => {
                    warn!(index, kind = e.kind(), "batch item failed");
                    outcomes.push(BatchOutcome::Failed(e));
                }
            }
        }

        let completed = outcomes.iter().filter(|o| o.is_completed()).count();
        info!(completed, total = items.len(), cancelled, "batch finished");
        outcomes
    }
}

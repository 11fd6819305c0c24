//! The transaction driver
//!
//! [`Transactions`] wraps attempts in a retry loop bounded by the
//! configured expiration: each iteration builds a fresh
//! [`AttemptContext`], runs the user closure against it, commits
//! implicitly if the closure did not, and then routes any
//! [`TransactionOperationFailed`] by its flags: roll back and retry, roll
//! back and surface, or surface directly. Finished attempts that may have
//! left artifacts are handed to the cleanup service.
//!
//! Two call shapes over one core: `run_with_callback` executes on a
//! worker thread and delivers the outcome to the callback; `run` blocks
//! by waiting on a one-shot fed by the callback shape.

use crate::attempt::{AttemptContext, OpResult};
use crate::cleanup::TransactionsCleanup;
use crate::config::TransactionConfig;
use crate::context::TransactionShared;
use crate::error::{FinalErrorKind, TransactionError, TransactionOperationFailed};
use crate::result::TransactionResult;
use atrium_core::retry::jitter;
use atrium_core::KvClient;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// The closure a transaction executes, possibly several times.
pub trait TransactionLogic<C: KvClient>:
    Fn(&AttemptContext<C>) -> OpResult<()> + Send + Sync + 'static
{
}

impl<C: KvClient, F> TransactionLogic<C> for F where
    F: Fn(&AttemptContext<C>) -> OpResult<()> + Send + Sync + 'static
{
}

struct TransactionsInner<C: KvClient> {
    client: Arc<C>,
    config: TransactionConfig,
    cleanup: TransactionsCleanup<C>,
}

/// Entry point for running transactions against one cluster client.
///
/// Cheap to clone; all clones share the configuration and the cleanup
/// service.
pub struct Transactions<C: KvClient> {
    inner: Arc<TransactionsInner<C>>,
}

impl<C: KvClient> Clone for Transactions<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: KvClient> Transactions<C> {
    /// Build a driver and start its cleanup service.
    pub fn new(client: Arc<C>, config: TransactionConfig) -> Self {
        let cleanup = TransactionsCleanup::new(Arc::clone(&client), config.clone());
        Self {
            inner: Arc::new(TransactionsInner {
                client,
                config,
                cleanup,
            }),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &TransactionConfig {
        &self.inner.config
    }

    /// The cleanup service.
    pub fn cleanup(&self) -> &TransactionsCleanup<C> {
        &self.inner.cleanup
    }

    /// Stop the background cleanup threads.
    pub fn close(&self) {
        self.inner.cleanup.shutdown();
    }

    /// Run a transaction, blocking until it commits or finally fails.
    pub fn run(
        &self,
        logic: impl TransactionLogic<C>,
    ) -> Result<TransactionResult, TransactionError> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.run_with_callback(logic, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.recv()
            .expect("transaction worker always delivers an outcome")
    }

    /// Run a transaction on a worker thread, delivering the outcome to
    /// `callback`.
    pub fn run_with_callback(
        &self,
        logic: impl TransactionLogic<C>,
        callback: impl FnOnce(Result<TransactionResult, TransactionError>) + Send + 'static,
    ) {
        let this = self.clone();
        std::thread::Builder::new()
            .name("atrium-txn".to_string())
            .spawn(move || callback(this.run_inner(&logic)))
            .expect("failed to spawn transaction worker thread");
    }

    fn run_inner(
        &self,
        logic: &impl TransactionLogic<C>,
    ) -> Result<TransactionResult, TransactionError> {
        let overall = Arc::new(TransactionShared::new(&self.inner.config));
        tracing::debug!(
            transaction_id = %overall.transaction_id(),
            "starting transaction"
        );
        // retry backoff, capped at a hundredth of the budget
        let cap = self.inner.config.expiration_time / 100;
        let mut retry_delay = Duration::from_millis(5).min(cap.max(Duration::from_millis(1)));

        loop {
            let ctx = AttemptContext::new(
                Arc::clone(&self.inner.client),
                self.inner.config.clone(),
                Arc::clone(&overall),
            );
            tracing::debug!(
                transaction_id = %overall.transaction_id(),
                attempt_id = %ctx.attempt_id(),
                attempt = overall.attempt_count(),
                "starting attempt"
            );

            let outcome = logic(&ctx).and_then(|()| {
                if ctx.is_done() {
                    Ok(())
                } else {
                    ctx.commit()
                }
            });

            match outcome {
                Ok(()) => {
                    let result = self.finish_attempt(&overall, &ctx);
                    return Ok(result);
                }
                Err(err) => {
                    tracing::debug!(
                        transaction_id = %overall.transaction_id(),
                        attempt_id = %ctx.attempt_id(),
                        error = %err,
                        retry = err.retry,
                        rollback = err.rollback,
                        "attempt failed"
                    );
                    let mut err = err;
                    if err.rollback && !ctx.is_done() {
                        if let Err(rollback_err) = ctx.rollback() {
                            tracing::warn!(
                                transaction_id = %overall.transaction_id(),
                                error = %rollback_err,
                                "rollback of failed attempt itself failed"
                            );
                            // an unrecoverable rollback forbids another attempt
                            err.retry = false;
                        }
                    }
                    let result = self.finish_attempt(&overall, &ctx);

                    if err.retry && err.raise == FinalErrorKind::Failed {
                        if overall.has_expired_client_side() {
                            return Err(TransactionError::Expired {
                                message: "transaction expired before it could be retried"
                                    .to_string(),
                                result,
                            });
                        }
                        std::thread::sleep(jitter(retry_delay));
                        retry_delay = (retry_delay * 2).min(cap);
                        continue;
                    }
                    return self.surface(err, result);
                }
            }
        }
    }

    /// Snapshot the attempt history and queue the attempt for cleanup if
    /// it may have left artifacts.
    fn finish_attempt(
        &self,
        overall: &TransactionShared,
        ctx: &AttemptContext<C>,
    ) -> TransactionResult {
        if let Some(atr_id) = ctx.atr_id() {
            self.inner.cleanup.track_bucket(atr_id.bucket.clone());
            self.inner
                .cleanup
                .add_attempt(atr_id, ctx.attempt_id().to_string());
        }
        TransactionResult {
            transaction_id: overall.transaction_id().to_string(),
            atr_id: overall.atr_id(),
            attempts: overall.attempts(),
            unstaging_complete: ctx.unstaging_complete(),
        }
    }

    /// Map a terminal attempt failure onto the user-visible taxonomy.
    fn surface(
        &self,
        err: TransactionOperationFailed,
        result: TransactionResult,
    ) -> Result<TransactionResult, TransactionError> {
        match err.raise {
            FinalErrorKind::Expired => Err(TransactionError::Expired {
                message: err.message,
                result,
            }),
            FinalErrorKind::CommitAmbiguous => Err(TransactionError::CommitAmbiguous {
                message: err.message,
                result,
            }),
            // the user's writes are durable; cleanup owns the leftovers
            FinalErrorKind::FailedPostCommit => Ok(TransactionResult {
                unstaging_complete: false,
                ..result
            }),
            FinalErrorKind::Failed => Err(TransactionError::Failed {
                message: err.message,
                cause: err.cause,
                result,
            }),
        }
    }
}

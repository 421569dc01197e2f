//! Error-catching combinators.
//!
//! Both combinators run a block inside the *current* task and turn its failures (including
//! panics) into values. They differ in how they treat cancellation:
//!
//! - [`catch`] only catches failures. A cancellation passes through as the outer error, so that
//!   `catch(block).await?` ends the task the way a cancelled task should end.
//! - [`run_catching`] catches everything, including cancellation. A task that swallows its own
//!   cancellation this way keeps running until its next suspension point.
//!
//! Neither can undo propagation: by the time a resolved [`Deferred`][crate::Deferred] hands out a
//! failure, its scope has already reacted to it according to its [`Policy`][crate::Policy].
//! Catching only prevents the *caller* from failing. To keep a failure from ever reaching the
//! scope, catch it inside the producer.

use std::future::Future;

use crate::{
    error::{Cancelled, Error, Failure},
    task::CatchUnwind,
};

/// Runs `block`, turning a failure into `Ok(Err(failure))` and letting cancellation through.
pub async fn catch<T, Fut>(block: Fut) -> Result<Result<T, Failure>, Cancelled>
where
    Fut: Future<Output = Result<T, Error>>,
{
    match CatchUnwind::new(block).await {
        Ok(value) => Ok(Ok(value)),
        Err(Error::Failed(failure)) => Ok(Err(failure)),
        Err(Error::Cancelled(cancelled)) => {
            log::trace!("`catch` passing through cancellation");
            Err(cancelled)
        }
    }
}

/// Runs `block`, turning every error (failures, panics and cancellation) into a value.
pub async fn run_catching<T, Fut>(block: Fut) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    let result = CatchUnwind::new(block).await;
    if let Err(Error::Cancelled(_)) = &result {
        log::debug!("`run_catching` swallowed a cancellation");
    }
    result
}

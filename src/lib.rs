//! A structured concurrency runtime where every task knows its family.
//!
//! # Overview
//!
//! Work is started in a [`Scope`] and becomes a child [`Task`] of that scope. Tasks form a tree,
//! and the tree enforces *structured concurrency*:
//!
//! - a scope only finishes once everything started in it has finished;
//! - cancelling a scope cancels everything below it;
//! - a failure never silently disappears. It either travels up the tree, is returned to whoever
//!   waits for it, or is handed to an uncaught-failure handler.
//!
//! How far a failure travels is decided by the [`Policy`] of the scope it happens in. In a
//! [`Policy::Normal`] scope, a failing child fails the whole scope and cancels all of its
//! siblings. In a [`Policy::Supervisor`] scope, children fail on their own.
//!
//! Tasks run on a [`Dispatcher`], a single-threaded, deterministic executor with a virtual clock.
//! Task bodies are plain `async` blocks returning `Result<T, Error>`. Cancellation is
//! cooperative: it is observed at suspension points ([`delay`], [`yield_now`],
//! [`Deferred::resolve`], [`Task::join`]), which then return [`Cancelled`]. Propagating that
//! error with `?` ends the task as *cancelled*.
//!
//! ## Deferred values
//!
//! [`Scope::start_deferred`] starts work that produces a value, which any number of tasks can wait
//! for with [`Deferred::resolve`]. The producer is a child of the scope like any other task: if it
//! fails in a [`Policy::Normal`] scope, the scope fails, no matter who resolves the value and how
//! they handle the error. The only way to keep such a failure local is to catch it *inside* the
//! producer, or to start the producer in a [`Policy::Supervisor`] scope.
//!
//! # Usage
//!
//! ```
//! use std::time::Duration;
//! use kinship::{catch, delay, Dispatcher, Error, Start};
//!
//! let dispatcher = Dispatcher::queued();
//! let answer = dispatcher.block_on(|scope| async move {
//!     let value = scope.start_deferred(Start::Eager, |_| async {
//!         delay(Duration::from_secs(1)).await?;
//!         Ok(42)
//!     });
//!
//!     // Children in a supervisor scope may fail without taking their siblings down.
//!     let caught = scope
//!         .supervisor_scope(|sup| async move {
//!             let failing = sup.start_deferred(Start::Lazy, |_| async {
//!                 Err::<i32, _>(Error::msg("no luck"))
//!             });
//!             catch(failing.resolve()).await.map_err(Error::from)
//!         })
//!         .await?;
//!     assert_eq!(caught.unwrap_err().to_string(), "no luck");
//!
//!     value.resolve().await
//! });
//!
//! assert_eq!(answer.unwrap(), 42);
//! assert_eq!(dispatcher.now(), Duration::from_secs(1));
//! ```
//!
//! A failure in a [`Policy::Normal`] scope cancels the siblings of the failing task:
//!
//! ```
//! use std::time::Duration;
//! use kinship::{delay, Dispatcher, Error, Scope};
//!
//! let dispatcher = Dispatcher::queued();
//! let scope = Scope::new(&dispatcher);
//! let sleeper = scope.launch(|_| async {
//!     delay(Duration::from_secs(60)).await?;
//!     Ok(())
//! });
//! scope.launch(|_| async {
//!     delay(Duration::from_secs(1)).await?;
//!     Err(Error::msg("oops"))
//! });
//!
//! dispatcher.advance_until_idle();
//! assert!(sleeper.is_cancelled());
//! assert!(scope.task().is_failed());
//! assert_eq!(dispatcher.now(), Duration::from_secs(1));
//! ```

mod catch;
mod context;
mod deferred;
mod dispatcher;
mod error;
mod scope;
mod sync;
mod task;
mod time;


pub use catch::{catch, run_catching};
pub use deferred::{Deferred, Start};
pub use dispatcher::{Clock, Discipline, Dispatcher, DispatcherBuilder, UncaughtHandler};
pub use error::{Cancelled, Error, Failure, Panicked};
pub use scope::{Nested, Policy, Scope, ScopeBuilder};
pub use task::{Task, TaskId, TaskState};
pub use time::{delay, yield_now, Delay, YieldNow};

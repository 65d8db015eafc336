//! Background Jobs for the scheduler
//!
//! - `reconcile`: periodic sweep that repairs drift between stored dates,
//!   pending records and queue registrations
//!
//! # Usage
//!
//! ```ignore
//! use evalcycle_scheduler::jobs::reconcile_task;
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(reconcile_task(Arc::clone(&scheduler), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

pub mod reconcile;

pub use reconcile::reconcile_task;

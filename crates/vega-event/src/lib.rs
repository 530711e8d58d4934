//! Message bus for Vega - unified communication between components.
//!
//! The [`MessageBus`] is a typed publish/subscribe channel with
//! priorities, namespacing and a bounded queue. Components and the task
//! interpreter use it to exchange notifications without holding
//! references to each other.
//!
//! # Topics
//!
//! Topics are plain strings. A namespaced topic uses the `ns::topic`
//! form; publishing with [`MessageBus::publish_in`] composes the full
//! topic for you. A subscription to `ns.*` receives every message
//! published into `ns`.
//!
//! ```text
//! publish_in("camera", "exposure_done", msg)
//!        │
//!        ▼  full topic = "camera::exposure_done"
//! ┌──────────────────┐
//! │   bounded queue  │  overflow: oldest discarded, warning logged
//! └──────────────────┘
//!        │  consumer task (one per bus)
//!        ├──► subscribers of "camera::exposure_done"  (priority desc)
//!        ├──► subscribers of "camera.*"               (priority desc)
//!        └──► global subscribers                      (priority desc)
//! ```
//!
//! # Ordering
//!
//! The queue is FIFO and drained by a single consumer task, so
//! subscribers of equal priority observe messages in publish order.
//! Higher priorities are dispatched strictly first within a message.
//!
//! # Example
//!
//! ```
//! use vega_event::MessageBus;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus: MessageBus<String> = MessageBus::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//!
//! let counter = Arc::clone(&seen);
//! bus.subscribe("status", 0, move |_msg: &String| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! let consumer = bus.start();
//! bus.publish("status", "tracking".to_string()).unwrap();
//!
//! // Give the consumer a chance to run, then stop it.
//! tokio::task::yield_now().await;
//! bus.stop();
//! consumer.await.unwrap();
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! # }
//! ```

mod bus;
mod error;

pub use bus::{MessageBus, SubscriptionId, DEFAULT_QUEUE_CAPACITY};
pub use error::BusError;

// SPDX-License-Identifier: Apache-2.0

//! Downstream delivery of harvested records.

use std::future::Future;

use crate::harvest::Record;

pub mod blackhole;
pub mod console;
pub mod publish_loop;

pub use blackhole::BlackholePublisher;
pub use console::ConsolePublisher;
pub use publish_loop::PublishLoop;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A sink for record batches.
///
/// `publish` returning `Ok` means the whole batch is durably delivered. The
/// publish loop acknowledges the batch only then, and retries it as a whole
/// on error, so a publisher may see a batch more than once.
pub trait Publisher: Send + 'static {
    fn name(&self) -> &'static str;

    fn publish(&mut self, batch: &[Record]) -> impl Future<Output = Result<(), BoxError>> + Send;
}

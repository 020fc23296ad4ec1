pub mod consumer;
pub mod producer;
pub mod retry;

pub use consumer::{ConsumerError, ConsumerSettings, PartitionHandle, StreamConsumer};
pub use producer::{ProduceError, StreamProducer};
pub use retry::{Backoff, RetryError, RetryPolicy};

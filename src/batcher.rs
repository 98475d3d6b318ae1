//! Per-channel batching.
//!
//! Buffers processed ticks per output channel and flushes on whichever
//! trigger fires first: the time window `W_ms` or the size cap `N_max`.
//! `add()` never blocks the processing path — a full buffer drops the
//! incoming item and increments a counter rather than applying backpressure
//! to the tick pipeline.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

#[derive(Clone)]
pub struct BatcherConfig {
    pub window: Duration,
    pub max_size: usize,
    pub channel_capacity: usize,
}

pub struct Batcher<T: Clone + Send + 'static> {
    senders: HashMap<String, mpsc::Sender<T>>,
    config: BatcherConfig,
}

impl<T: Clone + Send + 'static> Batcher<T> {
    pub fn new(config: BatcherConfig) -> Self {
        Self { senders: HashMap::new(), config }
    }

    /// Registers a channel and spawns its flush loop, returning a flush
    /// receiver the caller forwards to the message bus.
    pub fn register(&mut self, channel: &str) -> mpsc::Receiver<Vec<T>> {
        let (item_tx, item_rx) = mpsc::channel::<T>(self.config.channel_capacity);
        let (flush_tx, flush_rx) = mpsc::channel::<Vec<T>>(16);
        self.senders.insert(channel.to_string(), item_tx);

        let config = self.config.clone();
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            run_flush_loop(item_rx, flush_tx, config, channel_name).await;
        });

        flush_rx
    }

    /// Non-blocking. Drops and counts if the channel's buffer is full or
    /// unknown.
    pub fn add(&self, channel: &str, item: T) {
        match self.senders.get(channel) {
            Some(sender) => {
                if sender.try_send(item).is_err() {
                    warn!(channel, "batcher channel full, dropping item");
                    metrics::counter!("batcher_dropped_total", "channel" => channel.to_string()).increment(1);
                }
            }
            None => {
                metrics::counter!("batcher_dropped_total", "channel" => "unknown").increment(1);
            }
        }
    }
}

async fn run_flush_loop<T: Clone + Send + 'static>(
    mut item_rx: mpsc::Receiver<T>,
    flush_tx: mpsc::Sender<Vec<T>>,
    config: BatcherConfig,
    channel_name: String,
) {
    let mut buffer: Vec<T> = Vec::with_capacity(config.max_size);
    let mut deadline = Instant::now() + config.window;

    loop {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::select! {
            item = item_rx.recv() => {
                match item {
                    Some(item) => {
                        buffer.push(item);
                        if buffer.len() >= config.max_size {
                            flush(&mut buffer, &flush_tx, &channel_name).await;
                            deadline = Instant::now() + config.window;
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            flush(&mut buffer, &flush_tx, &channel_name).await;
                        }
                        return;
                    }
                }
            }
            _ = sleep => {
                if !buffer.is_empty() {
                    flush(&mut buffer, &flush_tx, &channel_name).await;
                }
                deadline = Instant::now() + config.window;
            }
        }
    }
}

async fn flush<T: Clone + Send + 'static>(buffer: &mut Vec<T>, flush_tx: &mpsc::Sender<Vec<T>>, channel_name: &str) {
    let batch = std::mem::take(buffer);
    let size = batch.len();
    if flush_tx.send(batch).await.is_err() {
        metrics::counter!("batcher_flush_failed_total", "channel" => channel_name.to_string()).increment(1);
    } else {
        metrics::histogram!("batcher_flush_size", "channel" => channel_name.to_string()).record(size as f64);
    }
}

//! In-process message broker backed by tokio channels.

use crate::broker::{Consumer, Delivery, MessageBroker, PublishChannel, Topic, TopicKind};
use crate::error::EnvError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, warn};

/// Buffered messages per fanout consumer before it starts lagging.
const FANOUT_CAPACITY: usize = 1024;

type Registry = Arc<RwLock<HashMap<Topic, TopicHandle>>>;

/// Declared state of one topic.
#[derive(Clone)]
enum TopicHandle {
    Work {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        /// Receiver behind a tokio mutex so competing consumers share it
        rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    },
    Fanout {
        tx: broadcast::Sender<Vec<u8>>,
    },
}

/// Broker living inside one process.
///
/// Work queues are unbounded mpsc channels whose receiver is shared by all
/// consumers, so exactly one of them takes each message. Fanout topics are
/// broadcast channels.
#[derive(Clone, Default)]
pub struct LocalBroker {
    topics: Registry,

    /// Channels opened and not yet closed
    open_channels: Arc<AtomicUsize>,
}

impl LocalBroker {
    /// Creates an empty broker with no declared topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped broker with the full topology declared.
    pub async fn with_topology() -> Result<Arc<Self>, EnvError> {
        let broker = Arc::new(Self::new());
        broker.declare_all().await?;
        Ok(broker)
    }

    /// Returns the number of publishing channels currently open.
    pub fn open_channel_count(&self) -> usize {
        self.open_channels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBroker for LocalBroker {
    async fn declare(&self, topic: Topic) -> Result<(), EnvError> {
        let mut topics = self.topics.write().await;
        if topics.contains_key(&topic) {
            return Ok(());
        }

        let handle = match topic.kind() {
            TopicKind::WorkQueue => {
                let (tx, rx) = mpsc::unbounded_channel();
                TopicHandle::Work {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                }
            }
            TopicKind::Fanout => {
                let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
                TopicHandle::Fanout { tx }
            }
        };
        topics.insert(topic, handle);
        debug!("Declared topic {}", topic);
        Ok(())
    }

    async fn open_channel(&self) -> Result<Box<dyn PublishChannel>, EnvError> {
        self.open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalChannel {
            topics: self.topics.clone(),
            open_channels: self.open_channels.clone(),
            closed: false,
        }))
    }

    async fn consume(&self, topic: Topic) -> Result<Box<dyn Consumer>, EnvError> {
        let topics = self.topics.read().await;
        match topics.get(&topic) {
            Some(TopicHandle::Work { rx, .. }) => Ok(Box::new(WorkConsumer {
                topic,
                rx: rx.clone(),
            })),
            Some(TopicHandle::Fanout { tx }) => Ok(Box::new(FanoutConsumer {
                topic,
                rx: tx.subscribe(),
            })),
            None => Err(EnvError::unknown_topic(topic)),
        }
    }
}

/// Publishing channel handed to one producer.
struct LocalChannel {
    topics: Registry,
    open_channels: Arc<AtomicUsize>,
    closed: bool,
}

impl LocalChannel {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl PublishChannel for LocalChannel {
    async fn publish(&mut self, topic: Topic, payload: Vec<u8>) -> Result<(), EnvError> {
        if self.closed {
            return Err(EnvError::ChannelClosed(topic.to_string()));
        }

        let topics = self.topics.read().await;
        match topics.get(&topic) {
            Some(TopicHandle::Work { tx, .. }) => tx
                .send(payload)
                .map_err(|_| EnvError::broker(format!("queue {} is gone", topic))),
            Some(TopicHandle::Fanout { tx }) => {
                // No bound consumers means nobody is listening yet
                if tx.send(payload).is_err() {
                    debug!("Fanout {} has no consumers, message dropped", topic);
                }
                Ok(())
            }
            None => Err(EnvError::unknown_topic(topic)),
        }
    }

    async fn close(&mut self) -> Result<(), EnvError> {
        self.release();
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.release();
    }
}

struct WorkConsumer {
    topic: Topic,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

#[async_trait]
impl Consumer for WorkConsumer {
    async fn recv(&mut self) -> Option<Delivery> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.map(|payload| Delivery {
            topic: self.topic,
            payload,
        })
    }
}

struct FanoutConsumer {
    topic: Topic,
    rx: broadcast::Receiver<Vec<u8>>,
}

#[async_trait]
impl Consumer for FanoutConsumer {
    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => {
                    return Some(Delivery {
                        topic: self.topic,
                        payload,
                    })
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Consumer on {} lagged, {} messages skipped", self.topic, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = LocalBroker::new();
        broker.declare(Topic::ControlWork).await.unwrap();

        let mut channel = broker.open_channel().await.unwrap();
        channel.publish(Topic::ControlWork, b"one".to_vec()).await.unwrap();

        // Re-declaring must not drop the queued message
        broker.declare(Topic::ControlWork).await.unwrap();
        let mut consumer = broker.consume(Topic::ControlWork).await.unwrap();
        let delivery = consumer.recv().await.unwrap();
        assert_eq!(delivery.payload, b"one".to_vec());
    }

    #[tokio::test]
    async fn test_work_queue_delivers_once() {
        let broker = LocalBroker::with_topology().await.unwrap();
        let mut first = broker.consume(Topic::ControlWork).await.unwrap();
        let mut second = broker.consume(Topic::ControlWork).await.unwrap();

        let mut channel = broker.open_channel().await.unwrap();
        channel.publish(Topic::ControlWork, b"start".to_vec()).await.unwrap();

        let got_first = timeout(Duration::from_millis(50), first.recv()).await;
        let got_second = timeout(Duration::from_millis(50), second.recv()).await;

        let received = [got_first, got_second]
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_consumer() {
        let broker = LocalBroker::with_topology().await.unwrap();
        let mut first = broker.consume(Topic::ControlBroadcast).await.unwrap();
        let mut second = broker.consume(Topic::ControlBroadcast).await.unwrap();

        let mut channel = broker.open_channel().await.unwrap();
        channel.publish(Topic::ControlBroadcast, b"stop".to_vec()).await.unwrap();

        assert_eq!(first.recv().await.unwrap().payload, b"stop".to_vec());
        assert_eq!(second.recv().await.unwrap().payload, b"stop".to_vec());
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_topic_fails() {
        let broker = LocalBroker::new();
        let mut channel = broker.open_channel().await.unwrap();
        let result = channel.publish(Topic::TelemetryEvents, vec![1]).await;
        assert!(matches!(result, Err(EnvError::UnknownTopic(_))));
        assert!(broker.consume(Topic::TelemetryEvents).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_publish() {
        let broker = LocalBroker::with_topology().await.unwrap();
        let mut channel = broker.open_channel().await.unwrap();
        assert_eq!(broker.open_channel_count(), 1);

        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(broker.open_channel_count(), 0);

        let result = channel.publish(Topic::TelemetryPersist, vec![1]).await;
        assert!(matches!(result, Err(EnvError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_dropped_channel_is_released() {
        let broker = LocalBroker::with_topology().await.unwrap();
        {
            let _channel = broker.open_channel().await.unwrap();
            assert_eq!(broker.open_channel_count(), 1);
        }
        assert_eq!(broker.open_channel_count(), 0);
    }
}

use crate::common::Error;
use log::{trace, warn};
use postage::broadcast;
use postage::prelude::{Sink, Stream};
use postage::sink::TrySendError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Receives the payloads broadcast on the topic it was registered for.
pub trait MessageConsumer: Send + Sync {
    fn consume(&self, payload: &[u8]);
}

/// Group messaging as seen by one cluster member.
///
/// Broadcasts reach every member, the sender included.
pub trait ClusteringService: Send + Sync {
    fn process_id(&self) -> &str;

    fn members_in_cluster(&self) -> usize;

    fn multiple_members_in_cluster(&self) -> bool {
        self.members_in_cluster() > 1
    }

    fn add_consumer(&self, topic: &str, consumer: Arc<dyn MessageConsumer>);

    fn send_message(&self, topic: &str, payload: &[u8]) -> Result<(), Error>;
}

const HUB_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct Envelope {
    topic: Arc<str>,
    sender: Arc<str>,
    payload: Arc<[u8]>,
}

struct Hub {
    tx: broadcast::Sender<Envelope>,
    members: AtomicUsize,
    sent: AtomicUsize,
    rt: Handle,
}

type Consumers = Arc<RwLock<HashMap<String, Vec<Arc<dyn MessageConsumer>>>>>;

/// Cluster whose members all live in this process, connected by a broadcast channel.
///
/// Every member delivers messages on its own task of the given runtime.
#[derive(Clone)]
pub struct InProcessCluster {
    hub: Arc<Hub>,
}

impl InProcessCluster {
    pub fn new(rt: Handle) -> Self {
        let (tx, _rx) = broadcast::channel(HUB_CAPACITY);
        InProcessCluster {
            hub: Arc::new(Hub {
                tx,
                members: AtomicUsize::new(0),
                sent: AtomicUsize::new(0),
                rt,
            }),
        }
    }

    pub fn join(&self, process_id: impl Into<String>) -> ClusterMember {
        let process_id = process_id.into();
        let consumers: Consumers = Arc::new(RwLock::new(HashMap::new()));
        let rx = self.hub.tx.subscribe();
        let delivery = self
            .hub
            .rt
            .spawn(deliver(process_id.clone(), rx, consumers.clone()));
        let members = self.hub.members.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("{process_id} joined, {members} member(s)");
        ClusterMember {
            process_id,
            hub: self.hub.clone(),
            consumers,
            delivery,
        }
    }

    pub fn members(&self) -> usize {
        self.hub.members.load(Ordering::SeqCst)
    }

    /// Messages broadcast by all members so far.
    pub fn messages_sent(&self) -> usize {
        self.hub.sent.load(Ordering::SeqCst)
    }
}

async fn deliver(process_id: String, mut rx: broadcast::Receiver<Envelope>, consumers: Consumers) {
    while let Some(envelope) = rx.recv().await {
        let targets = match consumers.read() {
            Ok(consumers) => consumers.get(&*envelope.topic).cloned().unwrap_or_default(),
            Err(_) => {
                warn!("{process_id}: consumer registry poisoned, stopping delivery");
                return;
            }
        };
        trace!(
            "{process_id}: {} byte(s) on {} from {}",
            envelope.payload.len(),
            envelope.topic,
            envelope.sender
        );
        for consumer in targets {
            consumer.consume(&envelope.payload);
        }
    }
}

/// Membership in an [`InProcessCluster`]. Dropping it leaves the cluster.
pub struct ClusterMember {
    process_id: String,
    hub: Arc<Hub>,
    consumers: Consumers,
    delivery: JoinHandle<()>,
}

impl ClusteringService for ClusterMember {
    fn process_id(&self) -> &str {
        &self.process_id
    }

    fn members_in_cluster(&self) -> usize {
        self.hub.members.load(Ordering::SeqCst)
    }

    fn add_consumer(&self, topic: &str, consumer: Arc<dyn MessageConsumer>) {
        let mut consumers = self.consumers.write().unwrap_or_else(|e| e.into_inner());
        consumers.entry(topic.to_string()).or_default().push(consumer);
    }

    fn send_message(&self, topic: &str, payload: &[u8]) -> Result<(), Error> {
        let envelope = Envelope {
            topic: topic.into(),
            sender: self.process_id.as_str().into(),
            payload: payload.into(),
        };
        let mut tx = self.hub.tx.clone();
        tx.try_send(envelope).map_err(|e| match e {
            TrySendError::Pending(_) => Error::Cluster(format!(
                "{}: broadcast buffer is full, message on {topic} dropped",
                self.process_id
            )),
            TrySendError::Rejected(_) => Error::PostageBroadcast,
        })?;
        self.hub.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ClusterMember {
    fn drop(&mut self) {
        self.delivery.abort();
        self.hub.members.fetch_sub(1, Ordering::SeqCst);
        trace!("{} left the cluster", self.process_id);
    }
}

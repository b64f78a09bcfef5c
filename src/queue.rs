//! The worker's single inbound queue.
//!
//! Every watch event lands here as a [Task] carrying the full object, so the
//! worker never has to re-fetch state it already saw. The queue tracks its
//! own depth: publishing is gated on the queue running dry, and a task that
//! hits a retryable error goes back in with exponential backoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Namespace, Node, Pod, Secret, Service,
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::api::{
    ExternalDNS, IngressLink, Ipam, LbPolicy, Route, TLSProfile, TransportServer, VirtualServer,
};

const REQUEUE_BASE_DELAY: Duration = Duration::from_millis(250);
const REQUEUE_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Op {
    Upsert,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ResourceKind {
    Route,
    VirtualServer,
    TransportServer,
    TlsProfile,
    Policy,
    IngressLink,
    ExternalDns,
    Ipam,
    Secret,
    Service,
    Endpoints,
    Pod,
    ConfigMap,
    Node,
    Namespace,
}

impl ResourceKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Route => "Route",
            ResourceKind::VirtualServer => "VirtualServer",
            ResourceKind::TransportServer => "TransportServer",
            ResourceKind::TlsProfile => "TLSProfile",
            ResourceKind::Policy => "Policy",
            ResourceKind::IngressLink => "IngressLink",
            ResourceKind::ExternalDns => "ExternalDNS",
            ResourceKind::Ipam => "IPAM",
            ResourceKind::Secret => "Secret",
            ResourceKind::Service => "Service",
            ResourceKind::Endpoints => "Endpoints",
            ResourceKind::Pod => "Pod",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Node => "Node",
            ResourceKind::Namespace => "Namespace",
        }
    }
}

/// One watched object, as delivered by its watch stream.
#[derive(Clone, Debug)]
pub(crate) enum Payload {
    Route(Box<Route>),
    VirtualServer(Box<VirtualServer>),
    TransportServer(Box<TransportServer>),
    TlsProfile(Box<TLSProfile>),
    Policy(Box<LbPolicy>),
    IngressLink(Box<IngressLink>),
    ExternalDns(Box<ExternalDNS>),
    Ipam(Box<Ipam>),
    Secret(Box<Secret>),
    Service(Box<Service>),
    Endpoints(Box<Endpoints>),
    Pod(Box<Pod>),
    ConfigMap(Box<ConfigMap>),
    Node(Box<Node>),
    Namespace(Box<Namespace>),
}

macro_rules! payload_meta {
    ($self:expr, $method:ident) => {
        match $self {
            Payload::Route(o) => o.metadata.$method.clone(),
            Payload::VirtualServer(o) => o.metadata.$method.clone(),
            Payload::TransportServer(o) => o.metadata.$method.clone(),
            Payload::TlsProfile(o) => o.metadata.$method.clone(),
            Payload::Policy(o) => o.metadata.$method.clone(),
            Payload::IngressLink(o) => o.metadata.$method.clone(),
            Payload::ExternalDns(o) => o.metadata.$method.clone(),
            Payload::Ipam(o) => o.metadata.$method.clone(),
            Payload::Secret(o) => o.metadata.$method.clone(),
            Payload::Service(o) => o.metadata.$method.clone(),
            Payload::Endpoints(o) => o.metadata.$method.clone(),
            Payload::Pod(o) => o.metadata.$method.clone(),
            Payload::ConfigMap(o) => o.metadata.$method.clone(),
            Payload::Node(o) => o.metadata.$method.clone(),
            Payload::Namespace(o) => o.metadata.$method.clone(),
        }
    };
}

impl Payload {
    pub(crate) fn kind(&self) -> ResourceKind {
        match self {
            Payload::Route(_) => ResourceKind::Route,
            Payload::VirtualServer(_) => ResourceKind::VirtualServer,
            Payload::TransportServer(_) => ResourceKind::TransportServer,
            Payload::TlsProfile(_) => ResourceKind::TlsProfile,
            Payload::Policy(_) => ResourceKind::Policy,
            Payload::IngressLink(_) => ResourceKind::IngressLink,
            Payload::ExternalDns(_) => ResourceKind::ExternalDns,
            Payload::Ipam(_) => ResourceKind::Ipam,
            Payload::Secret(_) => ResourceKind::Secret,
            Payload::Service(_) => ResourceKind::Service,
            Payload::Endpoints(_) => ResourceKind::Endpoints,
            Payload::Pod(_) => ResourceKind::Pod,
            Payload::ConfigMap(_) => ResourceKind::ConfigMap,
            Payload::Node(_) => ResourceKind::Node,
            Payload::Namespace(_) => ResourceKind::Namespace,
        }
    }

    pub(crate) fn name(&self) -> String {
        payload_meta!(self, name).unwrap_or_default()
    }

    pub(crate) fn namespace(&self) -> String {
        payload_meta!(self, namespace).unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Task {
    pub op: Op,
    pub payload: Payload,
    pub retries: u32,
}

impl Task {
    pub(crate) fn upsert(payload: Payload) -> Self {
        Task {
            op: Op::Upsert,
            payload,
            retries: 0,
        }
    }

    pub(crate) fn delete(payload: Payload) -> Self {
        Task {
            op: Op::Delete,
            payload,
            retries: 0,
        }
    }
}

pub(crate) fn channel() -> (TaskQueue, TaskReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        TaskQueue {
            tx,
            depth: depth.clone(),
        },
        TaskReceiver { rx, depth },
    )
}

#[derive(Clone)]
pub(crate) struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
    depth: Arc<AtomicUsize>,
}

impl TaskQueue {
    pub(crate) fn push(&self, task: Task) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("queue.depth").increment(1.0);
        if self.tx.send(task).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            metrics::gauge!("queue.depth").decrement(1.0);
            warn!("task dropped: worker queue is closed");
        }
    }

    /// Put a task back after a retryable failure, delayed by an exponential
    /// backoff on its retry count.
    pub(crate) fn requeue(&self, mut task: Task) {
        let delay = REQUEUE_BASE_DELAY
            .saturating_mul(1u32 << task.retries.min(16))
            .min(REQUEUE_MAX_DELAY);
        task.retries += 1;
        metrics::counter!("queue.requeued").increment(1);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(task);
        });
    }
}

pub(crate) struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Task>,
    depth: Arc<AtomicUsize>,
}

impl TaskReceiver {
    pub(crate) async fn next(&mut self) -> Option<Task> {
        let task = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!("queue.depth").decrement(1.0);
        Some(task)
    }

    /// True when no task is queued or in flight. Used as the publish gate:
    /// a drained queue means the store reflects every event seen so far.
    pub(crate) fn is_drained(&self) -> bool {
        self.depth.load(Ordering::SeqCst) == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn service_task() -> Task {
        let mut svc = Service::default();
        svc.metadata.namespace = Some("default".to_string());
        svc.metadata.name = Some("svc1".to_string());
        Task::upsert(Payload::Service(Box::new(svc)))
    }

    #[tokio::test]
    async fn test_depth_tracks_push_and_pop() {
        let (queue, mut rx) = channel();
        assert!(rx.is_drained());

        queue.push(service_task());
        queue.push(service_task());
        assert!(!rx.is_drained());

        let task = rx.next().await.unwrap();
        assert_eq!(task.payload.kind(), ResourceKind::Service);
        assert_eq!(task.payload.namespace(), "default");
        assert!(!rx.is_drained());

        rx.next().await.unwrap();
        assert!(rx.is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_backs_off() {
        let (queue, mut rx) = channel();
        queue.requeue(service_task());

        // nothing arrives until the backoff elapses
        assert!(rx.is_drained());
        tokio::time::sleep(REQUEUE_BASE_DELAY * 2).await;
        let task = rx.next().await.unwrap();
        assert_eq!(task.retries, 1);
    }
}

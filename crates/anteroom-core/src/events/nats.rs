//! NATS-backed event publisher.
//!
//! The core hands events to a bounded channel and moves on; a dedicated
//! publisher thread owns the NATS connection, retries with exponential
//! backoff while the bus is unreachable, and buffers up to a bounded count
//! in the meantime, dropping the oldest beyond it. The publishing path can
//! therefore never block or fail an enqueue, heartbeat, or admission.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::{Event, EventSink};

#[derive(Debug, Clone)]
pub struct NatsPublisherConfig {
    pub url: String,
    /// Upper bound on buffered events while the bus is unreachable.
    pub buffer_capacity: usize,
    /// First reconnect backoff step; doubles up to `retry_max`.
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl NatsPublisherConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            buffer_capacity: 10_000,
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(5),
        }
    }
}

enum WorkerMsg {
    Publish(Box<Event>),
    Shutdown { deadline: Instant },
}

/// At-least-once publisher onto NATS subjects, fed through a bounded
/// channel from any number of core components.
pub struct NatsPublisher {
    tx: Sender<WorkerMsg>,
    worker: std::sync::Mutex<Option<thread::JoinHandle<()>>>,
}

impl NatsPublisher {
    /// Spawn the publisher thread. Bus connection failures are not fatal
    /// here: the worker keeps retrying in the background and buffers
    /// meanwhile.
    pub fn spawn(config: NatsPublisherConfig) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<WorkerMsg>(config.buffer_capacity.max(1));
        let handle = thread::Builder::new()
            .name("anteroom-events".to_string())
            .spawn(move || Worker::new(config, rx).run())?;
        Ok(Self {
            tx,
            worker: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// Flush what the grace window allows, then stop the worker. Safe to
    /// call while other handles still publish; their events are dropped
    /// once the worker is gone.
    pub fn shutdown(&self, grace: Duration) {
        let _ = self.tx.send(WorkerMsg::Shutdown {
            deadline: Instant::now() + grace,
        });
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl EventSink for NatsPublisher {
    fn publish(&self, event: Event) {
        // Full channel means the worker is hopelessly behind; shed the new
        // event rather than block the core.
        if self.tx.try_send(WorkerMsg::Publish(Box::new(event))).is_err() {
            warn!("event channel full, dropping event");
        }
    }
}

impl Drop for NatsPublisher {
    fn drop(&mut self) {
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            let _ = self.tx.send(WorkerMsg::Shutdown {
                deadline: Instant::now() + Duration::from_secs(1),
            });
            let _ = handle.join();
        }
    }
}

struct Worker {
    config: NatsPublisherConfig,
    rx: Receiver<WorkerMsg>,
    conn: Option<nats::Connection>,
    backoff: Duration,
    next_connect: Instant,
    /// Pending (subject, payload) pairs, oldest first.
    buffer: VecDeque<(String, Vec<u8>)>,
    dropped: u64,
}

impl Worker {
    fn new(config: NatsPublisherConfig, rx: Receiver<WorkerMsg>) -> Self {
        let backoff = config.retry_base;
        Self {
            config,
            rx,
            conn: None,
            backoff,
            next_connect: Instant::now(),
            buffer: VecDeque::new(),
            dropped: 0,
        }
    }

    fn run(mut self) {
        info!(url = %self.config.url, "event publisher started");
        loop {
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(WorkerMsg::Publish(event)) => {
                    self.buffer_event(&event);
                    self.drain();
                }
                Ok(WorkerMsg::Shutdown { deadline }) => {
                    self.flush_until(deadline);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => self.drain(),
                Err(RecvTimeoutError::Disconnected) => {
                    self.flush_until(Instant::now() + Duration::from_secs(1));
                    break;
                }
            }
        }
        if self.dropped > 0 {
            warn!(dropped = self.dropped, "event publisher dropped events");
        }
        info!("event publisher stopped");
    }

    fn buffer_event(&mut self, event: &Event) {
        match serde_json::to_vec(event) {
            Ok(payload) => {
                self.buffer
                    .push_back((event.event_type.subject().to_string(), payload));
                while self.buffer.len() > self.config.buffer_capacity {
                    self.buffer.pop_front();
                    self.dropped += 1;
                }
            }
            Err(err) => warn!(%err, "failed to serialize event"),
        }
    }

    fn ensure_connected(&mut self) -> bool {
        if self.conn.is_some() {
            return true;
        }
        if Instant::now() < self.next_connect {
            return false;
        }
        match nats::connect(&self.config.url) {
            Ok(conn) => {
                info!(url = %self.config.url, "connected to event bus");
                self.conn = Some(conn);
                self.backoff = self.config.retry_base;
                true
            }
            Err(err) => {
                debug!(%err, backoff = ?self.backoff, "event bus unreachable");
                self.next_connect = Instant::now() + self.backoff;
                self.backoff = (self.backoff * 2).min(self.config.retry_max);
                false
            }
        }
    }

    /// Publish buffered events in order until the buffer empties or the
    /// connection fails again.
    fn drain(&mut self) {
        if self.buffer.is_empty() || !self.ensure_connected() {
            return;
        }
        while let Some((subject, payload)) = self.buffer.front() {
            let Some(conn) = self.conn.as_ref() else { break };
            match conn.publish(subject, payload) {
                Ok(()) => {
                    self.buffer.pop_front();
                }
                Err(err) => {
                    warn!(%err, "publish failed, reconnecting");
                    self.conn = None;
                    self.next_connect = Instant::now() + self.backoff;
                    self.backoff = (self.backoff * 2).min(self.config.retry_max);
                    break;
                }
            }
        }
    }

    fn flush_until(&mut self, deadline: Instant) {
        // Absorb anything already queued on the channel, then drain within
        // the grace window.
        while let Ok(msg) = self.rx.try_recv() {
            if let WorkerMsg::Publish(event) = msg {
                self.buffer_event(&event);
            }
        }
        while !self.buffer.is_empty() && Instant::now() < deadline {
            self.drain();
            if !self.buffer.is_empty() {
                thread::sleep(Duration::from_millis(20));
            }
        }
        if let Some(conn) = self.conn.take() {
            let _ = conn.flush();
        }
        if !self.buffer.is_empty() {
            warn!(
                pending = self.buffer.len(),
                "shutdown grace elapsed with events still buffered"
            );
        }
    }
}

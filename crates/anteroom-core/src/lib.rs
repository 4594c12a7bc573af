pub mod admission;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod credential;
pub mod engine;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod position;
pub mod queue;
pub mod reaper;
pub mod session;
pub mod sessions;
pub mod store;
pub mod telemetry;

pub use admission::AdmissionController;
pub use catalog::{QueueCatalog, QueueStats};
pub use config::Config;
pub use credential::{Claims, CredentialKind, CredentialService, IssuedCredential, KeyRing};
pub use engine::{EnqueueReceipt, EnqueueRequest, PositionView, QueueEngine};
pub use error::{
    AdminError, AdmitError, ConfigError, CredentialError, EnqueueError, PositionError,
    SessionError, StoreError, StoreResult,
};
pub use events::{Event, EventSink, EventType, Events, MemorySink, NatsPublisher, NatsPublisherConfig};
pub use fingerprint::Fingerprinter;
pub use position::{Position, PositionStatus, Priority};
pub use queue::{QueueDescriptor, QueuePatch, QueueState};
pub use reaper::Reaper;
pub use session::{ActiveSession, SessionStatus};
pub use sessions::SessionManager;
pub use store::{MemoryStore, RedisStore, Store};

//! Substrate services: the API surface agents call.

pub mod analytics;
pub mod deferred;
pub mod hive;
pub mod lock;
pub mod mailbox;
pub mod memory;
pub mod replay;
pub mod reservations;
pub mod smart_ops;
pub mod snapshot;

pub use analytics::{format_result, run_query, AnalyticsQuery, OutputFormat, QueryBuilder, QueryResult};
pub use deferred::{Deferred, DeferredConfig, DeferredManager};
pub use hive::{CellFilter, CellPatch, Hive};
pub use lock::{LockConfig, LockHandle, LockManager, LockOptions};
pub use mailbox::{
    InboxOutcome, InboxQuery, InitOutcome, MailConfig, Mailbox, SendMessage, SendOutcome,
    Session, SessionRegistry,
};
pub use memory::{
    MemoryConfig, MemoryStore, NewMemory, SearchOptions, StoreOptions, UpsertOptions,
    UpsertOutcome,
};
pub use replay::{Replay, ReplayFilter, ReplayPlayer, ReplaySpeed, TimedEvent};
pub use reservations::{
    ReleaseOutcome, ReleaseRequest, ReservationConfig, Reservations, ReserveOutcome,
    ReserveRequest,
};
pub use smart_ops::{SmartOp, SmartOpDecider, SmartOpDecision};
pub use snapshot::{export_memories, import_memories, serialize_cells, serialize_memories, ImportReport, MemoryExport};

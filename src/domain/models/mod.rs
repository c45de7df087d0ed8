//! Core domain models.

pub mod agent;
pub mod cell;
pub mod event;
pub mod memory;
pub mod message;
pub mod reservation;

pub use agent::{generate_agent_name, Agent};
pub use cell::{
    generate_cell_id, project_hash6, slugify, Cell, CellComment, CellDependency, CellStatus,
    CellType, NewCell,
};
pub use event::{
    CellRelationship, Event, EventFamily, EventPayload, EventStream, Importance,
};
pub use memory::{
    Entity, EntityRelationship, EntityType, LinkType, Memory, MemoryLink, ScoredMemory,
    BASE_HALF_LIFE_DAYS, EMBEDDING_DIM,
};
pub use message::{Message, MessageRecipient, MessageSummary};
pub use reservation::{patterns_intersect, Reservation, ReservationConflict};

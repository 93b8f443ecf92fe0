pub mod channel;
pub mod compliance;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod limiter;
pub mod memory;
pub mod pg_store;
pub mod schema;
pub mod store;
pub mod types;

pub use channel::{ChannelAdapter, SendOutcome};
pub use compliance::{
    CapLimit, ContactComplianceCounters, Decision, Denial, QuietHours, TrainerComplianceConfig,
};
pub use config::Config;
pub use context::OutreachContext;
pub use db::DbPool;
pub use error::{QueueError, TransitionError, ValidationError};
pub use limiter::{ApprovalRateLimiter, RedisApprovalLimiter, RedisPool};
pub use memory::{MemoryApprovalLimiter, MemoryStore};
pub use pg_store::PgMessageStore;
pub use store::{MessageStore, MessageUpdate};
pub use types::{Channel, Contact, Message, MessageStatus, NewTrainerEdit, TrainerEdit};

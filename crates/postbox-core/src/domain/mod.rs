//! Domain model (ids, messages, outbox entries, request context).

pub mod context;
pub mod entry;
pub mod ids;
pub mod message;

pub use self::context::{Args, Page, RequestContext};
pub use self::entry::{EntryState, OutboxEntry};
pub use self::ids::{BatchId, MessageId, Topic};
pub use self::message::{Bag, Message, MessageBody, MessageHeader, MessageType};

// crates/weavecore/src/events/mod.rs

mod base;
mod redact;

pub use base::{
    EventEmitter, EventKind, EventPublisher, EventStream, ExecutionEvent, ExecutionId,
    ExecutionSubscription,
};
pub use redact::{Redactor, MIN_SECRET_LEN, REDACTED};

mod client;

pub use client::{ApiErrorClass, EntryKind, LogEntry, LogServerClient, LogServerError};

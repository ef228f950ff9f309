pub mod backoff;
pub mod dispatch;
pub mod engine;
pub mod localfs;
pub mod model;
pub mod paths;
pub mod reconcile;
pub mod tickets;
pub mod transfer;

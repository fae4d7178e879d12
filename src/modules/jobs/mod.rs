pub mod dequeue;
pub mod enqueuer;
pub mod handler;
pub mod lease;
pub mod model;
pub mod recovery;
pub mod store;

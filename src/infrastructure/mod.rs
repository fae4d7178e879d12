pub mod catalog;
pub mod redis;
pub mod store;
pub mod transcoder;

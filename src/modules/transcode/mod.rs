pub mod handler;
pub mod policy;

pub mod notify;
pub mod scanner;

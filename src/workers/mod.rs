pub mod metrics;
pub mod middleware;
pub mod pool;

use redis::{Client, aio::MultiplexedConnection};
use tracing::info;

#[derive(Clone)]
pub struct RedisService {
    client: Client,
    shared: MultiplexedConnection,
}

impl RedisService {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = Client::open(connection_string)?;

        let shared = client.get_multiplexed_async_connection().await?;

        info!("✅ Connected to Redis");
        Ok(Self { client, shared })
    }

    /// Cheap handle onto the shared pipelined connection.
    pub fn get_conn(&self) -> MultiplexedConnection {
        self.shared.clone()
    }

    /// A connection of its own, for blocking commands that would otherwise stall
    /// every caller sharing the pipelined one.
    pub async fn dedicated_conn(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }
}

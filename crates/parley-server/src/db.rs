use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Connect to the room directory database.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

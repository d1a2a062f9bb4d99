//! Example Worker - Entry Point
//!
//! Processes jobs from the `example` queue and serves the admin endpoints.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    jobs_example_worker::run().await
}

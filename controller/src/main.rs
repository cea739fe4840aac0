mod host;
mod learning;
mod mqtt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

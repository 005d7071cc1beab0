#[tokio::main]
async fn main() -> anyhow::Result<()> {
    classroom_gateway::run().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = gradi_progress::run().await {
        eprintln!("gradi-progress fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

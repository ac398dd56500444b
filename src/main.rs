use stress_test::{simulate_feed, simulate_publishing, simulate_scaling};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())?;
    Ok(())
}

async fn async_main() -> plebsync_sdk::Result<()> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            CLIENT SIMULATIONS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: One subplebbit, a handful of pages
    let stats = simulate_feed(1, 4, 100, 20).await?;
    stats.print();

    // Test 2: A merged feed over several subplebbits
    let stats = simulate_feed(8, 4, 50, 40).await?;
    stats.print();

    // Test 3: Publishing through challenges, every answer right
    let stats = simulate_publishing(50, 0.0).await?;
    stats.print();

    // Test 4: Publishing with wrong answers that have to be retried
    let stats = simulate_publishing(50, 0.3).await?;
    stats.print();

    // Test 5: Scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS (Feeds)                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    simulate_scaling(16, 4).await?;

    println!("\n✓ All simulations completed successfully!");
    Ok(())
}

use arbiter::{
    test_utils::{owners, spawn_contenders, Contender},
    ArbiterConfig, Baton, InMemoryStore,
};
use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};

// Runs on a paused clock, so every scenario completes instantly while
// reporting the simulated timeline.
#[tokio::main(flavor = "current_thread", start_paused = true)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("Virtual baton demo");
    println!("==================\n");

    demo_uncontested_claim().await?;
    demo_graceful_handoff().await?;
    demo_crash_recovery().await?;
    demo_contention().await?;

    Ok(())
}

fn config() -> ArbiterConfig {
    ArbiterConfig {
        poll_interval_ms: 1_000,
        settle_delay_ms: 500,
        renewal_interval_ms: 2_000,
        lease_extension_ms: 5_000,
        ..ArbiterConfig::new("io.highfidelity.fishtank")
    }
}

fn report(start: Instant, contenders: &[Contender]) {
    let elapsed = start.elapsed().as_millis();
    for c in contenders {
        println!("  t={elapsed:>6}ms  {:<4} {}", c.label, c.state());
    }
}

async fn demo_uncontested_claim() -> Result<(), Box<dyn std::error::Error>> {
    println!("1. Uncontested claim");
    let store = Arc::new(InMemoryStore::new());
    let start = Instant::now();
    let contenders = spawn_contenders(&["solo"], &store, &config())?;

    sleep_until(start + Duration::from_millis(1_600)).await;
    report(start, &contenders);
    if let Some(at) = contenders[0].log.last_gained_at() {
        println!("  gained ownership after {}ms\n", (at - start).as_millis());
    }
    Ok(())
}

async fn demo_graceful_handoff() -> Result<(), Box<dyn std::error::Error>> {
    println!("2. Graceful handoff");
    let store = Arc::new(InMemoryStore::new());
    let start = Instant::now();
    let contenders = spawn_contenders(&["A", "B"], &store, &config())?;

    sleep_until(start + Duration::from_millis(4_000)).await;
    report(start, &contenders);

    if let Some(owner) = owners(&contenders).first() {
        println!("  {} releases the baton", owner.label);
        owner.arbiter.destroy().await;
    }
    sleep_until(start + Duration::from_millis(5_600)).await;
    report(start, &contenders);
    println!();
    Ok(())
}

async fn demo_crash_recovery() -> Result<(), Box<dyn std::error::Error>> {
    println!("3. Crash recovery");
    let store = Arc::new(InMemoryStore::new());
    let start = Instant::now();
    let mut contenders = spawn_contenders(&["A", "B"], &store, &config())?;

    sleep_until(start + Duration::from_millis(10_000)).await;
    report(start, &contenders);
    let Some(index) = contenders.iter().position(|c| c.arbiter.is_owner()) else {
        return Ok(());
    };
    let crashed = contenders.remove(index);
    let expires_at = crashed.arbiter.token().map(|t| t.expires_at());
    println!("  {} crashes without releasing", crashed.label);
    drop(crashed);

    if let Some(expires_at) = expires_at {
        println!("  its lease runs out at t={}ms", (expires_at - start).as_millis());
    }
    sleep_until(start + Duration::from_millis(18_000)).await;
    report(start, &contenders);
    if let Some(at) = contenders[0].log.last_gained_at() {
        println!("  {} took over at t={}ms\n", contenders[0].label, (at - start).as_millis());
    }
    Ok(())
}

async fn demo_contention() -> Result<(), Box<dyn std::error::Error>> {
    println!("4. Eight simultaneous claims, 200ms propagation delay");
    let store = Arc::new(InMemoryStore::with_propagation_delay(Duration::from_millis(200)));
    let start = Instant::now();
    let labels = ["p0", "p1", "p2", "p3", "p4", "p5", "p6", "p7"];
    let config = ArbiterConfig {
        jitter: 0.1,
        ..config()
    };
    let contenders = spawn_contenders(&labels, &store, &config)?;

    sleep_until(start + Duration::from_millis(10_000)).await;
    let winners: Vec<_> = owners(&contenders).iter().map(|c| c.label.clone()).collect();
    println!("  owners after 10s: {winners:?}");
    println!("  store operations: {:?}", store.stats());
    Ok(())
}

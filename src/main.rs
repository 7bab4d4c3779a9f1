use simple_snapshot::common::SimError;
use simple_snapshot::sim::Simulator;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Three servers in a ring, some traffic in flight, one global snapshot.
fn main() -> Result<(), SimError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut sim = Simulator::new(42);
    for id in ["A", "B", "C"] {
        sim.add_server(id, 10);
    }
    sim.add_forward_link("A", "B")?;
    sim.add_forward_link("B", "C")?;
    sim.add_forward_link("C", "A")?;

    sim.send_tokens("A", 5, "B")?;
    sim.send_tokens("C", 2, "A")?;
    let snapshot_id = sim.start_snapshot("A")?;
    sim.send_tokens("B", 1, "C")?;

    let snapshot = sim.collect_snapshot(snapshot_id)?;
    for (server, tokens) in &snapshot.tokens {
        info!(%server, tokens = *tokens, "recorded balance");
    }
    for message in &snapshot.messages {
        info!(
            src = %message.src,
            dest = %message.dest,
            tokens = message.message.num_tokens,
            "recorded in-flight transfer"
        );
    }
    info!(
        total = snapshot.total_tokens(),
        ticks = sim.time(),
        "snapshot accounts for every token"
    );
    Ok(())
}

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;

use vpro_netgen::{nets, VproConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let name = match args.next() {
        Some(n) => n,
        None => {
            let mut known: Vec<&str> = nets::registry().keys().copied().collect();
            known.sort();
            bail!("usage: netgen <net-class-name>\nknown nets: {}", known.join(", "));
        }
    };

    let mut net = nets::instantiate(&name, VproConfig::default())
        .with_context(|| format!("instantiating net '{name}'"))?;
    net.generate()
        .with_context(|| format!("generating net '{name}'"))?;
    Ok(())
}

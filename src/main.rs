use group_membership::config::StackConfig;
use group_membership::failure_detector::FailureDetector;
use group_membership::merge::MergeDetector;
use group_membership::stack::{Address, Event, Protocol, ProtocolStack, TimeScheduler, View};
use group_membership::transport::UdpTransport;
use group_membership::verifier::SuspectVerifier;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const GROUP: &str = "membership-demo";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--peer <addr:port>]... [--config <file.toml>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:7800", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:7801 --peer 127.0.0.1:7800",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut peers: Vec<SocketAddr> = vec![];
    let mut config_path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind", Some(value)) => {
                bind_addr = Some(value.parse()?);
                i += 2;
            }
            ("--peer", Some(value)) => {
                peers.push(value.parse()?);
                i += 2;
            }
            ("--config", Some(value)) => {
                config_path = Some(value.clone());
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let Some(bind_addr) = bind_addr else {
        anyhow::bail!("--bind is required");
    };

    let mut config = match config_path {
        Some(path) => StackConfig::load(&path)?,
        None => StackConfig::default(),
    };
    config.transport.bind = bind_addr;
    config.transport.initial_hosts.extend(peers.iter().copied());

    tracing::info!("Starting node on {}", bind_addr);
    if peers.is_empty() {
        tracing::info!("No peers given, running as a single-member group");
    } else {
        tracing::info!("Peers: {:?}", peers);
    }

    // 1. Layers, top to bottom:
    let timer = TimeScheduler::new();
    let merge = MergeDetector::new(config.merge.clone(), timer.clone());
    let verifier = SuspectVerifier::new(config.verifier.clone());
    let failure_detector = FailureDetector::new(config.failure_detector.clone(), timer.clone());
    let transport = UdpTransport::new(&config.transport);

    let (stack, mut events) = ProtocolStack::new(
        vec![
            merge.clone() as Arc<dyn Protocol>,
            verifier as Arc<dyn Protocol>,
            failure_detector.clone() as Arc<dyn Protocol>,
            transport.clone() as Arc<dyn Protocol>,
        ],
        timer,
    )?;

    // 2. Join with a static view, sorted so every node agrees on the coordinator:
    let local = transport.address();
    stack.set_local_address(local.clone());
    stack.connect(GROUP);

    let mut members: Vec<Address> = peers
        .iter()
        .map(|peer| Address::new(peer.to_string()))
        .collect();
    members.push(local.clone());
    members.sort();
    let view = View::new(members);
    tracing::info!("Installing view {:?} (coordinator: {:?})", view.members(), view.coordinator());
    stack.install_view(view);

    // 3. Spawn event logger:
    tokio::spawn(async move {
        while let Some(evt) = events.recv().await {
            match evt {
                Event::Suspect(mbr) => tracing::warn!("SUSPECT {}", mbr),
                Event::Unsuspect(mbr) => tracing::info!("UNSUSPECT {}", mbr),
                Event::Merge(coords) => tracing::warn!("MERGE {:?}", coords),
                other => tracing::debug!("{} received", other.kind()),
            }
        }
    });

    // 4. Spawn stats reporter:
    let stats_fd = failure_detector.clone();
    let stats_merge = merge.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            tracing::info!(
                "Stats: monitoring={:?} watched_by={:?} pingable={} suspect_events={} coordinator={}",
                stats_fd.ping_dest(),
                stats_fd.monitoring_peers(),
                stats_fd.pingable_members().len(),
                stats_fd.num_suspect_events(),
                stats_merge.is_coordinator()
            );
            for mbr in stats_fd.suspect_history() {
                tracing::info!("  - suspected {}", mbr);
            }
        }
    });

    tracing::info!("Node {} running, press Ctrl+C to shutdown", local);
    tokio::signal::ctrl_c().await?;

    stack.stop();
    // Give client handlers a moment to deliver the termination byte.
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}

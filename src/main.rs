use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use pmtud::constants::{DEFAULT_PHYSICAL_LINK_MTU, DEFAULT_PROBE_FWMARK, MAX_PROBE_MTU, MIN_IPV4_MTU};
use pmtud::firewall::{Firewall, Iptables, NoopFirewall};
use pmtud::net::SystemNetwork;
use pmtud::{route, DiscoverOptions, Discoverer};

#[derive(Parser)]
#[command(version, about = "Find the largest packet that gets through to a host, without trusting ICMP")]
struct Cli {
    /// Send ICMP echo requests to ADDR first, may be repeated
    #[arg(long = "icmp", value_name = "ADDR")]
    icmp_targets: Vec<IpAddr>,

    /// Then run raw TCP handshakes against ADDR:PORT, may be repeated
    #[arg(long = "tcp", value_name = "ADDR:PORT")]
    tcp_targets: Vec<SocketAddr>,

    /// MTU of the local link [default: MTU of the interface routing to the first target]
    #[arg(long, value_parser = clap::value_parser!(u32).range(MIN_IPV4_MTU as i64..=MAX_PROBE_MTU as i64))]
    link_mtu: Option<u32>,

    /// Time each round of probes gets, in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout: u64,

    /// Give up after this many seconds in total
    #[arg(long, value_name = "SECS")]
    max_time: Option<u64>,

    /// Mark on probe packets, so the RST suppression rules let our own RSTs out
    #[arg(long, default_value_t = DEFAULT_PROBE_FWMARK)]
    fwmark: u32,

    /// Leave iptables alone, the kernel's RSTs are already taken care of
    #[arg(long)]
    no_firewall: bool,

    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

fn link_mtu(cli: &Cli) -> u32 {
    if let Some(mtu) = cli.link_mtu {
        return mtu;
    }
    let first = cli.icmp_targets.first().copied()
        .or(cli.tcp_targets.first().map(|x| x.ip()));
    let Some(dst) = first else {
        return DEFAULT_PHYSICAL_LINK_MTU;
    };
    match route::link_mtu_for(dst) {
        Ok(Some(mtu)) => mtu.min(MAX_PROBE_MTU),
        Ok(None) => DEFAULT_PHYSICAL_LINK_MTU,
        Err(e) => {
            warn!("Cannot find the link MTU towards {dst}, assuming {DEFAULT_PHYSICAL_LINK_MTU}: {e}");
            DEFAULT_PHYSICAL_LINK_MTU
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    simple_logger::SimpleLogger::new()
        .with_level(cli.verbose.log_level_filter())
        .init()?;

    if cli.icmp_targets.is_empty() && cli.tcp_targets.is_empty() {
        anyhow::bail!("Nothing to probe, give at least one --icmp or --tcp target");
    }

    let options = DiscoverOptions {
        physical_link_mtu: link_mtu(&cli),
        per_try_timeout: Duration::from_millis(cli.timeout),
        fwmark: cli.fwmark,
        deadline: cli.max_time.map(|secs| Instant::now() + Duration::from_secs(secs)),
    };
    info!("Probing with ceiling {}", options.physical_link_mtu);

    let network = SystemNetwork::new(options.fwmark);
    let firewall: Box<dyn Firewall> = if cli.no_firewall { Box::new(NoopFirewall) } else { Box::new(Iptables) };
    let mtu = Discoverer::new(&network, firewall.as_ref(), options)
        .discover(&cli.icmp_targets, &cli.tcp_targets)
        .context("Path MTU discovery failed")?;

    println!("{mtu}");
    Ok(())
}

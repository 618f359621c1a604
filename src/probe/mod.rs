//! ICMP probing.

pub mod stats;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use surge_ping::{Client, Config as PingConfig, PingIdentifier, PingSequence, SurgeError, ICMP};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::model::{IpVersion, Measurement, PingTarget};
use stats::RttStats;

/// Echo payload size, matching the common `ping` default.
const PAYLOAD: [u8; 56] = [0; 56];

/// Probes a single target. Never fails: problems are reported through
/// [`Measurement::error`].
pub trait Prober: Send + Sync + 'static {
    fn probe(&self, target: &PingTarget) -> impl Future<Output = Measurement> + Send;
}

/// ICMP echo prober.
///
/// Sends `count` echo requests spaced `interval` apart. Every request must
/// be answered before the overall `timeout` measured from the first send;
/// unanswered requests count as lost.
pub struct IcmpProber {
    v4: Client,
    v6: Option<Client>,
    count: u16,
    interval: Duration,
    timeout: Duration,
    ident: AtomicU16,
}

impl IcmpProber {
    /// Opens the ICMP sockets. Must run inside a tokio runtime.
    pub fn new(cfg: &ProbeConfig) -> Result<Self> {
        let v4 = Client::new(&PingConfig::builder().kind(ICMP::V4).build())
            .context("opening ICMPv4 socket")?;

        let v6 = match Client::new(&PingConfig::builder().kind(ICMP::V6).build()) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "ICMPv6 socket unavailable, IPv6 targets will fail");
                None
            }
        };

        Ok(Self {
            v4,
            v6,
            count: cfg.count,
            interval: cfg.interval,
            timeout: cfg.timeout,
            ident: AtomicU16::new(std::process::id() as u16),
        })
    }

    fn client_for(&self, addr: IpAddr) -> Option<&Client> {
        match addr {
            IpAddr::V4(_) => Some(&self.v4),
            IpAddr::V6(_) => self.v6.as_ref(),
        }
    }
}

impl Prober for IcmpProber {
    async fn probe(&self, target: &PingTarget) -> Measurement {
        let addr = match resolve(&target.ip).await {
            Ok(addr) => addr,
            Err(e) => return Measurement::failed(target.clone(), format!("{e:#}")),
        };

        let source_ip = source_ip_for(addr);

        let client = match self.client_for(addr) {
            Some(client) => client.clone(),
            None => {
                let mut m = Measurement::failed(target.clone(), "ICMPv6 is not available");
                m.source_ip = source_ip;
                return m;
            }
        };

        let ident = self.ident.fetch_add(1, Ordering::Relaxed);

        // Requests go out on schedule regardless of earlier replies.
        let mut rounds = JoinSet::new();
        for seq in 0..self.count {
            let offset = self.interval * u32::from(seq);
            if seq > 0 && offset >= self.timeout {
                break;
            }

            let client = client.clone();
            let remaining = self.timeout - offset;
            rounds.spawn(async move {
                tokio::time::sleep(offset).await;
                let mut pinger = client.pinger(addr, PingIdentifier(ident)).await;
                pinger.timeout(remaining);
                pinger.ping(PingSequence(seq), &PAYLOAD).await
            });
        }

        let sent = rounds.len() as u32;
        let mut samples = Vec::with_capacity(sent as usize);
        let mut error = None;

        while let Some(joined) = rounds.join_next().await {
            match joined {
                Ok(Ok((_packet, rtt))) => samples.push(rtt),
                Ok(Err(SurgeError::Timeout { .. })) => {}
                Ok(Err(e)) => {
                    error.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    error.get_or_insert_with(|| format!("probe task failed: {e}"));
                }
            }
        }

        let stats = RttStats::from_samples(&samples);

        debug!(
            target = %target.ip,
            sent,
            recv = samples.len(),
            avg_ms = stats.avg,
            "probe finished",
        );

        Measurement {
            target: target.clone(),
            source_ip,
            ip_version: IpVersion::from(addr),
            packets_sent: sent,
            packets_recv: samples.len() as u32,
            rtt_min: stats.min,
            rtt_max: stats.max,
            rtt_avg: stats.avg,
            rtt_std_dev: stats.std_dev,
            error,
            timestamp: SystemTime::now(),
        }
    }
}

/// Accepts a literal address or resolves a host name.
async fn resolve(host: &str) -> Result<IpAddr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }

    tokio::net::lookup_host((host, 0))
        .await
        .with_context(|| format!("resolving {host}"))?
        .next()
        .map(|sa| sa.ip())
        .with_context(|| format!("no addresses for {host}"))
}

/// Local address the kernel would route packets to `target` from.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn source_ip_for(target: IpAddr) -> String {
    let bind: SocketAddr = match target {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let local = UdpSocket::bind(bind)
        .and_then(|sock| {
            sock.connect((target, 9))?;
            sock.local_addr()
        })
        .map(|addr| addr.ip());

    match local {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            debug!(target = %target, error = %e, "no route to target");
            bind.ip().to_string()
        }
    }
}

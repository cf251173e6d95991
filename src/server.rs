use crate::clock::ClockSource;
use crate::config::Config;
use crate::wire::{self, PtpMessageType, PtpTimestamp};
use anyhow::{Context, Result};
use std::cell::Cell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Parses a dotted address plus port into a `SocketAddr`, kept as a free
/// function so it can be exercised without a bound socket.
fn resolve_target(address: &str, port: u16) -> Result<SocketAddr> {
    format!("{address}:{port}")
        .parse()
        .with_context(|| format!("invalid address: {address}"))
}

/// Picks the broadcast destination: the multicast group normally, or a
/// unicast peer when the local adapter is loopback, since loopback
/// interfaces don't carry multicast traffic (spec §4.E).
fn broadcast_target(local_is_loopback: bool, loopback_peer: IpAddr, multicast_group: SocketAddr) -> SocketAddr {
    if local_is_loopback {
        SocketAddr::new(loopback_peer, multicast_group.port())
    } else {
        multicast_group
    }
}

/// Returns the current sequenceId and advances the counter, wrapping from
/// 0xFFFF back to 0x0000 (spec §8, scenario S6).
fn advance_sequence_id(counter: &Cell<u16>) -> u16 {
    let current = counter.get();
    counter.set(current.wrapping_add(1));
    current
}

#[derive(Default)]
struct ServerStats {
    syncs_sent: Cell<u64>,
    delay_requests_received: Cell<u64>,
    delay_responses_sent: Cell<u64>,
    malformed: Cell<u64>,
}

impl ServerStats {
    fn log(&self) {
        info!(
            syncs_sent = self.syncs_sent.get(),
            delay_requests_received = self.delay_requests_received.get(),
            delay_responses_sent = self.delay_responses_sent.get(),
            malformed = self.malformed.get(),
            "server stats"
        );
    }
}

/// PTP master. Broadcasts Sync/Follow_Up on a fixed cadence and answers
/// Delay_Req with Delay_Resp, echoing the requester's own sequenceId
/// rather than the broadcast counter (spec §4.E).
#[derive(Clone)]
pub struct Server {
    config: Config,
    clock: Rc<dyn ClockSource>,
    event_socket: Rc<UdpSocket>,
    general_socket: Rc<UdpSocket>,
    event_target: SocketAddr,
    general_target: SocketAddr,
    sequence_id: Rc<Cell<u16>>,
    stats: Rc<ServerStats>,
}

impl Server {
    pub async fn bind(config: Config, clock: Rc<dyn ClockSource>) -> Result<Self> {
        let event_socket = UdpSocket::bind(("0.0.0.0", config.network.event_port))
            .await
            .context("failed to bind event socket")?;
        let general_socket = UdpSocket::bind(("0.0.0.0", config.network.general_port))
            .await
            .context("failed to bind general socket")?;

        let local_address: IpAddr = config
            .network
            .local_address
            .parse()
            .context("invalid network.local_address")?;
        let loopback_peer: IpAddr = config
            .network
            .loopback_peer_address
            .parse()
            .context("invalid network.loopback_peer_address")?;

        let event_multicast =
            resolve_target(&config.network.event_multicast_group, config.network.event_port)?;
        let general_multicast = resolve_target(
            &config.network.general_multicast_group,
            config.network.general_port,
        )?;
        let event_target = broadcast_target(local_address.is_loopback(), loopback_peer, event_multicast);
        let general_target = broadcast_target(local_address.is_loopback(), loopback_peer, general_multicast);

        Ok(Server {
            config,
            clock,
            event_socket: Rc::new(event_socket),
            general_socket: Rc::new(general_socket),
            event_target,
            general_target,
            sequence_id: Rc::new(Cell::new(0)),
            stats: Rc::new(ServerStats::default()),
        })
    }

    /// Spawns the broadcast loop, the Delay_Req responder and the stats
    /// logger onto the current `LocalSet`, and waits for all three to exit.
    pub async fn run(self, shutdown: Rc<Cell<bool>>) -> Result<()> {
        info!(
            event_port = self.config.network.event_port,
            general_port = self.config.network.general_port,
            "PTP master starting"
        );

        let broadcast = tokio::task::spawn_local({
            let server = self.clone();
            let shutdown = Rc::clone(&shutdown);
            async move { server.broadcast_loop(shutdown).await }
        });
        let responder = tokio::task::spawn_local({
            let server = self.clone();
            let shutdown = Rc::clone(&shutdown);
            async move { server.delay_request_loop(shutdown).await }
        });
        let stats_logger = tokio::task::spawn_local({
            let server = self.clone();
            let shutdown = Rc::clone(&shutdown);
            async move { server.stats_loop(shutdown).await }
        });

        broadcast.await?;
        responder.await?;
        stats_logger.await?;

        info!("PTP master stopped");
        Ok(())
    }

    async fn broadcast_loop(&self, shutdown: Rc<Cell<bool>>) {
        let mut ticker = time::interval(Duration::from_millis(self.config.timing.broadcast_interval_ms));
        loop {
            ticker.tick().await;
            if shutdown.get() {
                break;
            }

            let sequence_id = advance_sequence_id(&self.sequence_id);
            let t1 = self.clock.now();

            let sync = wire::encode(PtpMessageType::Sync, sequence_id, t1);
            if let Err(e) = self.event_socket.send_to(&sync, self.event_target).await {
                warn!(error = %e, "failed to send Sync");
                continue;
            }
            self.stats.syncs_sent.set(self.stats.syncs_sent.get() + 1);

            // Two-step: t1 is latched at send time above, then relayed via
            // Follow_Up rather than embedded in Sync itself.
            let follow_up = wire::encode(PtpMessageType::FollowUp, sequence_id, t1);
            if let Err(e) = self.general_socket.send_to(&follow_up, self.general_target).await {
                warn!(error = %e, "failed to send Follow_Up");
            }
        }
    }

    /// Accepts datagrams on the event socket and spawns a handler task per
    /// request (spec §4.E, §5: the accept loop must resume immediately to
    /// await the next datagram rather than block on the Delay_Resp send).
    async fn delay_request_loop(&self, shutdown: Rc<Cell<bool>>) {
        let mut buf = [0u8; wire::MESSAGE_SIZE];
        loop {
            if shutdown.get() {
                break;
            }

            let received = time::timeout(
                Duration::from_millis(500),
                self.event_socket.recv_from(&mut buf),
            )
            .await;

            let (len, from) = match received {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    error!(error = %e, "event socket recv failed");
                    continue;
                }
                Err(_) => continue, // timeout; loop back around to recheck shutdown
            };

            // t4: as close to the wire as this loop can manage.
            let t4 = self.clock.now();
            let received_bytes = buf[..len].to_vec();

            // Each handler owns its own buffer and sender endpoint, so the
            // accept loop never waits on a reply's send_to (matching
            // `co_spawn(SendDelayResponse(...))` in the original server).
            let server = self.clone();
            tokio::task::spawn_local(async move {
                server.handle_delay_request(t4, received_bytes, from).await;
            });
        }
    }

    async fn handle_delay_request(&self, t4: PtpTimestamp, received: Vec<u8>, from: SocketAddr) {
        let (msg_type, sequence_id, _payload) = match wire::decode(&received) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, %from, "malformed message on event socket");
                self.stats.malformed.set(self.stats.malformed.get() + 1);
                return;
            }
        };

        if msg_type != PtpMessageType::DelayReq {
            return;
        }
        self.stats
            .delay_requests_received
            .set(self.stats.delay_requests_received.get() + 1);

        // Delay_Resp is unicast back to the requester, never broadcast
        // to the general multicast group (spec §4.E).
        let response_addr = SocketAddr::new(from.ip(), self.config.network.general_port);
        let response = wire::encode(PtpMessageType::DelayResp, sequence_id, t4);
        match self.general_socket.send_to(&response, response_addr).await {
            Ok(_) => self
                .stats
                .delay_responses_sent
                .set(self.stats.delay_responses_sent.get() + 1),
            Err(e) => warn!(error = %e, "failed to send Delay_Resp"),
        }
    }

    async fn stats_loop(&self, shutdown: Rc<Cell<bool>>) {
        let mut ticker = time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            if shutdown.get() {
                break;
            }
            self.stats.log();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_id_wraps_from_0xffff_to_0x0000() {
        let counter = Cell::new(0xFFFFu16);
        let first = advance_sequence_id(&counter);
        let second = advance_sequence_id(&counter);
        assert_eq!(first, 0xFFFF);
        assert_eq!(second, 0x0000);
    }

    #[test]
    fn resolve_target_parses_address_and_port() {
        let addr = resolve_target("224.0.1.129", 1319).unwrap();
        assert_eq!(addr.port(), 1319);
        assert_eq!(addr.ip().to_string(), "224.0.1.129");
    }

    #[test]
    fn resolve_target_rejects_invalid_address() {
        assert!(resolve_target("not-an-ip", 1319).is_err());
    }

    #[test]
    fn broadcast_target_uses_multicast_group_when_not_loopback() {
        let multicast = resolve_target("224.0.1.129", 1319).unwrap();
        let loopback_peer: IpAddr = "127.0.0.1".parse().unwrap();
        let target = broadcast_target(false, loopback_peer, multicast);
        assert_eq!(target, multicast);
    }

    #[test]
    fn broadcast_target_uses_unicast_peer_when_loopback() {
        let multicast = resolve_target("224.0.1.129", 1319).unwrap();
        let loopback_peer: IpAddr = "127.0.0.1".parse().unwrap();
        let target = broadcast_target(true, loopback_peer, multicast);
        assert_eq!(target.ip(), loopback_peer);
        assert_eq!(target.port(), 1319);
    }
}

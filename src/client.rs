use crate::clock::ClockSource;
use crate::config::{Config, FilterConfig};
use crate::kalman_bias::{KalmanFilterBias, KalmanFilterBiasConfig};
use crate::kalman_filter::{KalmanFilter1D, KalmanFilter1DConfig, Snapshot};
use crate::wire::{self, PtpMessageType, PtpTimestamp};
use anyhow::{Context, Result};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, info, warn};

/// One in-flight four-timestamp exchange, correlated by the sequenceId the
/// master assigned to the Sync that started it (spec §4.B, §4.F).
struct TimestampSet {
    sequence_id: u16,
    t1: Option<PtpTimestamp>, // from Follow_Up: master's Sync send time
    t2: Option<PtpTimestamp>, // our own receipt of Sync
    t3: Option<PtpTimestamp>, // our own send time for Delay_Req
    t4: Option<PtpTimestamp>, // from Delay_Resp: master's receipt of Delay_Req
    created_at: Instant,
}

impl TimestampSet {
    fn new(sequence_id: u16, t2: PtpTimestamp, now: Instant) -> Self {
        TimestampSet {
            sequence_id,
            t1: None,
            t2: Some(t2),
            t3: None,
            t4: None,
            created_at: now,
        }
    }
}

fn is_complete(set: &TimestampSet) -> bool {
    set.t1.is_some() && set.t2.is_some() && set.t3.is_some() && set.t4.is_some()
}

/// `((t4-t1) - (t3-t2)) / 2`, in nanoseconds. Only meaningful once complete.
fn path_delay_ns(set: &TimestampSet) -> i64 {
    let t1 = set.t1.expect("t1 present").to_nanos();
    let t2 = set.t2.expect("t2 present").to_nanos();
    let t3 = set.t3.expect("t3 present").to_nanos();
    let t4 = set.t4.expect("t4 present").to_nanos();
    ((t4 - t1) - (t3 - t2)) / 2
}

/// Path delay in microseconds, if `set` is complete and the computed delay
/// is positive. Negative/zero delays are clock-skew artifacts, not real
/// measurements, and are discarded (spec §4.F, scenario S5).
fn positive_delay_us(set: &TimestampSet) -> Option<f64> {
    if !is_complete(set) {
        return None;
    }
    let delay_ns = path_delay_ns(set);
    if delay_ns <= 0 {
        return None;
    }
    Some(delay_ns as f64 / 1000.0)
}

/// All sets correlated to `sequence_id`. sequenceId uniqueness across
/// coexisting sets is not required (spec §3.2), so every caller must update
/// every match, not just the newest one (spec §4.F, `ranges::views::filter`
/// in `original_source/PtpClient.cpp`).
fn sets_matching_mut(sets: &mut VecDeque<TimestampSet>, sequence_id: u16) -> impl Iterator<Item = &mut TimestampSet> {
    sets.iter_mut().filter(move |s| s.sequence_id == sequence_id)
}

fn enforce_capacity(sets: &mut VecDeque<TimestampSet>, max: usize) {
    while sets.len() > max {
        sets.pop_front();
    }
}

/// Drops incomplete entries older than `stale_timeout` (a lost Follow_Up or
/// Delay_Resp otherwise leaks forever). Complete entries are never evicted
/// here; capacity trimming handles those via [`enforce_capacity`].
fn evict_stale(sets: &mut VecDeque<TimestampSet>, now: Instant, stale_timeout: Duration) -> usize {
    let before = sets.len();
    sets.retain(|s| is_complete(s) || now.duration_since(s.created_at) <= stale_timeout);
    before - sets.len()
}

enum Filter {
    Scalar(KalmanFilter1D),
    Bias(KalmanFilterBias),
}

impl Filter {
    fn update(&mut self, measurement: f64) -> f64 {
        match self {
            Filter::Scalar(f) => f.update(measurement),
            Filter::Bias(f) => f.update(measurement),
        }
    }

    fn snapshot(&self) -> Snapshot {
        match self {
            Filter::Scalar(f) => f.snapshot(),
            Filter::Bias(f) => f.snapshot(),
        }
    }
}

fn build_filter(config: &FilterConfig) -> Filter {
    match config.variant.as_str() {
        "bias" => Filter::Bias(KalmanFilterBias::new(KalmanFilterBiasConfig {
            q_scale: config.q_scale,
            q_min: config.q_min,
            q_max: config.q_max,
            ..Default::default()
        })),
        _ => Filter::Scalar(KalmanFilter1D::new(KalmanFilter1DConfig {
            window_size: config.window_size,
            q_scale: config.q_scale,
            q_min: config.q_min,
            q_max: config.q_max,
            ..Default::default()
        })),
    }
}

/// PTP slave. Listens for Sync/Follow_Up, issues Delay_Req on a fixed
/// cadence, correlates the four timestamps per sequenceId, and smooths the
/// resulting path-delay samples through the configured Kalman filter.
#[derive(Clone)]
pub struct Client {
    config: Config,
    clock: Rc<dyn ClockSource>,
    event_socket: Rc<UdpSocket>,
    general_socket: Rc<UdpSocket>,
    master_event_addr: SocketAddr,
    sets: Rc<RefCell<VecDeque<TimestampSet>>>,
    // Sequence of the most recently received Sync. A new Delay_Req always
    // targets this sequence, never one it generates itself: spec §9 flags
    // the single shared counter as the original design's weak point, kept
    // here only for "which set is the next Delay_Req for".
    last_sync_sequence: Rc<Cell<Option<u16>>>,
    filter: Rc<RefCell<Filter>>,
    mean_path_delay: Rc<Cell<Option<f64>>>,
}

impl Client {
    pub async fn bind(config: Config, clock: Rc<dyn ClockSource>) -> Result<Self> {
        let master_ip: IpAddr = config
            .network
            .master_address
            .as_deref()
            .context("network.master_address is required to run as a client")?
            .parse()
            .context("invalid network.master_address")?;

        let event_socket = UdpSocket::bind(("0.0.0.0", config.network.event_port))
            .await
            .context("failed to bind event socket")?;
        let general_socket = UdpSocket::bind(("0.0.0.0", config.network.general_port))
            .await
            .context("failed to bind general socket")?;

        // Loopback interfaces generally don't carry multicast traffic, so
        // a client bound to one skips the join entirely (spec §4.F).
        let local_address: IpAddr = config
            .network
            .local_address
            .parse()
            .context("invalid network.local_address")?;
        if !local_address.is_loopback() {
            let event_group: std::net::Ipv4Addr = config
                .network
                .event_multicast_group
                .parse()
                .context("invalid event multicast group")?;
            let general_group: std::net::Ipv4Addr = config
                .network
                .general_multicast_group
                .parse()
                .context("invalid general multicast group")?;

            event_socket
                .join_multicast_v4(event_group, std::net::Ipv4Addr::UNSPECIFIED)
                .context("failed to join event multicast group")?;
            general_socket
                .join_multicast_v4(general_group, std::net::Ipv4Addr::UNSPECIFIED)
                .context("failed to join general multicast group")?;
        }

        let filter = build_filter(&config.filter);

        Ok(Client {
            master_event_addr: SocketAddr::new(master_ip, config.network.event_port),
            event_socket: Rc::new(event_socket),
            general_socket: Rc::new(general_socket),
            sets: Rc::new(RefCell::new(VecDeque::new())),
            last_sync_sequence: Rc::new(Cell::new(None)),
            filter: Rc::new(RefCell::new(filter)),
            mean_path_delay: Rc::new(Cell::new(None)),
            config,
            clock,
        })
    }

    pub fn mean_path_delay_us(&self) -> Option<f64> {
        self.mean_path_delay.get()
    }

    pub async fn run(self, shutdown: Rc<Cell<bool>>) -> Result<()> {
        info!(
            master = %self.master_event_addr.ip(),
            variant = %self.config.filter.variant,
            "PTP slave starting"
        );

        let event_listener = tokio::task::spawn_local({
            let client = self.clone();
            let shutdown = Rc::clone(&shutdown);
            async move { client.event_listener_loop(shutdown).await }
        });
        let general_listener = tokio::task::spawn_local({
            let client = self.clone();
            let shutdown = Rc::clone(&shutdown);
            async move { client.general_listener_loop(shutdown).await }
        });
        let delay_requester = tokio::task::spawn_local({
            let client = self.clone();
            let shutdown = Rc::clone(&shutdown);
            async move { client.delay_requester_loop(shutdown).await }
        });
        let gc = tokio::task::spawn_local({
            let client = self.clone();
            let shutdown = Rc::clone(&shutdown);
            async move { client.gc_loop(shutdown).await }
        });

        event_listener.await?;
        general_listener.await?;
        delay_requester.await?;
        gc.await?;

        info!("PTP slave stopped");
        Ok(())
    }

    async fn event_listener_loop(&self, shutdown: Rc<Cell<bool>>) {
        let mut buf = [0u8; wire::MESSAGE_SIZE];
        loop {
            if shutdown.get() {
                break;
            }
            let received =
                time::timeout(Duration::from_millis(500), self.event_socket.recv_from(&mut buf)).await;
            let len = match received {
                Ok(Ok((len, _from))) => len,
                Ok(Err(e)) => {
                    warn!(error = %e, "event socket recv failed");
                    continue;
                }
                Err(_) => continue,
            };

            // t2: as close to the wire as this loop can manage.
            let t2 = self.clock.now();

            let (msg_type, sequence_id, _payload) = match wire::decode(&buf[..len]) {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "malformed message on event socket");
                    continue;
                }
            };
            if msg_type != PtpMessageType::Sync {
                continue;
            }

            self.sets
                .borrow_mut()
                .push_back(TimestampSet::new(sequence_id, t2, Instant::now()));
            self.last_sync_sequence.set(Some(sequence_id));
        }
    }

    async fn general_listener_loop(&self, shutdown: Rc<Cell<bool>>) {
        let mut buf = [0u8; wire::MESSAGE_SIZE];
        loop {
            if shutdown.get() {
                break;
            }
            let received = time::timeout(
                Duration::from_millis(500),
                self.general_socket.recv_from(&mut buf),
            )
            .await;
            let len = match received {
                Ok(Ok((len, _from))) => len,
                Ok(Err(e)) => {
                    warn!(error = %e, "general socket recv failed");
                    continue;
                }
                Err(_) => continue,
            };

            let (msg_type, sequence_id, payload) = match wire::decode(&buf[..len]) {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "malformed message on general socket");
                    continue;
                }
            };

            match msg_type {
                PtpMessageType::FollowUp => {
                    // Out-of-order Follow_Up-before-Sync (spec §8, S3): no
                    // set has this sequenceId yet, so it is silently dropped.
                    for set in sets_matching_mut(&mut self.sets.borrow_mut(), sequence_id) {
                        set.t1 = Some(payload);
                    }
                }
                PtpMessageType::DelayResp => {
                    let completed_delays: Vec<f64> = {
                        let mut sets = self.sets.borrow_mut();
                        sets_matching_mut(&mut sets, sequence_id)
                            .filter_map(|set| {
                                set.t4 = Some(payload);
                                positive_delay_us(set)
                            })
                            .collect()
                    };

                    for delay_us in completed_delays {
                        let estimate = self.filter.borrow_mut().update(delay_us);
                        self.mean_path_delay.set(Some(estimate));
                        let snapshot = self.filter.borrow().snapshot();
                        info!(
                            sequence_id,
                            raw_delay_us = delay_us,
                            filtered_delay_us = snapshot.estimate,
                            gain = snapshot.gain,
                            r = snapshot.measurement_noise,
                            q = snapshot.process_noise,
                            p = snapshot.estimate_uncertainty,
                            innovation_mean = snapshot.innovation_mean,
                            nis_mean = snapshot.nis_mean,
                            "path delay updated"
                        );
                    }
                }
                _ => {}
            }
        }
    }

    async fn delay_requester_loop(&self, shutdown: Rc<Cell<bool>>) {
        let mut ticker = time::interval(Duration::from_millis(
            self.config.timing.delay_request_interval_ms,
        ));
        loop {
            ticker.tick().await;
            if shutdown.get() {
                break;
            }

            let Some(sequence_id) = self.last_sync_sequence.get() else {
                continue; // haven't received a Sync yet
            };

            let t3 = self.clock.now();
            {
                let mut sets = self.sets.borrow_mut();
                for set in sets_matching_mut(&mut sets, sequence_id) {
                    set.t3 = Some(t3);
                }
            }

            let request = wire::encode(PtpMessageType::DelayReq, sequence_id, t3);
            if let Err(e) = self
                .event_socket
                .send_to(&request, self.master_event_addr)
                .await
            {
                warn!(error = %e, "failed to send Delay_Req");
            }
        }
    }

    async fn gc_loop(&self, shutdown: Rc<Cell<bool>>) {
        let mut ticker = time::interval(Duration::from_secs(self.config.timing.gc_period_s));
        let stale_timeout = Duration::from_secs(self.config.timing.stale_timeout_s);
        loop {
            ticker.tick().await;
            if shutdown.get() {
                break;
            }

            let mut sets = self.sets.borrow_mut();
            let evicted = evict_stale(&mut sets, Instant::now(), stale_timeout);
            if evicted > 0 {
                debug!(evicted, remaining = sets.len(), "cleaned up stale timestamp sets");
            }
            enforce_capacity(&mut sets, self.config.timing.max_sets);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(seconds: u32, nanoseconds: u32) -> PtpTimestamp {
        PtpTimestamp::new(seconds, nanoseconds)
    }

    fn complete_set(sequence_id: u16, t1: PtpTimestamp, t2: PtpTimestamp, t3: PtpTimestamp, t4: PtpTimestamp) -> TimestampSet {
        TimestampSet {
            sequence_id,
            t1: Some(t1),
            t2: Some(t2),
            t3: Some(t3),
            t4: Some(t4),
            created_at: Instant::now(),
        }
    }

    #[test]
    fn happy_path_positive_delay() {
        // t1=0, t2=100, t3=200, t4=330 -> ((330-0)-(200-100))/2 = 115
        let set = complete_set(1, ts(0, 0), ts(0, 100), ts(0, 200), ts(0, 330));
        assert_eq!(path_delay_ns(&set), 115);
        assert_eq!(positive_delay_us(&set), Some(0.115));
    }

    #[test]
    fn negative_delay_is_discarded() {
        let set = complete_set(1, ts(0, 0), ts(0, 10), ts(0, 500), ts(0, 520));
        assert!(path_delay_ns(&set) < 0);
        assert_eq!(positive_delay_us(&set), None);
    }

    #[test]
    fn incomplete_set_has_no_delay() {
        let mut set = complete_set(1, ts(0, 0), ts(0, 10), ts(0, 20), ts(0, 30));
        set.t4 = None;
        assert!(!is_complete(&set));
        assert_eq!(positive_delay_us(&set), None);
    }

    #[test]
    fn follow_up_before_sync_finds_no_set() {
        let mut sets = VecDeque::new();
        assert!(sets_matching_mut(&mut sets, 7).next().is_none());
    }

    #[test]
    fn capacity_keeps_most_recent_entries() {
        let mut sets: VecDeque<TimestampSet> = (0..25u16)
            .map(|seq| TimestampSet::new(seq, ts(0, 0), Instant::now()))
            .collect();
        enforce_capacity(&mut sets, 20);
        assert_eq!(sets.len(), 20);
        assert_eq!(sets.front().unwrap().sequence_id, 5);
        assert_eq!(sets.back().unwrap().sequence_id, 24);
    }

    #[test]
    fn stale_incomplete_entries_are_evicted_but_complete_ones_survive() {
        let now = Instant::now();
        let old = now - Duration::from_secs(10);
        let mut sets = VecDeque::new();
        sets.push_back(TimestampSet::new(1, ts(0, 0), old)); // incomplete, stale
        sets.push_back(complete_set(2, ts(0, 0), ts(0, 1), ts(0, 2), ts(0, 3))); // complete
        let old_complete = {
            let mut s = complete_set(3, ts(0, 0), ts(0, 1), ts(0, 2), ts(0, 3));
            s.created_at = old;
            s
        };
        sets.push_back(old_complete); // complete but old: must survive

        let evicted = evict_stale(&mut sets, now, Duration::from_secs(4));
        assert_eq!(evicted, 1);
        assert_eq!(sets.len(), 2);
        assert!(sets.iter().all(|s| s.sequence_id != 1));
    }

    #[test]
    fn sequence_wraparound_correlates_by_equality_not_order() {
        let mut sets = VecDeque::new();
        sets.push_back(TimestampSet::new(0xFFFF, ts(0, 0), Instant::now()));
        sets.push_back(TimestampSet::new(0x0000, ts(0, 0), Instant::now()));
        assert!(sets_matching_mut(&mut sets, 0xFFFF).next().is_some());
        assert!(sets_matching_mut(&mut sets, 0x0000).next().is_some());
    }

    #[test]
    fn duplicate_sequence_ids_are_all_updated() {
        // sequenceId uniqueness across coexisting sets is not required
        // (spec §3.2); every matching set must be updated, not just one.
        let mut sets = VecDeque::new();
        sets.push_back(TimestampSet::new(5, ts(0, 0), Instant::now()));
        sets.push_back(TimestampSet::new(5, ts(0, 0), Instant::now()));
        sets.push_back(TimestampSet::new(6, ts(0, 0), Instant::now()));

        for set in sets_matching_mut(&mut sets, 5) {
            set.t1 = Some(ts(0, 42));
        }

        let matched: Vec<_> = sets.iter().filter(|s| s.sequence_id == 5).collect();
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|s| s.t1 == Some(ts(0, 42))));
        assert!(sets.iter().find(|s| s.sequence_id == 6).unwrap().t1.is_none());
    }
}

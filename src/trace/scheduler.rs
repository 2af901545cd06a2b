//! The scheduling core: a pure state machine over traces, probe slots,
//! and a [`Prober`]. Kept free of any shared/locked state so it can run
//! entirely on one thread and be driven directly in tests with
//! [`super::prober::FakeProber`].

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::RngCore;

use super::prober::{PollEvent, ProbeToken, Prober};
use super::icmp::ProbeOutcome;
use super::{TraceCallback, TraceEvent, TraceUserData};

/// Snapshot of the recognized `[trace]` configuration section (see
/// [`super::TraceConfig::from_config_set`]).
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub(crate) udp_size: usize,
    pub(crate) base_port: u16,
    pub(crate) timeout: Duration,
    pub(crate) pool_size: usize,
    pub(crate) default_max_distance: u8,
    pub(crate) retries: u32,
    pub(crate) bind_address: Option<IpAddr>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            udp_size: 40,
            base_port: 33434,
            timeout: Duration::from_millis(1000),
            pool_size: 100,
            default_max_distance: 10,
            retries: 3,
            bind_address: None,
        }
    }
}

/// A trace request handed to the scheduler, either straight from
/// [`super::TraceContext::start`] (production) or constructed directly
/// in tests.
pub(crate) struct IncomingRequest {
    pub(crate) id: u64,
    pub(crate) address: String,
    pub(crate) max_distance: u8,
    pub(crate) callback: TraceCallback,
    pub(crate) user: TraceUserData,
    pub(crate) end_requested: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    FailedAddr,
}

struct LiveTrace {
    address: String,
    resolved: Option<IpAddr>,
    max_ttl: u8,
    next_ttl: u8,
    sent: u8,
    responses: u8,
    deepest_responding_ttl: u8,
    /// Set once the destination itself has answered (a port-unreachable),
    /// so [`Scheduler::finish_trace`] doesn't also synthesize a guessed
    /// final hop from `deepest_responding_ttl`.
    reached: bool,
    status: Status,
    callback: TraceCallback,
    user: TraceUserData,
    end_requested: Arc<AtomicBool>,
}

struct Slot {
    token: ProbeToken,
    trace_id: u64,
    ttl_sent: u8,
    send_time: Instant,
}

/// Bounded pool of probe slots plus the FIFO of traces waiting for one,
/// driven one [`Scheduler::tick`] at a time.
pub(crate) struct Scheduler<P: Prober> {
    prober: P,
    config: TraceConfig,
    payload: Vec<u8>,
    traces: HashMap<u64, LiveTrace>,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    queue: VecDeque<u64>,
}

impl<P: Prober> Scheduler<P> {
    pub(crate) fn new(config: TraceConfig, prober: P) -> Self {
        let mut payload = vec![0u8; config.udp_size];
        rand::thread_rng().fill_bytes(&mut payload);
        let pool_size = config.pool_size;
        Scheduler {
            prober,
            config,
            payload,
            traces: HashMap::new(),
            slots: (0..pool_size).map(|_| None).collect(),
            free: (0..pool_size).rev().collect(),
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn accept(&mut self, req: IncomingRequest) {
        let max_ttl = if req.max_distance == 0 {
            self.config.default_max_distance
        } else {
            req.max_distance
        };
        self.traces.insert(
            req.id,
            LiveTrace {
                address: req.address,
                resolved: None,
                max_ttl,
                next_ttl: 1,
                sent: 0,
                responses: 0,
                deepest_responding_ttl: 0,
                reached: false,
                status: Status::Running,
                callback: req.callback,
                user: req.user,
                end_requested: req.end_requested,
            },
        );
        self.queue.push_back(req.id);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.traces.is_empty()
    }

    /// Force-complete every still-live trace, each getting its terminal
    /// callback (a final hop guess plus `Done`, unless it asked to end
    /// silently) exactly as if it had timed out on its own. Called once
    /// from the scheduler thread's shutdown path so no caller is left
    /// waiting on a callback that will never come.
    pub(crate) fn shutdown_drain(&mut self) {
        for trace_id in self.traces.keys().copied().collect::<Vec<_>>() {
            self.finish_trace(trace_id);
        }
        for slot in self.slots.iter_mut().filter_map(Option::take) {
            self.prober.close(slot.token);
        }
    }

    /// Run one pass: poll active slots, process whatever triggered or
    /// timed out, then hand any free slots to queued traces. Returns the
    /// duration the caller should block in its own `poll()` before
    /// calling `tick` again.
    pub(crate) fn tick(&mut self) -> Duration {
        self.poll_active();
        self.dispatch_queue();
        self.next_timeout()
    }

    fn active_tokens(&self) -> Vec<(usize, ProbeToken)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s.token)))
            .collect()
    }

    fn poll_active(&mut self) {
        let active = self.active_tokens();
        if active.is_empty() {
            return;
        }
        let tokens: Vec<ProbeToken> = active.iter().map(|(_, t)| *t).collect();
        let events = match self.prober.poll(&tokens, Duration::from_millis(0)) {
            Ok(events) => events,
            Err(e) => {
                warn!("trace: poll failed: {e}");
                Vec::new()
            }
        };
        let errored: HashMap<ProbeToken, bool> =
            events.into_iter().map(|PollEvent { token, errored }| (token, errored)).collect();

        let now = Instant::now();
        for (idx, token) in active {
            let timed_out = self.slots[idx]
                .as_ref()
                .map(|s| now.duration_since(s.send_time) >= self.config.timeout)
                .unwrap_or(false);
            if errored.contains_key(&token) {
                let outcome = self.prober.recv_outcome(token).unwrap_or(None);
                self.complete_slot(idx, outcome);
            } else if timed_out {
                self.complete_slot(idx, None);
            }
        }
    }

    fn complete_slot(&mut self, idx: usize, outcome: Option<ProbeOutcome>) {
        let Some(slot) = self.slots[idx].take() else {
            return;
        };
        self.prober.close(slot.token);
        self.free.push(idx);

        let Some(trace) = self.traces.get_mut(&slot.trace_id) else {
            return;
        };
        trace.responses += 1;

        match outcome {
            Some(ProbeOutcome::Hop(offender)) => {
                if slot.ttl_sent > trace.deepest_responding_ttl {
                    trace.deepest_responding_ttl = slot.ttl_sent;
                }
                (trace.callback)(
                    TraceEvent::Hop {
                        distance: slot.ttl_sent,
                        addr: offender.addr,
                    },
                    &trace.user,
                );
            }
            Some(ProbeOutcome::Unreachable) => {
                // The destination itself answered with a port-unreachable:
                // the trace is complete regardless of any ttls still
                // queued or in flight.
                if slot.ttl_sent > trace.deepest_responding_ttl {
                    trace.deepest_responding_ttl = slot.ttl_sent;
                }
                trace.reached = true;
                if !trace.end_requested.load(Ordering::SeqCst) {
                    if let Some(dest) = trace.resolved {
                        (trace.callback)(
                            TraceEvent::Hop {
                                distance: slot.ttl_sent,
                                addr: dest,
                            },
                            &trace.user,
                        );
                    }
                }
                self.finish_trace(slot.trace_id);
                return;
            }
            Some(ProbeOutcome::Other) | None => {}
        }

        if trace.next_ttl > trace.max_ttl && trace.responses >= trace.max_ttl {
            self.finish_trace(slot.trace_id);
        }
    }

    fn finish_trace(&mut self, trace_id: u64) {
        let Some(trace) = self.traces.remove(&trace_id) else {
            return;
        };
        if trace.end_requested.load(Ordering::SeqCst) {
            return;
        }
        if !trace.reached && trace.deepest_responding_ttl < trace.max_ttl {
            if let Some(dest) = trace.resolved {
                (trace.callback)(
                    TraceEvent::Hop {
                        distance: trace.deepest_responding_ttl + 1,
                        addr: dest,
                    },
                    &trace.user,
                );
            }
        }
        (trace.callback)(TraceEvent::Done, &trace.user);
    }

    fn dispatch_queue(&mut self) {
        // A trace occupies the queue head until its ttl range is
        // exhausted (or resolution fails), claiming as many free slots
        // as it needs along the way; only then does the next queued
        // trace get a turn.
        while !self.free.is_empty() {
            let Some(&trace_id) = self.queue.front() else {
                break;
            };
            if self.send_next_probe(trace_id) {
                self.queue.pop_front();
            }
        }
    }

    /// Sends the next probe for `trace_id`, if any remain. Returns `true`
    /// if the trace has exhausted its ttl range and should leave the
    /// queue (it may still be awaiting outstanding replies).
    fn send_next_probe(&mut self, trace_id: u64) -> bool {
        let Some(trace) = self.traces.get_mut(&trace_id) else {
            return true;
        };
        if trace.resolved.is_none() {
            match self.prober.resolve(&trace.address) {
                Ok(addr) => trace.resolved = Some(addr),
                Err(e) => {
                    debug!("trace: address resolution failed for {}: {e}", trace.address);
                    trace.status = Status::FailedAddr;
                    self.traces.remove(&trace_id);
                    return true;
                }
            }
        }

        let trace = self.traces.get_mut(&trace_id).unwrap();
        if trace.next_ttl > trace.max_ttl {
            return true;
        }
        let ttl = trace.next_ttl;
        let dest = trace.resolved.unwrap();
        let dest_port = self.config.base_port.wrapping_add(ttl as u16);

        let mut attempt = 0;
        let token = loop {
            match self.prober.open_probe(dest, ttl, dest_port, &self.payload) {
                Ok(token) => break Some(token),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.retries {
                        warn!("trace: giving up on ttl {ttl} after {attempt} attempts: {e}");
                        break None;
                    }
                }
            }
        };

        let trace = self.traces.get_mut(&trace_id).unwrap();
        trace.next_ttl += 1;
        trace.sent += 1;
        match token {
            Some(token) => {
                let slot_idx = self.free.pop().expect("dispatch_queue only runs with a free slot");
                self.slots[slot_idx] = Some(Slot {
                    token,
                    trace_id,
                    ttl_sent: ttl,
                    send_time: Instant::now(),
                });
            }
            None => {
                // Socket errors exhausted retries; this ttl's hop is
                // simply never heard from, same externally as a timeout.
                trace.responses += 1;
                if trace.next_ttl > trace.max_ttl && trace.responses >= trace.max_ttl {
                    self.finish_trace(trace_id);
                }
            }
        }

        trace.next_ttl > trace.max_ttl
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        self.slots
            .iter()
            .flatten()
            .map(|s| {
                let elapsed = now.duration_since(s.send_time);
                self.config.timeout.saturating_sub(elapsed)
            })
            .min()
            .unwrap_or(self.config.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::prober::{FakeProber, ScriptedReply};
    use std::collections::HashMap as Map;
    use std::sync::Mutex;

    fn recording() -> (TraceCallback, Arc<Mutex<Vec<TraceEvent>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let cb: TraceCallback = Arc::new(move |event, _user| {
            log2.lock().unwrap().push(event);
        });
        (cb, log)
    }

    #[test]
    fn s5_hop_replay_reports_expected_hops_and_final_destination() {
        let mut topology = Map::new();
        topology.insert(1, ScriptedReply::Hop("10.0.0.1".parse().unwrap()));
        topology.insert(2, ScriptedReply::Hop("10.0.0.2".parse().unwrap()));
        topology.insert(3, ScriptedReply::Silent);
        // The destination itself answers at ttl 4 with a port-unreachable,
        // same as the real ICMP_DEST_UNREACH a traceroute gets from its
        // target rather than an intermediate TIME_EXCEEDED hop.
        topology.insert(4, ScriptedReply::Unreachable);

        let prober = FakeProber::new(topology);
        let mut config = TraceConfig::default();
        config.pool_size = 5;
        let mut sched = Scheduler::new(config, prober);

        let (cb, log) = recording();
        sched.accept(IncomingRequest {
            id: 1,
            address: "10.0.0.4".to_string(),
            max_distance: 5,
            callback: cb,
            user: Arc::new(()),
            end_requested: Arc::new(AtomicBool::new(false)),
        });

        for _ in 0..20 {
            sched.tick();
            if sched.is_idle() {
                break;
            }
        }

        let events = log.lock().unwrap();
        let hops: Vec<(u8, IpAddr)> = events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Hop { distance, addr } => Some((*distance, *addr)),
                TraceEvent::Done => None,
            })
            .collect();
        assert_eq!(
            hops,
            vec![
                (1, "10.0.0.1".parse().unwrap()),
                (2, "10.0.0.2".parse().unwrap()),
                (4, "10.0.0.4".parse().unwrap()),
            ]
        );
        assert!(matches!(events.last(), Some(TraceEvent::Done)));
    }

    #[test]
    fn end_before_completion_suppresses_done_callback() {
        let mut topology = Map::new();
        topology.insert(1, ScriptedReply::Unreachable);
        let prober = FakeProber::new(topology);
        let mut config = TraceConfig::default();
        config.pool_size = 2;
        let mut sched = Scheduler::new(config, prober);

        let (cb, log) = recording();
        let end_flag = Arc::new(AtomicBool::new(true));
        sched.accept(IncomingRequest {
            id: 1,
            address: "10.0.0.9".to_string(),
            max_distance: 1,
            callback: cb,
            user: Arc::new(()),
            end_requested: end_flag,
        });

        for _ in 0..10 {
            sched.tick();
            if sched.is_idle() {
                break;
            }
        }

        assert!(sched.is_idle());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn shutdown_drain_delivers_done_to_every_incomplete_trace() {
        // Nothing in the topology ever answers, so both traces are still
        // outstanding when shutdown_drain runs.
        let prober = FakeProber::new(Map::new());
        let mut config = TraceConfig::default();
        config.pool_size = 4;
        let mut sched = Scheduler::new(config, prober);

        let (cb_a, log_a) = recording();
        sched.accept(IncomingRequest {
            id: 1,
            address: "10.0.0.1".to_string(),
            max_distance: 3,
            callback: cb_a,
            user: Arc::new(()),
            end_requested: Arc::new(AtomicBool::new(false)),
        });
        let (cb_b, log_b) = recording();
        sched.accept(IncomingRequest {
            id: 2,
            address: "10.0.0.2".to_string(),
            max_distance: 3,
            callback: cb_b,
            user: Arc::new(()),
            end_requested: Arc::new(AtomicBool::new(true)),
        });
        sched.tick();
        assert!(!sched.is_idle());

        sched.shutdown_drain();

        assert!(sched.is_idle());
        assert!(matches!(log_a.lock().unwrap().last(), Some(TraceEvent::Done)));
        assert!(log_b.lock().unwrap().is_empty(), "end_requested trace gets no terminal callback");
    }

    #[test]
    fn zero_max_distance_falls_back_to_configured_default() {
        let prober = FakeProber::new(Map::new());
        let config = TraceConfig::default();
        let default_hops = config.default_max_distance;
        let mut sched = Scheduler::new(config, prober);
        let (cb, _log) = recording();
        sched.accept(IncomingRequest {
            id: 1,
            address: "127.0.0.1".to_string(),
            max_distance: 0,
            callback: cb,
            user: Arc::new(()),
            end_requested: Arc::new(AtomicBool::new(false)),
        });
        assert_eq!(sched.traces.get(&1).unwrap().max_ttl, default_hops);
    }
}

//! Pipelined command transmission.
//!
//! Commands are appended into a batch bounded by the negotiated maximum
//! write size. A full batch is written without waiting for its response;
//! a background drain thread collects responses in FIFO order, counting
//! anything malformed as an error the orchestrator must react to.
//!
//! ## Depth
//!
//! At most `depth` batches may be unacknowledged at once. With
//! [`DepthPolicy::Adaptive`] the depth is revised at every frame boundary
//! from the ratio of time spent sending to time spent draining:
//!
//! | send / drain | action                          |
//! |--------------|---------------------------------|
//! | `< 0.5`      | narrow by a quarter             |
//! | `0.5..=2.0`  | keep                            |
//! | `> 2.0`      | widen by a quarter (at least 1) |

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::draw::channel::DrawChannel;
use crate::draw::estimator::LinkEstimator;
use crate::error::DrawError;

/// Smallest acceptable `max_write`: a raw tile load (1045 bytes) must fit
/// with room to spare.
pub const MIN_WRITE: usize = 2048;

/// How long the drain thread sleeps between shutdown checks.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Sleep step while waiting for the pipeline to empty.
const PAUSE_POLL: Duration = Duration::from_millis(1);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Configuration ────────────────────────────────────────────────

/// Strategy for the number of unacknowledged batches allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DepthPolicy {
    /// A constant depth.
    Fixed { depth: usize },
    /// Start at `initial` and move within `min..=max` with send/drain
    /// hysteresis.
    Adaptive { initial: usize, min: usize, max: usize },
}

impl DepthPolicy {
    fn initial(&self) -> usize {
        match *self {
            DepthPolicy::Fixed { depth } => depth,
            DepthPolicy::Adaptive { initial, min, max } => initial.clamp(min, max),
        }
    }

    /// The depth to use next, given the current depth and the time spent
    /// sending and draining since the last revision.
    pub fn revise(&self, depth: usize, send: Duration, drain: Duration) -> usize {
        let DepthPolicy::Adaptive { min, max, .. } = *self else {
            return depth;
        };
        if drain.is_zero() || send.is_zero() {
            return depth;
        }
        let ratio = send.as_secs_f64() / drain.as_secs_f64();
        let next = if ratio < 0.5 {
            depth - (depth / 4).max(1)
        } else if ratio > 2.0 {
            depth + (depth / 4).max(1)
        } else {
            depth
        };
        next.clamp(min, max)
    }
}

impl Default for DepthPolicy {
    fn default() -> Self {
        DepthPolicy::Fixed { depth: 64 }
    }
}

/// Transmission settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest single write, in bytes.
    pub max_write: usize,
    pub depth_policy: DepthPolicy,
    /// How long a send may wait for room in the pipeline.
    pub send_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_write: 64 * 1024,
            depth_policy: DepthPolicy::default(),
            send_timeout_ms: 5_000,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), DrawError> {
        if self.max_write < MIN_WRITE {
            return Err(DrawError::InvalidConfig(format!(
                "max_write {} is below the minimum of {MIN_WRITE}",
                self.max_write
            )));
        }
        if self.send_timeout_ms == 0 {
            return Err(DrawError::InvalidConfig("send timeout must be at least 1ms".into()));
        }
        match self.depth_policy {
            DepthPolicy::Fixed { depth: 0 } => {
                Err(DrawError::InvalidConfig("pipeline depth must be at least 1".into()))
            }
            DepthPolicy::Adaptive { min, max, .. } if min == 0 || min > max => Err(DrawError::InvalidConfig(
                format!("adaptive depth range {min}..={max} is empty or starts at 0"),
            )),
            _ => Ok(()),
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────

struct InFlight {
    len: usize,
    sent_at: Instant,
}

struct Shared {
    channel: Arc<dyn DrawChannel>,
    queue: Mutex<VecDeque<InFlight>>,
    /// Signalled on every push and every drained response.
    changed: Condvar,
    running: AtomicBool,
    errors: AtomicU64,
    acknowledged: AtomicU64,
    drain_nanos: AtomicU64,
    link: Mutex<LinkEstimator>,
}

impl Shared {
    fn in_flight(&self) -> usize {
        lock(&self.queue).len()
    }

    fn record_error(&self, error: &DrawError) {
        let n = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        warn!("draw response error #{n}: {error}");
    }
}

/// Drain loop: one response per outstanding write, strictly FIFO.
///
/// An entry leaves the queue only after its response has been accounted
/// for, so an empty queue means every counter is current. Keeps going after
/// shutdown until nothing is outstanding.
fn drain(shared: Arc<Shared>) {
    loop {
        let (expected, sent_at) = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(front) = queue.front() {
                    break (front.len, front.sent_at);
                }
                if !shared.running.load(Ordering::SeqCst) {
                    debug!("drain thread exiting");
                    return;
                }
                queue = shared
                    .changed
                    .wait_timeout(queue, DRAIN_POLL)
                    .map(|(g, _)| g)
                    .unwrap_or_else(|p| p.into_inner().0);
            }
        };

        let started = Instant::now();
        let response = shared.channel.receive_one_response();
        shared
            .drain_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::SeqCst);

        match response {
            Ok(applied) if applied == expected => {
                lock(&shared.link).record_rtt(sent_at.elapsed());
                shared.acknowledged.fetch_add(1, Ordering::SeqCst);
            }
            Ok(applied) => shared.record_error(&DrawError::ShortWrite {
                expected,
                actual: applied,
            }),
            Err(e) => shared.record_error(&e),
        }
        lock(&shared.queue).pop_front();
        shared.changed.notify_all();
    }
}

// ── TransmissionPipeline ─────────────────────────────────────────

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    pub batches_sent: u64,
    pub acknowledged: u64,
    pub errors: u64,
    pub in_flight: usize,
    pub depth: usize,
    pub throughput: u64,
    pub rtt: Duration,
}

/// Batches commands and keeps up to `depth` writes in flight.
///
/// Owned and driven by a single sender; the drain thread only touches the
/// in-flight queue and the counters.
pub struct TransmissionPipeline {
    shared: Arc<Shared>,
    drainer: Option<JoinHandle<()>>,
    config: PipelineConfig,
    batch: BytesMut,
    depth: usize,
    paused: bool,
    batches_sent: u64,
    send_time: Duration,
    errors_seen: u64,
}

impl TransmissionPipeline {
    /// Start a pipeline over `channel`, spawning its drain thread.
    ///
    /// A smaller `max_write` advertised by the channel takes precedence.
    pub fn new(channel: Arc<dyn DrawChannel>, mut config: PipelineConfig) -> Result<Self, DrawError> {
        if let Some(limit) = channel.max_write() {
            config.max_write = config.max_write.min(limit);
        }
        config.validate()?;

        let shared = Arc::new(Shared {
            channel,
            queue: Mutex::new(VecDeque::new()),
            changed: Condvar::new(),
            running: AtomicBool::new(true),
            errors: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            drain_nanos: AtomicU64::new(0),
            link: Mutex::new(LinkEstimator::new()),
        });
        let drainer = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("draw-drain".into())
                .spawn(move || drain(shared))?
        };
        let depth = config.depth_policy.initial();
        info!(
            "transmission pipeline started: max_write={} depth={depth}",
            config.max_write
        );
        Ok(Self {
            shared,
            drainer: Some(drainer),
            config,
            batch: BytesMut::with_capacity(config.max_write),
            depth,
            paused: false,
            batches_sent: 0,
            send_time: Duration::ZERO,
            errors_seen: 0,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn max_write(&self) -> usize {
        self.config.max_write
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The channel, for out-of-band exchanges while paused.
    pub fn channel(&self) -> &dyn DrawChannel {
        self.shared.channel.as_ref()
    }

    /// Append one command to the current batch, writing the batch out first
    /// if the command would not fit.
    pub fn push(&mut self, command: &[u8]) -> Result<(), DrawError> {
        if command.len() > self.config.max_write {
            return Err(DrawError::CapacityExceeded {
                what: "draw command",
                size: command.len(),
                max: self.config.max_write,
            });
        }
        if self.batch.len() + command.len() > self.config.max_write {
            self.flush()?;
        }
        self.batch.extend_from_slice(command);
        Ok(())
    }

    /// Write out the pending batch, if any.
    pub fn flush(&mut self) -> Result<(), DrawError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = self.batch.split();
        let result = self.send(&batch);
        drop(batch);
        self.batch.reserve(self.config.max_write);
        result
    }

    /// Flush and revise the depth for the next frame.
    pub fn end_frame(&mut self) -> Result<(), DrawError> {
        let flushed = self.flush();
        let drain = Duration::from_nanos(self.shared.drain_nanos.swap(0, Ordering::SeqCst));
        let send = std::mem::take(&mut self.send_time);
        let next = self.config.depth_policy.revise(self.depth, send, drain);
        if next != self.depth {
            debug!(
                "pipeline depth {} -> {next} (send {send:?}, drain {drain:?})",
                self.depth
            );
            self.depth = next;
        }
        flushed
    }

    /// Write one batch, blocking while the pipeline is at depth.
    fn send(&mut self, batch: &[u8]) -> Result<(), DrawError> {
        if self.paused {
            return Err(DrawError::Paused);
        }
        {
            let timeout = Duration::from_millis(self.config.send_timeout_ms);
            let deadline = Instant::now() + timeout;
            let mut queue = lock(&self.shared.queue);
            while queue.len() >= self.depth {
                if self.drainer.as_ref().is_none_or(|h| h.is_finished()) {
                    return Err(DrawError::ChannelClosed);
                }
                if Instant::now() >= deadline {
                    warn!("no room in the pipeline after {timeout:?}; {} batches unanswered", queue.len());
                    return Err(DrawError::Timeout(timeout));
                }
                queue = self
                    .shared
                    .changed
                    .wait_timeout(queue, DRAIN_POLL)
                    .map(|(g, _)| g)
                    .unwrap_or_else(|p| p.into_inner().0);
            }
        }

        let started = Instant::now();
        let written = match self.shared.channel.write_pipelined(batch) {
            Ok(n) => n,
            Err(e) => {
                self.shared.record_error(&e);
                return Err(e);
            }
        };
        self.send_time += started.elapsed();
        if written != batch.len() {
            let e = DrawError::ShortWrite {
                expected: batch.len(),
                actual: written,
            };
            self.shared.record_error(&e);
            return Err(e);
        }

        lock(&self.shared.queue).push_back(InFlight {
            len: batch.len(),
            sent_at: started,
        });
        self.shared.changed.notify_all();
        lock(&self.shared.link).record_batch(batch.len());
        self.batches_sent += 1;
        Ok(())
    }

    /// Stop issuing writes and wait until nothing is outstanding.
    ///
    /// Pending batch bytes are kept and go out after [`resume`](Self::resume).
    pub fn pause(&mut self, timeout: Duration) -> Result<(), DrawError> {
        self.paused = true;
        self.wait_idle(timeout)
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Sleep until every outstanding write has been answered.
    pub fn wait_idle(&self, timeout: Duration) -> Result<(), DrawError> {
        let deadline = Instant::now() + timeout;
        while self.shared.in_flight() > 0 {
            if Instant::now() >= deadline {
                return Err(DrawError::Timeout(timeout));
            }
            std::thread::sleep(PAUSE_POLL);
        }
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Batches successfully written so far.
    pub fn batches_sent(&self) -> u64 {
        self.batches_sent
    }

    /// Responses that matched their write.
    pub fn acknowledged(&self) -> u64 {
        self.shared.acknowledged.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.shared.errors.load(Ordering::SeqCst)
    }

    /// Whether any error was recorded since the previous call.
    pub fn take_error_signal(&mut self) -> bool {
        let now = self.errors();
        let raised = now != self.errors_seen;
        self.errors_seen = now;
        raised
    }

    /// Drop the pending batch without sending it.
    pub fn discard_pending(&mut self) {
        self.batch.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.batch.len()
    }

    pub fn stats(&self) -> PipelineStats {
        let link = lock(&self.shared.link);
        PipelineStats {
            batches_sent: self.batches_sent,
            acknowledged: self.acknowledged(),
            errors: self.errors(),
            in_flight: self.in_flight(),
            depth: self.depth,
            throughput: link.throughput(),
            rtt: link.rtt(),
        }
    }
}

impl Drop for TransmissionPipeline {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.changed.notify_all();
        if let Some(handle) = self.drainer.take() {
            if handle.join().is_err() {
                warn!("drain thread panicked");
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::ErrorFlags;
    use std::sync::atomic::AtomicUsize;

    /// Answers each write once `release` permits, optionally short.
    #[derive(Default)]
    struct TestChannel {
        writes: Mutex<Vec<Vec<u8>>>,
        responses: Mutex<VecDeque<usize>>,
        arrived: Condvar,
        /// Number of responses allowed out; `usize::MAX` for unlimited.
        budget: AtomicUsize,
        short_every: Option<usize>,
    }

    impl TestChannel {
        fn open() -> Arc<Self> {
            Arc::new(Self {
                budget: AtomicUsize::new(usize::MAX),
                ..Default::default()
            })
        }

        fn gated() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn release(&self, n: usize) {
            self.budget.fetch_add(n, Ordering::SeqCst);
            self.arrived.notify_all();
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            lock(&self.writes).clone()
        }
    }

    impl DrawChannel for TestChannel {
        fn write_pipelined(&self, bytes: &[u8]) -> Result<usize, DrawError> {
            let mut writes = lock(&self.writes);
            writes.push(bytes.to_vec());
            let short = self.short_every.is_some_and(|k| writes.len() % k == 0);
            lock(&self.responses).push_back(if short { bytes.len() - 1 } else { bytes.len() });
            self.arrived.notify_all();
            Ok(bytes.len())
        }

        fn receive_one_response(&self) -> Result<usize, DrawError> {
            let mut responses = lock(&self.responses);
            loop {
                if self.budget.load(Ordering::SeqCst) > 0 {
                    if let Some(n) = responses.pop_front() {
                        let _ = self
                            .budget
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                                Some(if b == usize::MAX { b } else { b - 1 })
                            });
                        return Ok(n);
                    }
                }
                responses = self.arrived.wait(responses).unwrap();
            }
        }

        fn take_error_flags(&self) -> ErrorFlags {
            ErrorFlags::empty()
        }
    }

    fn config(max_write: usize, depth: usize) -> PipelineConfig {
        PipelineConfig {
            max_write,
            depth_policy: DepthPolicy::Fixed { depth },
            send_timeout_ms: 5_000,
        }
    }

    #[test]
    fn rejects_small_max_write() {
        assert!(config(1024, 4).validate().is_err());
        assert!(config(MIN_WRITE, 4).validate().is_ok());
        assert!(config(4096, 0).validate().is_err());
        let bad = PipelineConfig {
            max_write: 4096,
            depth_policy: DepthPolicy::Adaptive { initial: 4, min: 8, max: 2 },
            send_timeout_ms: 5_000,
        };
        assert!(bad.validate().is_err());
        let mut no_wait = config(4096, 4);
        no_wait.send_timeout_ms = 0;
        assert!(no_wait.validate().is_err());
    }

    #[test]
    fn batches_never_exceed_max_write() {
        let channel = TestChannel::open();
        let mut p = TransmissionPipeline::new(channel.clone(), config(MIN_WRITE, 8)).unwrap();
        for i in 0..20u8 {
            p.push(&[i; 700]).unwrap();
        }
        p.end_frame().unwrap();
        p.wait_idle(Duration::from_secs(5)).unwrap();

        let writes = channel.writes();
        assert!(writes.iter().all(|w| w.len() <= MIN_WRITE));
        assert_eq!(writes.iter().map(Vec::len).sum::<usize>(), 20 * 700);
        // Order is preserved across batch boundaries.
        let flat: Vec<u8> = writes.concat();
        assert_eq!(flat[0], 0);
        assert_eq!(flat[flat.len() - 1], 19);
        assert_eq!(p.acknowledged(), writes.len() as u64);
        assert_eq!(p.errors(), 0);
    }

    #[test]
    fn oversized_command_is_a_capacity_error() {
        let mut p = TransmissionPipeline::new(TestChannel::open(), config(MIN_WRITE, 8)).unwrap();
        let err = p.push(&vec![0; MIN_WRITE + 1]).unwrap_err();
        assert!(matches!(err, DrawError::CapacityExceeded { .. }));
    }

    #[test]
    fn sender_blocks_at_depth() {
        let channel = TestChannel::gated();
        let mut p = TransmissionPipeline::new(channel.clone(), config(MIN_WRITE, 2)).unwrap();
        p.push(&[1; MIN_WRITE]).unwrap();
        p.push(&[2; MIN_WRITE]).unwrap();
        p.push(&[3; MIN_WRITE]).unwrap();
        assert_eq!(p.in_flight(), 2);

        let releaser = {
            let channel = channel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                channel.release(usize::MAX / 2);
            })
        };
        // Third batch can only go once one response has drained.
        p.flush().unwrap();
        releaser.join().unwrap();
        p.wait_idle(Duration::from_secs(5)).unwrap();
        assert_eq!(channel.writes().len(), 3);
        assert_eq!(p.acknowledged(), 3);
    }

    #[test]
    fn full_pipeline_send_times_out() {
        let channel = TestChannel::gated();
        let mut cfg = config(MIN_WRITE, 2);
        cfg.send_timeout_ms = 50;
        let mut p = TransmissionPipeline::new(channel.clone(), cfg).unwrap();
        p.push(&[1; MIN_WRITE]).unwrap();
        p.push(&[2; MIN_WRITE]).unwrap();
        p.push(&[3; MIN_WRITE]).unwrap();
        assert_eq!(p.in_flight(), 2);

        let started = Instant::now();
        let err = p.flush().unwrap_err();
        assert!(matches!(err, DrawError::Timeout(t) if t == Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(channel.writes().len(), 2);

        // The drainer finishes outstanding work before the pipeline drops.
        channel.release(usize::MAX / 2);
        p.wait_idle(Duration::from_secs(5)).unwrap();
        assert_eq!(p.acknowledged(), 2);
    }

    #[test]
    fn short_response_counts_as_error() {
        let channel = Arc::new(TestChannel {
            budget: AtomicUsize::new(usize::MAX),
            short_every: Some(2),
            ..Default::default()
        });
        let mut p = TransmissionPipeline::new(channel, config(MIN_WRITE, 8)).unwrap();
        for _ in 0..4 {
            p.push(&[7; MIN_WRITE]).unwrap();
        }
        p.end_frame().unwrap();
        p.wait_idle(Duration::from_secs(5)).unwrap();
        assert_eq!(p.errors(), 2);
        assert_eq!(p.acknowledged(), 2);
        assert!(p.take_error_signal());
        assert!(!p.take_error_signal());
    }

    #[test]
    fn paused_pipeline_refuses_sends() {
        let channel = TestChannel::open();
        let mut p = TransmissionPipeline::new(channel.clone(), config(MIN_WRITE, 4)).unwrap();
        p.push(&[1; 100]).unwrap();
        p.flush().unwrap();
        p.pause(Duration::from_secs(5)).unwrap();
        assert_eq!(p.in_flight(), 0);

        p.push(&[2; 100]).unwrap();
        assert!(matches!(p.flush(), Err(DrawError::Paused)));
        p.resume();
        p.push(&[3; 100]).unwrap();
        p.flush().unwrap();
        p.wait_idle(Duration::from_secs(5)).unwrap();
        assert_eq!(channel.writes().len(), 2);
    }

    #[test]
    fn pause_times_out_when_remote_is_silent() {
        let channel = TestChannel::gated();
        let mut p = TransmissionPipeline::new(channel.clone(), config(MIN_WRITE, 4)).unwrap();
        p.push(&[1; 10]).unwrap();
        p.flush().unwrap();
        let err = p.pause(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DrawError::Timeout(_)));
        channel.release(1);
    }

    #[test]
    fn adaptive_depth_hysteresis() {
        let policy = DepthPolicy::Adaptive { initial: 16, min: 4, max: 64 };
        let ms = Duration::from_millis;
        assert_eq!(policy.revise(16, ms(10), ms(10)), 16);
        assert_eq!(policy.revise(16, ms(10), ms(19)), 16);
        assert_eq!(policy.revise(16, ms(10), ms(40)), 12);
        assert_eq!(policy.revise(16, ms(50), ms(10)), 20);
        assert_eq!(policy.revise(2, ms(50), ms(10)), 4);
        assert_eq!(policy.revise(64, ms(50), ms(10)), 64);
        assert_eq!(policy.revise(4, ms(1), ms(100)), 4);
        assert_eq!(policy.revise(8, ms(1), ms(100)), 6);

        let down_to_one = DepthPolicy::Adaptive { initial: 3, min: 1, max: 8 };
        assert_eq!(down_to_one.revise(3, ms(1), ms(100)), 2);
        assert_eq!(down_to_one.revise(2, ms(1), ms(100)), 1);
        assert_eq!(down_to_one.revise(1, ms(1), ms(100)), 1);
        assert_eq!(DepthPolicy::Fixed { depth: 64 }.revise(64, ms(1), ms(100)), 64);
    }

    #[test]
    fn channel_limit_caps_max_write() {
        struct Small(Arc<TestChannel>);
        impl DrawChannel for Small {
            fn write_pipelined(&self, bytes: &[u8]) -> Result<usize, DrawError> {
                self.0.write_pipelined(bytes)
            }
            fn receive_one_response(&self) -> Result<usize, DrawError> {
                self.0.receive_one_response()
            }
            fn take_error_flags(&self) -> ErrorFlags {
                ErrorFlags::empty()
            }
            fn max_write(&self) -> Option<usize> {
                Some(4096)
            }
        }
        let p = TransmissionPipeline::new(Arc::new(Small(TestChannel::open())), config(65536, 4)).unwrap();
        assert_eq!(p.max_write(), 4096);
    }
}

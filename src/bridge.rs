// src/bridge.rs
//
// The bridge loop. One task owns both channels and alternates between them:
//
//   1. pump the broker for at most `pump_interval` (keep-alive, outgoing
//      publishes, inbound messages)
//   2. handle inbound messages (decode, optionally send to the bus)
//   3. drain every buffered bus frame (up to `max_frames_per_cycle`),
//      encoding and publishing each one fire-and-forget
//
// Neither step blocks beyond its bound, so neither direction starves the
// other. The stop flag is only checked between cycles.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::io::{
    BridgeError, BridgeMessage, BrokerChannel, BusChannel, FrameCodec, InboundMessage,
};
use crate::settings::LoopConfig;

/// Published messages remembered for echo suppression.
const ECHO_WINDOW: usize = 4096;

/// How long shutdown waits for queued publishes to leave.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Options and Reports
// ============================================================================

/// Immutable loop parameters.
#[derive(Clone, Debug)]
pub struct BridgeOptions {
    pub base_topic: String,
    pub pump_interval: Duration,
    pub max_frames_per_cycle: usize,
    pub forward_inbound: bool,
    /// Zero disables the periodic stats line
    pub stats_interval: Duration,
}

impl From<&LoopConfig> for BridgeOptions {
    fn from(config: &LoopConfig) -> Self {
        Self {
            base_topic: config.topic.clone(),
            pump_interval: Duration::from_millis(config.pump_interval_ms),
            max_frames_per_cycle: config.max_frames_per_cycle,
            forward_inbound: config.forward_inbound,
            stats_interval: Duration::from_secs(config.stats_interval_secs),
        }
    }
}

/// What a single cycle did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub inbound: usize,
    pub forwarded: usize,
    pub drained: usize,
    pub published: usize,
    pub publish_failures: usize,
}

/// Running totals since the loop started.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub cycles: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub inbound: u64,
    pub forwarded: u64,
    pub forward_failures: u64,
    pub decode_failures: u64,
    pub echoes_dropped: u64,
}

// ============================================================================
// Echo Filter
// ============================================================================

/// Remembers recently published messages so the bridge can recognise its own
/// publishes coming back through the `{base}/+` subscription.
pub struct EchoFilter {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
    capacity: usize,
}

impl EchoFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn fingerprint(topic: &str, body: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        topic.hash(&mut hasher);
        body.hash(&mut hasher);
        hasher.finish()
    }

    pub fn remember(&mut self, message: &BridgeMessage) {
        if self.capacity == 0 {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        let fp = Self::fingerprint(&message.topic, &message.body);
        self.order.push_back(fp);
        self.seen.insert(fp);
    }

    /// True (once) if this message is one we published.
    pub fn take(&mut self, topic: &str, body: &[u8]) -> bool {
        self.seen.remove(&Self::fingerprint(topic, body))
    }
}

// ============================================================================
// Bridge Loop
// ============================================================================

pub struct BridgeLoop<B: BusChannel, M: BrokerChannel> {
    bus: B,
    broker: M,
    options: BridgeOptions,
    echo: EchoFilter,
    stats: BridgeStats,
    last_stats: Instant,
}

impl<B: BusChannel, M: BrokerChannel> BridgeLoop<B, M> {
    pub fn new(bus: B, broker: M, options: BridgeOptions) -> Self {
        let echo_window = if options.forward_inbound { ECHO_WINDOW } else { 0 };
        Self {
            bus,
            broker,
            options,
            echo: EchoFilter::new(echo_window),
            stats: BridgeStats::default(),
            last_stats: Instant::now(),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn broker(&self) -> &M {
        &self.broker
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Subscribe to `{base}/+` and run cycles until `stop` is set.
    ///
    /// A failed subscribe or a fatal bus error ends the loop with that error.
    /// Either way the broker is flushed and disconnected and the bus is closed
    /// before returning.
    pub async fn run(&mut self, stop: Arc<AtomicBool>) -> Result<BridgeStats, BridgeError> {
        let result = self.run_until_stopped(&stop).await;

        self.broker.shutdown(SHUTDOWN_TIMEOUT).await;
        self.bus.close().await;

        match result {
            Ok(()) => {
                info!(
                    published = self.stats.published,
                    publish_failures = self.stats.publish_failures,
                    "bridge stopped"
                );
                Ok(self.stats.clone())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_until_stopped(&mut self, stop: &AtomicBool) -> Result<(), BridgeError> {
        let filter = FrameCodec::subscription(&self.options.base_topic);
        self.broker.subscribe(&filter)?;

        info!(
            bus = %self.bus.name(),
            topic = %self.options.base_topic,
            forward_inbound = self.options.forward_inbound,
            "bridge running"
        );

        while !stop.load(Ordering::Relaxed) {
            self.run_cycle().await?;
            self.maybe_log_stats();
        }
        Ok(())
    }

    /// One scheduling cycle: pump, handle inbound, drain the bus.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, BridgeError> {
        let mut report = CycleReport::default();
        self.stats.cycles += 1;

        let inbound = self.broker.pump(self.options.pump_interval).await;
        for message in inbound {
            self.handle_inbound(message, &mut report);
        }

        while report.drained < self.options.max_frames_per_cycle {
            let frame = match self.bus.try_receive() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // A transmit of an earlier inbound frame failed
                    self.stats.forward_failures += 1;
                    warn!("{}", e);
                    continue;
                }
            };
            report.drained += 1;

            let message = FrameCodec::encode(&frame, &self.options.base_topic);
            trace!(
                id = frame.arbitration_id,
                data = %hex::encode(&frame.payload),
                "publishing {}",
                message.topic
            );

            if self.options.forward_inbound {
                self.echo.remember(&message);
            }

            let topic = message.topic;
            match self.broker.publish(&topic, message.body) {
                Ok(()) => {
                    report.published += 1;
                    self.stats.published += 1;
                }
                Err(e) => {
                    report.publish_failures += 1;
                    self.stats.publish_failures += 1;
                    warn!("dropping frame: {}", e);
                }
            }
        }

        if report.drained == self.options.max_frames_per_cycle {
            debug!(
                "drain cap of {} frames reached, remainder deferred to next cycle",
                report.drained
            );
        }

        Ok(report)
    }

    fn handle_inbound(&mut self, message: InboundMessage, report: &mut CycleReport) {
        report.inbound += 1;
        self.stats.inbound += 1;

        if self.echo.take(&message.topic, &message.payload) {
            self.stats.echoes_dropped += 1;
            return;
        }

        let frame = match FrameCodec::decode(&message.topic, &message.payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.decode_failures += 1;
                warn!("skipping inbound message on '{}': {}", message.topic, e);
                return;
            }
        };

        debug!(
            id = frame.arbitration_id,
            data = %hex::encode(&frame.payload),
            "inbound frame on {}",
            message.topic
        );

        if !self.options.forward_inbound {
            return;
        }

        match self.bus.send(&frame) {
            Ok(()) => {
                report.forwarded += 1;
                self.stats.forwarded += 1;
            }
            Err(e) => {
                self.stats.forward_failures += 1;
                warn!("not forwarding inbound frame: {}", e);
            }
        }
    }

    fn maybe_log_stats(&mut self) {
        if self.options.stats_interval.is_zero() || self.last_stats.elapsed() < self.options.stats_interval {
            return;
        }
        self.last_stats = Instant::now();

        let s = &self.stats;
        info!(
            published = s.published,
            publish_failures = s.publish_failures,
            inbound = s.inbound,
            forwarded = s.forwarded,
            decode_failures = s.decode_failures,
            "bridge stats"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Flow Streamer
//!
//! Run driver: wires source, dispatcher and meters together and exposes the
//! finalized flows as an iterator.
//!
//! - `n_meters = 0`: one meter runs inline on the consumer's thread
//! - `n_meters > 0`: a dispatcher thread feeds one thread per meter over
//!   bounded channels; flows come back on a shared output channel
//!
//! Stopping (end of input, [`FlowStream::stop`], or dropping the stream)
//! always flushes every open flow before the workers exit.

use crate::anonymize::Anonymizer;
use crate::classify::{Classifier, NoClassifier};
use crate::config::StreamerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, StreamError, StreamResult};
use crate::export::{CsvWriter, Frame};
use crate::flow::FlowRecord;
use crate::meter::{build_pipeline, Meter};
use crate::packet::Packet;
use crate::pipeline::Plugin;
use crate::source::{JsonLinesSource, PacketSource};
use crate::stats::{MeterStats, PerformanceAggregator, PerformanceReport};
use crate::timer::RepeatedTimer;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Packets buffered per meter
pub const METER_QUEUE_SIZE: usize = 1024;
/// Finalized flows buffered for the consumer
pub const OUTPUT_QUEUE_SIZE: usize = 4096;

type ReportSink = Arc<dyn Fn(&PerformanceReport) + Send + Sync>;

/// Configured metering run, ready to stream
pub struct FlowStreamer {
    config: StreamerConfig,
    udps: Vec<Arc<dyn Plugin>>,
    classifier: Arc<dyn Classifier>,
    report_sink: ReportSink,
}

impl FlowStreamer {
    pub fn new(config: StreamerConfig) -> Self {
        Self {
            config,
            udps: Vec::new(),
            classifier: Arc::new(NoClassifier),
            report_sink: Arc::new(|report: &PerformanceReport| println!("{}", report.to_json_line())),
        }
    }

    /// Register a user plugin; its fields are exported under `udps.`
    pub fn with_plugin(self, plugin: impl Plugin + 'static) -> Self {
        self.with_shared_plugin(Arc::new(plugin))
    }

    /// Register a plugin instance shared with the caller
    pub fn with_shared_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.udps.push(plugin);
        self
    }

    /// Set the inspection engine
    pub fn with_classifier(mut self, classifier: impl Classifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Replace the default stdout JSON-line report printer
    pub fn with_report_sink(mut self, sink: impl Fn(&PerformanceReport) + Send + Sync + 'static) -> Self {
        self.report_sink = Arc::new(sink);
        self
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Stream from the configured source file
    pub fn stream(&self) -> StreamResult<FlowStream> {
        let path = self
            .config
            .observer
            .source
            .as_ref()
            .ok_or_else(|| ConfigError::Source("no source configured".into()))?;
        let source = JsonLinesSource::open(path)?;
        self.stream_from(source)
    }

    /// Stream from any packet source
    pub fn stream_from<S: PacketSource + 'static>(&self, source: S) -> StreamResult<FlowStream> {
        let source: Box<dyn PacketSource> = Box::new(source);
        let n_meters = self.config.n_meters;
        let stats = Arc::new(MeterStats::new(n_meters.max(1)));
        let semantics = source.counter_semantics();
        let aggregator = PerformanceAggregator::new(stats.clone(), semantics);
        let running = Arc::new(AtomicBool::new(true));

        let run = if n_meters == 0 {
            Run::Inline(Box::new(InlineRun {
                dispatcher: Dispatcher::new(&self.config.observer, semantics, stats.clone()),
                meter: self.meter(0, stats),
                source,
                pending: VecDeque::new(),
                scratch: Vec::new(),
                done: false,
            }))
        } else {
            Run::Threaded(self.spawn_workers(source, stats, running.clone())?)
        };

        let timer = match self.config.performance_report {
            Some(interval) => {
                let sink = self.report_sink.clone();
                let reporter = aggregator.clone();
                let timer = RepeatedTimer::new(interval, move || sink(&reporter.report()));
                timer.start()?;
                Some(timer)
            }
            None => None,
        };

        tracing::info!(
            n_meters,
            statistical_analysis = self.config.meter.statistical_analysis,
            splt_analysis = self.config.meter.splt_analysis,
            plugins = self.udps.len(),
            "flow streamer started"
        );

        Ok(FlowStream {
            run,
            running,
            aggregator,
            timer,
            fused: false,
        })
    }

    /// Collect the configured source into a table
    pub fn to_frame(&self, anonymizer: Option<&dyn Anonymizer>) -> StreamResult<Frame> {
        self.stream()?.to_frame(anonymizer)
    }

    /// Write the configured source as CSV. Returns the number of flows.
    pub fn to_csv(&self, path: impl AsRef<Path>, anonymizer: Option<&dyn Anonymizer>) -> StreamResult<usize> {
        self.stream()?.to_csv(path, anonymizer)
    }

    fn meter(&self, index: usize, stats: Arc<MeterStats>) -> Meter {
        Meter::new(
            index,
            self.config.meter,
            build_pipeline(&self.config.meter, &self.udps),
            self.classifier.clone(),
            stats,
        )
    }

    fn spawn_workers(
        &self,
        mut source: Box<dyn PacketSource>,
        stats: Arc<MeterStats>,
        running: Arc<AtomicBool>,
    ) -> StreamResult<ThreadedRun> {
        let n_meters = self.config.n_meters;
        let (output_tx, output) = bounded::<StreamResult<FlowRecord>>(OUTPUT_QUEUE_SIZE);
        let mut senders = Vec::with_capacity(n_meters);
        let mut threads = Vec::with_capacity(n_meters + 1);

        for index in 0..n_meters {
            let (tx, rx) = bounded::<Packet>(METER_QUEUE_SIZE);
            senders.push(tx);
            let mut meter = self.meter(index, stats.clone());
            let output = output_tx.clone();
            let running = running.clone();

            let handle = thread::Builder::new()
                .name(format!("flowmeter-meter-{}", index))
                .spawn(move || run_meter(&mut meter, rx, output, &running))
                .map_err(|e| StreamError::SpawnFailed(e.to_string()))?;
            threads.push(handle);
        }

        let mut dispatcher = Dispatcher::new(&self.config.observer, source.counter_semantics(), stats);
        let handle = thread::Builder::new()
            .name("flowmeter-dispatcher".to_string())
            .spawn(move || {
                run_dispatcher(&mut dispatcher, source.as_mut(), senders, output_tx, &running)
            })
            .map_err(|e| StreamError::SpawnFailed(e.to_string()))?;
        threads.push(handle);

        Ok(ThreadedRun { output, threads })
    }
}

/// Meter worker loop: runs until the dispatcher hangs up
fn run_meter(
    meter: &mut Meter,
    packets: Receiver<Packet>,
    output: Sender<StreamResult<FlowRecord>>,
    running: &AtomicBool,
) {
    tracing::debug!(meter = meter.index(), "meter started");
    let mut expired = Vec::new();

    for packet in packets.iter() {
        if let Err(e) = meter.process(&packet, &mut expired) {
            tracing::warn!(meter = meter.index(), error = %e, "metering aborted");
            running.store(false, Ordering::Release);
            let _ = output.send(Err(e));
            return;
        }
        for flow in expired.drain(..) {
            if output.send(Ok(flow)).is_err() {
                return;
            }
        }
    }

    meter.flush(&mut expired);
    for flow in expired.drain(..) {
        if output.send(Ok(flow)).is_err() {
            return;
        }
    }
    tracing::debug!(meter = meter.index(), "meter stopped");
}

/// Dispatcher loop: feeds meters until end of input or stop
fn run_dispatcher(
    dispatcher: &mut Dispatcher,
    source: &mut dyn PacketSource,
    senders: Vec<Sender<Packet>>,
    output: Sender<StreamResult<FlowRecord>>,
    running: &AtomicBool,
) {
    while running.load(Ordering::Acquire) {
        match dispatcher.next(source) {
            Ok(Some(routed)) => {
                if senders[routed.meter].send(routed.packet).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "packet source failed");
                running.store(false, Ordering::Release);
                let _ = output.send(Err(e.into()));
                break;
            }
        }
    }
    dispatcher.publish(source.capture_stats());
    // dropping the senders lets every meter flush
    drop(senders);
}

struct InlineRun {
    source: Box<dyn PacketSource>,
    dispatcher: Dispatcher,
    meter: Meter,
    pending: VecDeque<FlowRecord>,
    scratch: Vec<FlowRecord>,
    done: bool,
}

impl InlineRun {
    fn next_record(&mut self, running: &AtomicBool) -> Option<StreamResult<FlowRecord>> {
        loop {
            if let Some(flow) = self.pending.pop_front() {
                return Some(Ok(flow));
            }
            if self.done {
                return None;
            }
            if !running.load(Ordering::Acquire) {
                self.finish();
                continue;
            }

            match self.dispatcher.next(self.source.as_mut()) {
                Ok(Some(routed)) => {
                    if let Err(e) = self.meter.process(&routed.packet, &mut self.scratch) {
                        return Some(Err(e));
                    }
                    self.pending.extend(self.scratch.drain(..));
                }
                Ok(None) => self.finish(),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    fn finish(&mut self) {
        self.dispatcher.publish(self.source.capture_stats());
        self.meter.flush(&mut self.scratch);
        self.pending.extend(self.scratch.drain(..));
        self.done = true;
    }
}

struct ThreadedRun {
    output: Receiver<StreamResult<FlowRecord>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl ThreadedRun {
    fn join(&mut self) {
        // keep workers unblocked until they hang up
        for _ in self.output.iter() {}
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

enum Run {
    Inline(Box<InlineRun>),
    Threaded(ThreadedRun),
}

/// Requests a running stream to stop from another thread
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Iterator over finalized flows. Fused after the first error.
pub struct FlowStream {
    run: Run,
    running: Arc<AtomicBool>,
    aggregator: PerformanceAggregator,
    timer: Option<RepeatedTimer>,
    fused: bool,
}

impl FlowStream {
    /// Stop reading packets; flows still open are flushed and yielded
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.running.clone())
    }

    /// Current counters across all meters
    pub fn performance_report(&self) -> PerformanceReport {
        self.aggregator.report()
    }

    /// Drain into a table
    pub fn to_frame(self, anonymizer: Option<&dyn Anonymizer>) -> StreamResult<Frame> {
        Frame::collect(self, anonymizer)
    }

    /// Drain into a CSV file. Returns the number of flows.
    pub fn to_csv(self, path: impl AsRef<Path>, anonymizer: Option<&dyn Anonymizer>) -> StreamResult<usize> {
        let file = File::create(path.as_ref())?;
        let mut writer = CsvWriter::new(BufWriter::new(file));
        let rows = writer.write_all(self, anonymizer)?;
        tracing::info!(path = %path.as_ref().display(), rows, "flows exported");
        Ok(rows)
    }

    fn finish(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        tracing::info!(report = %self.aggregator.report().to_json_line(), "flow streamer stopped");
    }
}

impl Iterator for FlowStream {
    type Item = StreamResult<FlowRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }

        let item = match &mut self.run {
            Run::Inline(run) => run.next_record(&self.running),
            Run::Threaded(run) => run.output.recv().ok(),
        };

        match item {
            Some(Ok(flow)) => Some(Ok(flow)),
            Some(Err(e)) => {
                self.fused = true;
                self.running.store(false, Ordering::Release);
                self.finish();
                Some(Err(e))
            }
            None => {
                self.fused = true;
                self.finish();
                None
            }
        }
    }
}

impl std::iter::FusedIterator for FlowStream {}

impl Drop for FlowStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        if let Run::Threaded(run) = &mut self.run {
            run.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymize::KeyedAnonymizer;
    use crate::error::PluginError;
    use crate::flow::FlowKey;
    use crate::pipeline::{FlowPacket, FlowView};
    use crate::source::MemorySource;
    use crate::splt::{Splt, SPLT_DIRECTION, SPLT_PIAT, SPLT_PS};
    use crate::packet::AccountingMode;
    use crate::stats::{CaptureStats, CounterSemantics};
    use crate::testing::{mixed_trace, tcp_session, v4};
    use parking_lot::Mutex;
    use std::time::Duration;

    type Boundary = (String, u64, u64, u64, u64);

    fn boundaries(flows: &[FlowRecord]) -> Vec<Boundary> {
        let mut out: Vec<Boundary> = flows
            .iter()
            .map(|f| {
                (
                    format!("{:?}", f.key),
                    f.bidirectional.first_seen_ms,
                    f.bidirectional.last_seen_ms,
                    f.bidirectional.packets,
                    f.bidirectional.bytes,
                )
            })
            .collect();
        out.sort();
        out
    }

    fn collect(streamer: &FlowStreamer, packets: Vec<Packet>) -> Vec<FlowRecord> {
        streamer
            .stream_from(MemorySource::from(packets))
            .unwrap()
            .collect::<StreamResult<Vec<_>>>()
            .unwrap()
    }

    fn streamer(build: impl FnOnce(crate::config::RawConfig) -> crate::config::RawConfig) -> FlowStreamer {
        FlowStreamer::new(build(StreamerConfig::builder()).build().unwrap())
    }

    struct FourPacketExpire;

    impl Plugin for FourPacketExpire {
        fn on_update(&self, _packet: &FlowPacket<'_>, flow: &mut FlowView<'_>) -> Result<(), PluginError> {
            if flow.bidirectional.packets == 4 {
                flow.set_expiration_id(-1);
            }
            Ok(())
        }
    }

    #[test]
    fn test_flow_boundaries_independent_of_meter_count() {
        let trace = mixed_trace();
        let reference = boundaries(&collect(&streamer(|c| c.n_meters(0)), trace.clone()));
        assert_eq!(reference.len(), 8);

        for n in [1, 4] {
            let flows = collect(&streamer(|c| c.n_meters(n)), trace.clone());
            assert_eq!(boundaries(&flows), reference, "n_meters = {n}");
        }
    }

    #[test]
    fn test_expiration_policies_across_meter_counts() {
        let trace = mixed_trace();
        for n in [0, 1, 4] {
            let idle = collect(&streamer(|c| c.n_meters(n).idle_timeout(0)), trace.clone());
            assert_eq!(idle.len(), trace.len());

            let active = collect(&streamer(|c| c.n_meters(n).active_timeout(0)), trace.clone());
            assert_eq!(active.len(), trace.len());

            let four = collect(&streamer(|c| c.n_meters(n)).with_plugin(FourPacketExpire), trace.clone());
            let mut per_key = std::collections::HashMap::<FlowKey, u64>::new();
            for p in &trace {
                *per_key.entry(FlowKey::from_packet(p)).or_default() += 1;
            }
            let expected: u64 = per_key.values().map(|n| n.div_ceil(4)).sum();
            assert_eq!(four.len() as u64, expected, "n_meters = {n}");
        }
    }

    #[test]
    fn test_ids_stable_across_runs() {
        let trace = mixed_trace();
        let s = streamer(|c| c.idle_timeout(0));
        let first: Vec<u64> = collect(&s, trace.clone()).iter().map(|f| f.id).collect();
        let second: Vec<u64> = collect(&s, trace.clone()).iter().map(|f| f.id).collect();

        assert_eq!(first, second);
        assert_eq!(*first.last().unwrap(), trace.len() as u64 - 1);
    }

    #[test]
    fn test_filter_restricts_flows() {
        for n in [0, 2] {
            let flows = collect(
                &streamer(|c| c.n_meters(n).bpf_filter("src port 52066 or dst port 52066")),
                mixed_trace(),
            );
            assert_eq!(flows.len(), 1);
            assert_eq!(flows[0].src_port, 52066);
            assert_eq!(flows[0].id, 0);
        }
    }

    #[test]
    fn test_builtin_splt_matches_user_splt() {
        let packets = tcp_session(v4(172, 31, 3, 224), 42835, v4(216, 58, 212, 100), 443, 0, 30, 12);
        let s = streamer(|c| c.splt_analysis(5)).with_plugin(Splt::new(5, AccountingMode::Raw));
        let flows = collect(&s, packets.clone());

        for name in [SPLT_DIRECTION, SPLT_PS, SPLT_PIAT] {
            assert!(flows[0].feature(name).is_some());
            assert_eq!(flows[0].feature(name), flows[0].udp(name), "{name}");
        }

        let frame = s.stream_from(MemorySource::from(packets)).unwrap().to_frame(None).unwrap();
        assert_eq!(frame.column("splt_ps"), frame.column("udps.splt_ps"));
        assert_eq!(frame.column("splt_direction").unwrap()[0], &serde_json::json!([0, 1, 0, 0, 1]));
    }

    #[test]
    fn test_plugin_error_is_fatal() {
        struct Exploding;
        impl Plugin for Exploding {
            fn name(&self) -> &str {
                "exploding"
            }
            fn on_update(&self, _packet: &FlowPacket<'_>, _flow: &mut FlowView<'_>) -> Result<(), PluginError> {
                Err(PluginError::new("unexpected state"))
            }
        }

        for n in [0, 2] {
            let s = streamer(|c| c.n_meters(n)).with_plugin(Exploding);
            let mut stream = s.stream_from(MemorySource::from(mixed_trace())).unwrap();

            let first_error = stream.by_ref().find_map(|item| item.err());
            match first_error {
                Some(StreamError::Plugin { plugin, .. }) => assert_eq!(plugin, "exploding"),
                other => panic!("unexpected: {other:?}"),
            }
            assert!(stream.next().is_none());
        }
    }

    #[test]
    fn test_export_interfaces_agree() {
        let s = streamer(|c| c.statistical_analysis(true).n_dissections(20));
        let plain = s.stream_from(MemorySource::from(mixed_trace())).unwrap().to_frame(None).unwrap();
        let anon = KeyedAnonymizer::new();
        let hidden = s
            .stream_from(MemorySource::from(mixed_trace()))
            .unwrap()
            .to_frame(Some(&anon))
            .unwrap();

        assert_eq!(plain.shape(), hidden.shape());
        assert_eq!(plain.n_unique("src_ip"), hidden.n_unique("src_ip"));
        assert_eq!(plain.n_unique("dst_ip"), hidden.n_unique("dst_ip"));

        let path = std::env::temp_dir().join(format!("flowmeter-export-{}.csv", std::process::id()));
        let written = s
            .stream_from(MemorySource::from(mixed_trace()))
            .unwrap()
            .to_csv(&path, None)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(written, plain.len());
        assert_eq!(text.lines().count(), plain.len() + 1);
    }

    #[test]
    fn test_stream_from_configured_file() {
        let path = std::env::temp_dir().join(format!("flowmeter-source-{}.jsonl", std::process::id()));
        let lines: Vec<String> = tcp_session(v4(10, 0, 0, 1), 1000, v4(10, 0, 0, 2), 80, 0, 10, 6)
            .iter()
            .map(|p| serde_json::to_string(p).unwrap())
            .collect();
        std::fs::write(&path, lines.join("\n")).unwrap();

        let s = streamer(|c| c.source(path.clone()));
        let flows: Vec<FlowRecord> = s.stream().unwrap().collect::<StreamResult<_>>().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].bidirectional.packets, 6);
    }

    #[test]
    fn test_stream_without_source() {
        let s = FlowStreamer::new(StreamerConfig::default());
        assert!(matches!(s.stream(), Err(StreamError::Config(ConfigError::Source(_)))));
    }

    #[test]
    fn test_performance_report_after_run() {
        let trace = mixed_trace();
        for n in [0i64, 3] {
            let s = streamer(|c| c.n_meters(n).bpf_filter("tcp"));
            let source = MemorySource::from(trace.clone())
                .with_capture_stats(CaptureStats { dropped: 5, ignored: 0 })
                .with_counter_semantics(CounterSemantics::PerWorker);
            let mut stream = s.stream_from(source).unwrap();
            let flows = stream.by_ref().filter_map(Result::ok).count();
            let report = stream.performance_report();

            let udp = trace.iter().filter(|p| p.protocol == 17).count() as u64;
            assert_eq!(flows, 5);
            assert_eq!(report.expired_flows, 5);
            assert_eq!(report.packets_processed, trace.len() as u64 - udp);
            assert_eq!(report.packets_ignored, udp);
            assert_eq!(report.packets_dropped_filtered_by_kernel, 5);
            assert_eq!(report.meters_packets_load_balance.len(), n.max(1) as usize);
        }
    }

    #[test]
    fn test_report_sink_receives_reports() {
        struct Slow(MemorySource);
        impl PacketSource for Slow {
            fn next_packet(&mut self) -> Result<Option<Packet>, crate::error::SourceError> {
                std::thread::sleep(Duration::from_millis(300));
                self.0.next_packet()
            }
        }

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let s = streamer(|c| c.performance_report(1))
            .with_report_sink(move |r: &PerformanceReport| sink.lock().push(r.clone()));
        let packets = tcp_session(v4(10, 0, 0, 1), 1000, v4(10, 0, 0, 2), 80, 0, 10, 6);
        let flows = s
            .stream_from(Slow(MemorySource::from(packets)))
            .unwrap()
            .count();

        assert_eq!(flows, 1);
        assert!(!reports.lock().is_empty());
    }

    #[test]
    fn test_stop_flushes_open_flows() {
        let mut trace: Vec<Packet> = (0..200u16)
            .flat_map(|i| tcp_session(v4(10, 0, 1, i as u8), 20_000 + i, v4(10, 0, 0, 2), 80, u64::from(i) * 5, 3, 10))
            .collect();
        trace.sort_by_key(|p| p.time);
        let total = trace.len() as u64;

        for n in [0, 1, 3] {
            let s = streamer(|c| c.n_meters(n)).with_plugin(FourPacketExpire);
            let mut stream = s.stream_from(MemorySource::from(trace.clone())).unwrap();

            let mut flows: Vec<FlowRecord> = stream.by_ref().take(5).map(Result::unwrap).collect();
            assert_eq!(flows.len(), 5);
            assert!(flows.iter().all(|f| f.expiration_id == -1));

            stream.stop_handle().stop();
            flows.extend(stream.by_ref().map(Result::unwrap));
            assert!(stream.next().is_none());

            let report = stream.performance_report();
            let metered: u64 = flows.iter().map(|f| f.bidirectional.packets).sum();
            assert_eq!(metered, report.packets_processed, "n_meters = {n}");
            assert_eq!(report.expired_flows, flows.len() as u64, "n_meters = {n}");
            // flows still open at stop come out of the flush
            assert!(flows.iter().any(|f| f.expiration_id == 0), "n_meters = {n}");
            if n == 0 {
                assert!(report.packets_processed < total);
            }
        }
    }
}

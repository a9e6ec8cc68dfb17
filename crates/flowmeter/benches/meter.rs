//! Meter Benchmarks
//!
//! Per-packet cost of the metering hot path with Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowmeter::classify::NoClassifier;
use flowmeter::config::StreamerConfig;
use flowmeter::meter::{build_pipeline, Meter};
use flowmeter::stats::MeterStats;
use flowmeter::{FlowKey, FlowStreamer, MemorySource, Packet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Interleaved TCP packets over `n_flows` keys, 1ms apart
fn trace(n_flows: u32, n_packets: usize) -> Vec<Packet> {
    (0..n_packets)
        .map(|i| {
            let flow = i as u32 % n_flows;
            let client = IpAddr::V4(Ipv4Addr::from(0x0A00_0000 | flow));
            let server = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
            let p = if (i / n_flows as usize) % 2 == 0 {
                Packet::new(i as u64, client, 40_000, server, 443, 6)
            } else {
                Packet::new(i as u64, server, 443, client, 40_000, 6)
            };
            p.with_sizes(1500, 1486, 1466, 1434).with_tcp_flags(0x10)
        })
        .collect()
}

fn bench_flow_key(c: &mut Criterion) {
    let packet = &trace(1, 1)[0];

    c.bench_function("flow_key_hash", |b| {
        b.iter(|| FlowKey::from_packet(black_box(packet)).hash())
    });
}

fn bench_meter(c: &mut Criterion) {
    let mut group = c.benchmark_group("meter_process");

    for statistical in [false, true] {
        let config = StreamerConfig::builder()
            .statistical_analysis(statistical)
            .splt_analysis(if statistical { 10 } else { 0 })
            .build()
            .unwrap();
        let packets = trace(1024, 100_000);
        group.throughput(Throughput::Elements(packets.len() as u64));

        let label = if statistical { "features" } else { "counters" };
        group.bench_with_input(BenchmarkId::new(label, packets.len()), &packets, |b, packets| {
            b.iter(|| {
                let mut meter = Meter::new(
                    0,
                    config.meter,
                    build_pipeline(&config.meter, &[]),
                    Arc::new(NoClassifier),
                    Arc::new(MeterStats::new(1)),
                );
                let mut expired = Vec::new();
                for p in packets {
                    meter.process(p, &mut expired).unwrap();
                }
                meter.flush(&mut expired);
                black_box(expired.len())
            })
        });
    }
    group.finish();
}

fn bench_streamer(c: &mut Criterion) {
    let mut group = c.benchmark_group("streamer");
    let packets = trace(4096, 200_000);
    group.throughput(Throughput::Elements(packets.len() as u64));

    for n_meters in [0, 2, 4] {
        let streamer = FlowStreamer::new(StreamerConfig::builder().n_meters(n_meters).build().unwrap());
        group.bench_with_input(BenchmarkId::new("n_meters", n_meters), &packets, |b, packets| {
            b.iter(|| {
                let stream = streamer.stream_from(MemorySource::from(packets.clone())).unwrap();
                black_box(stream.count())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_flow_key, bench_meter, bench_streamer);
criterion_main!(benches);

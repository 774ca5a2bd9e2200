//! Criterion benchmarks for the discovery codec.
//!
//! The repeater decodes every datagram it receives before relaying it, so
//! decode latency bounds its throughput under a beacon storm.
//!
//! Run with:
//! ```bash
//! cargo bench --package ca-core --bench codec_bench
//! ```

use std::net::Ipv4Addr;

use ca_core::protocol::{
    decode_datagram, encode, encode_datagram, Beacon, ChannelName, Command,
    RegisterRepeaterRequest, SearchRequest, SearchResponse, ServerAddress, VersionCommand,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

// ── Command fixtures ──────────────────────────────────────────────────────────

fn make_beacon() -> Command {
    Command::Beacon(Beacon {
        server_minor_version: 13,
        server_port: 5064,
        beacon_id: 42,
        server_address: Ipv4Addr::new(10, 0, 0, 5),
    })
}

fn make_register() -> Command {
    Command::RegisterRepeaterRequest(RegisterRepeaterRequest {
        client_address: Ipv4Addr::LOCALHOST,
        listening_port: 49500,
    })
}

fn make_search(id: u32) -> Command {
    let name = ChannelName::new(format!("XF:31IDA-OP{{Tbl-Ax:X{id}}}Mtr")).unwrap();
    Command::SearchRequest(SearchRequest::new(name, id))
}

fn make_response() -> Command {
    Command::SearchResponse(SearchResponse {
        correlation_id: 7,
        server_port: 5064,
        server_address: ServerAddress::USE_SENDER,
        server_minor_version: 13,
    })
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for (name, command) in [
        ("beacon", make_beacon()),
        ("register", make_register()),
        ("search", make_search(1)),
        ("search_response", make_response()),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &command, |b, cmd| {
            b.iter(|| encode(black_box(cmd)))
        });
    }
    group.finish();
}

fn bench_decode_search_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_search_batch");
    for batch in [1u32, 8, 32] {
        let mut commands = vec![Command::Version(VersionCommand::default())];
        commands.extend((1..=batch).map(make_search));
        let bytes = encode_datagram(&commands);
        group.bench_with_input(BenchmarkId::from_parameter(batch), &bytes, |b, bytes| {
            b.iter(|| decode_datagram(black_box(bytes)))
        });
    }
    group.finish();
}

fn bench_decode_beacon(c: &mut Criterion) {
    let bytes = encode(&make_beacon());
    c.bench_function("decode_beacon", |b| {
        b.iter(|| decode_datagram(black_box(&bytes)))
    });
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode_search_batch,
    bench_decode_beacon
);
criterion_main!(benches);

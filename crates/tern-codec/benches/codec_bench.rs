//! Performance benchmarks for message encoding and decoding

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tern_codec::rdm::{DirectoryRefresh, DirectoryRequest, Service};
use tern_codec::{
    BincodeCodec, Codec, DirectoryMsg, Domain, Msg, MsgClass, MsgKey, ProtocolVersion,
    StreamStatus,
};

fn market_price(payload_len: usize) -> Msg {
    Msg::new(MsgClass::Update, Domain::MarketPrice, 5)
        .with_key(MsgKey::named("TRI.N").with_service(1))
        .with_status(StreamStatus::open_ok(""))
        .with_payload(vec![0x5A; payload_len])
}

/// Benchmark generic message encoding across payload sizes
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let codec = BincodeCodec;

    for size in [64usize, 1024, 16 * 1024] {
        let msg = market_price(size);
        let mut buf = vec![0u8; size + 256];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &msg, |b, msg| {
            b.iter(|| {
                codec
                    .encode(black_box(msg), ProtocolVersion::CURRENT, &mut buf)
                    .unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark generic message decoding across payload sizes
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let codec = BincodeCodec;

    for size in [64usize, 1024, 16 * 1024] {
        let mut buf = vec![0u8; size + 256];
        let len = codec
            .encode(&market_price(size), ProtocolVersion::CURRENT, &mut buf)
            .unwrap();
        buf.truncate(len);
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &buf, |b, buf| {
            b.iter(|| codec.decode(black_box(buf), ProtocolVersion::CURRENT).unwrap());
        });
    }

    group.finish();
}

/// Benchmark a large source directory through the typed layer
fn bench_directory_refresh(c: &mut Criterion) {
    let services: Vec<Service> = (1..=300u16)
        .map(|id| Service::new(id, format!("SERVICE_{id}")))
        .collect();
    let refresh = DirectoryMsg::Refresh(DirectoryRefresh::answering(
        &DirectoryRequest::new(2),
        services,
    ));

    c.bench_function("directory_refresh_300_services", |b| {
        b.iter(|| {
            let msg = black_box(&refresh).to_msg().unwrap();
            DirectoryMsg::from_msg(&msg).unwrap()
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_directory_refresh);
criterion_main!(benches);

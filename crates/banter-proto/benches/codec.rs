use banter_proto::{codec, ClientMsg, ClientPub, ServerData, ServerMsg};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn bench_encode(c: &mut Criterion) {
    let msg = ServerMsg::Data(ServerData {
        topic: "grpBookClub".into(),
        from: "usrAbCdEf".into(),
        head: None,
        seq: 42,
        ts: 1_700_000_000_000,
        content: json!({"txt": "The quick brown fox jumps over the lazy dog"}),
    });

    c.bench_function("encode_data", |b| {
        b.iter(|| codec::encode(black_box(&msg)).unwrap());
    });
}

fn bench_decode(c: &mut Criterion) {
    let msg = ClientMsg::Pub(ClientPub {
        id: "1".into(),
        topic: "grpBookClub".into(),
        head: None,
        content: json!({"txt": "The quick brown fox jumps over the lazy dog"}),
    });
    let encoded = codec::encode_client(&msg).unwrap();

    c.bench_function("decode_pub", |b| {
        b.iter(|| codec::decode(black_box(&encoded)).unwrap());
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);

use criterion::{criterion_group, criterion_main};

mod mqtt;

criterion_group!(
    benches,
    mqtt::codec::bench_encode_publish,
    mqtt::codec::bench_decode_publish,
    mqtt::codec::bench_decode_stream,
    mqtt::session::bench_qos1_round_trip,
    mqtt::session::bench_inbound_routing
);
criterion_main!(benches);

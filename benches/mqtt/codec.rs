use criterion::{BatchSize, Criterion, Throughput};
use heapless::Vec;
use libmqtt::mqtt::packet::{decode, Publish};
use libmqtt::mqtt::{Packet, QoS, MAX_PACKET_LEN};
use std::hint::black_box;

fn publish(payload_len: usize) -> Packet {
    let payload = vec![0x5Au8; payload_len];
    Packet::Publish(Publish::new("libmqtt/bench-topic", &payload, QoS::AtLeastOnce, Some(42)).unwrap())
}

fn encoded(packet: &Packet) -> Vec<u8, MAX_PACKET_LEN> {
    let mut frame = Vec::new();
    packet.encode(&mut frame).unwrap();
    frame
}

pub fn bench_encode_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_publish");
    for payload_len in [16usize, 256, 1024] {
        let packet = publish(payload_len);
        group.throughput(Throughput::Bytes(payload_len as u64));
        group.bench_function(format!("payload_{}", payload_len), |b| {
            let mut frame: Vec<u8, MAX_PACKET_LEN> = Vec::new();
            b.iter(|| {
                frame.clear();
                black_box(&packet).encode(&mut frame).unwrap();
                black_box(frame.len())
            })
        });
    }
    group.finish();
}

pub fn bench_decode_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_publish");
    for payload_len in [16usize, 256, 1024] {
        let frame = encoded(&publish(payload_len));
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_function(format!("payload_{}", payload_len), |b| {
            b.iter(|| decode(black_box(&frame)).unwrap())
        });
    }
    group.finish();
}

pub fn bench_decode_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_stream");
    let mut stream = std::vec::Vec::new();
    for n in 0..50u16 {
        stream.extend_from_slice(&encoded(&Packet::Puback(n + 1)));
        stream.extend_from_slice(&encoded(&publish(64)));
    }
    group.throughput(Throughput::Bytes(stream.len() as u64));

    group.bench_function("mixed_100_packets", |b| {
        b.iter_batched_ref(
            || stream.clone(),
            |buffer| {
                let mut offset = 0;
                while offset < buffer.len() {
                    let (packet, used) = decode(&buffer[offset..]).unwrap();
                    black_box(packet);
                    offset += used;
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

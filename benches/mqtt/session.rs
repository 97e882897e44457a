use criterion::{BatchSize, Criterion};
use libmqtt::mqtt::packet::{Connack, ConnectReturnCode, Publish, Suback, SubscribeReturnCode};
use libmqtt::mqtt::session::Outbox;
use libmqtt::mqtt::{Credentials, Event, Options, Packet, QoS, Session};
use std::hint::black_box;

/// Counts side effects without storing them.
#[derive(Default)]
struct Counter {
    packets: usize,
    events: usize,
}

impl Outbox<u8> for Counter {
    fn transmit(&mut self, packet: &Packet) {
        black_box(packet);
        self.packets += 1;
    }

    fn notify(&mut self, handler: Option<u8>, event: Event) {
        black_box((handler, event));
        self.events += 1;
    }
}

fn connected() -> (Session<u8>, Counter) {
    let mut session = Session::new("libmqtt-bench", Options::default()).unwrap();
    let mut out = Counter::default();
    session
        .connect(&Credentials::anonymous(), Some(0), 0, &mut out)
        .unwrap();
    session.handle_packet(
        Packet::Connack(Connack {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        }),
        0,
        &mut out,
    );
    (session, out)
}

pub fn bench_qos1_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_qos1");
    group.bench_function("publish_puback_x16", |b| {
        b.iter_batched_ref(
            connected,
            |(session, out)| {
                for _ in 0..16 {
                    let id = session
                        .publish("libmqtt/bench", b"payload", QoS::AtLeastOnce, false, Some(1), 1, out)
                        .unwrap()
                        .unwrap();
                    session.handle_packet(Packet::Puback(id), 2, out);
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

pub fn bench_inbound_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_inbound");
    let message = Packet::Publish(Publish::new("home/kitchen/temperature", b"21.5", QoS::AtMostOnce, None).unwrap());

    group.bench_function("route_across_8_subscriptions", |b| {
        b.iter_batched_ref(
            || {
                let (mut session, mut out) = connected();
                for (n, filter) in [
                    "home/+/temperature",
                    "home/#",
                    "office/+/temperature",
                    "office/#",
                    "+/kitchen/+",
                    "garage/door",
                    "home/kitchen/humidity",
                    "#",
                ]
                .iter()
                .enumerate()
                {
                    let id = session
                        .subscribe(filter, QoS::AtMostOnce, Some(n as u8), 0, &mut out)
                        .unwrap();
                    let mut return_codes = heapless::Vec::new();
                    return_codes
                        .push(SubscribeReturnCode::Success(QoS::AtMostOnce))
                        .unwrap();
                    session.handle_packet(
                        Packet::Suback(Suback {
                            packet_id: id,
                            return_codes,
                        }),
                        0,
                        &mut out,
                    );
                }
                (session, out)
            },
            |(session, out)| session.handle_packet(message.clone(), 1, out),
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

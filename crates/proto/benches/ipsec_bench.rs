//! IPsec Performance Benchmarks
//!
//! Benchmarks for ESP/AH packet throughput, anti-replay checks, Diffie-Hellman
//! and the complete IKE negotiation.
//!
//! Run with: `cargo bench --features ipsec --bench ipsec_bench`

#![cfg(feature = "ipsec")]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use strata_proto::ipsec::{
    buffer::BufferChain,
    config::{IkeConfig, IpsecConfig},
    crypto::{AuthAlgorithm, EncryptAlgorithm, PrfAlgorithm, SoftwareCrypto},
    ip::checksum,
    ike::{
        dh::DhKeyPair, DhGroup, IkeContext, IkePolicy, InitiateRequest, Phase1Proposal,
        QueueTransmitter,
    },
    policy::{ExpiryAction, Lifetime, Policy, PolicyAction, PolicyFlow, SecurityProtocol},
    replay::ReplayWindow,
    sadb::{SaKeys, SaSpec},
    selector::{AddrSpec, Selector},
    spd::IpsecDb,
    timer::ManualTimer,
};

const A: [u8; 4] = [10, 0, 0, 1];
const B: [u8; 4] = [10, 0, 0, 2];

fn udp_v4(src: [u8; 4], dst: [u8; 4], payload_len: usize) -> Vec<u8> {
    let total = 28 + payload_len;
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20..22].copy_from_slice(&5000u16.to_be_bytes());
    pkt[22..24].copy_from_slice(&53u16.to_be_bytes());
    pkt[24..26].copy_from_slice(&((8 + payload_len) as u16).to_be_bytes());
    let csum = checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&csum.to_be_bytes());
    pkt
}

fn database(local: [u8; 4], remote: [u8; 4], security: SecurityProtocol) -> IpsecDb {
    let db = IpsecDb::new(
        IpsecConfig::default(),
        Arc::new(SoftwareCrypto::new()),
        Arc::new(ManualTimer::new()),
    )
    .unwrap();
    db.add_group("g").unwrap();
    db.add_interface("g", 1).unwrap();
    db.add_policy(
        "g",
        Policy::new(
            Selector::hosts(IpAddr::from(local), IpAddr::from(remote)),
            PolicyAction::Apply,
            PolicyFlow::DualAsynchronous,
        )
        .with_security(security)
        .with_lifetime(Lifetime::new(0, ExpiryAction::None)),
    )
    .unwrap();
    db
}

/// Sender and receiver sharing one keyed SA
fn keyed_pair(security: SecurityProtocol) -> (IpsecDb, IpsecDb) {
    let sender = database(A, B, security);
    let receiver = database(B, A, security);
    let keys = SaKeys::new(
        &vec![0x42; security.auth.map_or(0, |a| a.key_len())],
        &vec![0x17; security.encryption.map_or(0, |e| e.key_len())],
    );
    let selector = Selector::hosts(IpAddr::from(A), IpAddr::from(B));
    sender
        .add_outbound_sa("g", SaSpec::new(4000, selector, security, keys.clone()))
        .unwrap();
    receiver
        .add_inbound_sa("g", SaSpec::new(4000, selector, security, keys))
        .unwrap();
    (sender, receiver)
}

/// Benchmark outbound and inbound processing of one packet
fn bench_packet_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_round_trip");
    let suites = [
        (
            "esp_aes128_sha1",
            SecurityProtocol::esp(EncryptAlgorithm::Aes128Cbc, Some(AuthAlgorithm::HmacSha1)),
        ),
        (
            "esp_3des_md5",
            SecurityProtocol::esp(EncryptAlgorithm::TripleDesCbc, Some(AuthAlgorithm::HmacMd5)),
        ),
        ("ah_sha256", SecurityProtocol::ah(AuthAlgorithm::HmacSha256)),
    ];

    for (name, security) in suites {
        for size in [64usize, 512, 1400] {
            let (sender, receiver) = keyed_pair(security);
            let packet = udp_v4(A, B, size);
            group.throughput(Throughput::Bytes(packet.len() as u64));
            group.bench_with_input(BenchmarkId::new(name, size), &packet, |b, packet| {
                b.iter(|| {
                    let mut chain = BufferChain::from_slice(packet);
                    sender.apply_outbound(1, &mut chain).unwrap();
                    receiver.apply_inbound(1, &mut chain).unwrap();
                    black_box(chain.len())
                });
            });
        }
    }

    group.finish();
}

/// Benchmark anti-replay checks over a stream with reordering
fn bench_replay_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_window");

    for words in [1usize, 4, 32] {
        group.bench_with_input(BenchmarkId::new("reordered", words * 64), &words, |b, &words| {
            b.iter(|| {
                let mut window = ReplayWindow::new(words, true);
                for seq in 1..=1024u32 {
                    // swap neighbours to exercise the bitmap
                    let candidate = if seq % 2 == 0 { seq - 1 } else { seq + 1 };
                    let _ = black_box(window.check_and_update(candidate));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark Diffie-Hellman key generation and agreement
fn bench_diffie_hellman(c: &mut Criterion) {
    let mut group = c.benchmark_group("diffie_hellman");
    group.sample_size(20);
    let provider = SoftwareCrypto::new();

    for dh in [DhGroup::Modp1024, DhGroup::Modp2048] {
        group.bench_function(BenchmarkId::new("agree", dh.id()), |b| {
            b.iter(|| {
                let ours = DhKeyPair::generate(dh, &provider);
                let theirs = DhKeyPair::generate(dh, &provider);
                black_box(ours.compute_shared(theirs.public_key()).unwrap())
            });
        });
    }

    group.finish();
}

struct Host {
    address: IpAddr,
    ike: Arc<IkeContext>,
    queue: Arc<QueueTransmitter>,
}

fn host(local: [u8; 4], remote: [u8; 4]) -> Host {
    let timer = Arc::new(ManualTimer::new());
    let db = Arc::new(
        IpsecDb::new(IpsecConfig::default(), Arc::new(SoftwareCrypto::new()), timer.clone()).unwrap(),
    );
    db.add_group("wan").unwrap();
    db.add_interface("wan", 1).unwrap();
    db.add_policy(
        "wan",
        Policy::new(
            Selector::hosts(IpAddr::from(local), IpAddr::from(remote)),
            PolicyAction::Apply,
            PolicyFlow::DualAsynchronous,
        )
        .with_security(SecurityProtocol::esp(
            EncryptAlgorithm::Aes128Cbc,
            Some(AuthAlgorithm::HmacSha1),
        )),
    )
    .unwrap();

    let queue = Arc::new(QueueTransmitter::new());
    let ike = IkeContext::new(IkeConfig::default(), db, timer, queue.clone(), IpAddr::from(local)).unwrap();
    ike.add_group("wan").unwrap();
    ike.add_policy(
        "wan",
        IkePolicy::new(AddrSpec::Single(IpAddr::from(remote)), b"bench").with_proposal(
            Phase1Proposal::new(EncryptAlgorithm::Aes128Cbc, PrfAlgorithm::Sha1, DhGroup::Modp1024, 3_600),
        ),
    )
    .unwrap();
    ike.start();
    Host {
        address: IpAddr::from(local),
        ike,
        queue,
    }
}

/// Benchmark a complete Main mode and Quick mode negotiation
fn bench_full_negotiation(c: &mut Criterion) {
    let mut group = c.benchmark_group("ike_negotiation");
    group.sample_size(10);

    group.bench_function("main_and_quick", |b| {
        b.iter(|| {
            let a = host(A, B);
            let peer = host(B, A);
            a.ike
                .initiate(&InitiateRequest::new(
                    1,
                    peer.address,
                    Selector::hosts(a.address, peer.address),
                    SecurityProtocol::esp(EncryptAlgorithm::Aes128Cbc, Some(AuthAlgorithm::HmacSha1)),
                ))
                .unwrap();
            loop {
                let from_a = a.queue.drain();
                let from_b = peer.queue.drain();
                if from_a.is_empty() && from_b.is_empty() {
                    break;
                }
                for (_, data) in from_a {
                    let _ = peer.ike.dispatch(&data, SocketAddr::new(a.address, 500), 1);
                }
                for (_, data) in from_b {
                    let _ = a.ike.dispatch(&data, SocketAddr::new(peer.address, 500), 1);
                }
            }
            black_box(a.ike.status().unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet_round_trip,
    bench_replay_window,
    bench_diffie_hellman,
    bench_full_negotiation,
);

criterion_main!(benches);

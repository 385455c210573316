//! IPsec Integration Tests
//!
//! Two hosts, each with an SA database and an IKE daemon, exchange IKE
//! messages through in-memory transmitters. Tests run the key exchange to
//! completion and then push packets through the installed SAs.

#![cfg(feature = "ipsec")]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use strata_proto::ipsec::{
    buffer::BufferChain,
    config::{IkeConfig, IpsecConfig},
    crypto::{AuthAlgorithm, EncryptAlgorithm, PrfAlgorithm, SoftwareCrypto},
    ip::checksum,
    ike::{
        constants::ExchangeType, DhGroup, IkeContext, IkePolicy, InitiateRequest, Phase1Mode,
        Phase1Proposal, QueueTransmitter,
    },
    policy::{ExpiryAction, IpsecProtocol, Lifetime, Policy, PolicyAction, PolicyFlow, SecurityProtocol},
    replay::ReplayWindow,
    selector::{AddrSpec, Selector},
    spd::IpsecDb,
    timer::ManualTimer,
    Error, Verdict,
};

const A: [u8; 4] = [10, 0, 0, 1];
const B: [u8; 4] = [10, 0, 0, 2];
const IF_INDEX: u32 = 1;

fn addr(octets: [u8; 4]) -> IpAddr {
    IpAddr::from(octets)
}

fn esp() -> SecurityProtocol {
    SecurityProtocol::esp(EncryptAlgorithm::Aes128Cbc, Some(AuthAlgorithm::HmacSha1))
}

/// IPv4/UDP packet from `src` to `dst`
fn udp_v4(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 28 + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[6] = 0x40;
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    let csum = checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&csum.to_be_bytes());
    pkt[20..22].copy_from_slice(&5000u16.to_be_bytes());
    pkt[22..24].copy_from_slice(&53u16.to_be_bytes());
    pkt[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    pkt[28..].copy_from_slice(payload);
    pkt
}

struct Host {
    address: IpAddr,
    db: Arc<IpsecDb>,
    ike: Arc<IkeContext>,
    queue: Arc<QueueTransmitter>,
    timer: Arc<ManualTimer>,
}

impl Host {
    fn new(local: [u8; 4], remote: [u8; 4], config: IkeConfig, modes: &[Phase1Mode]) -> Self {
        let timer = Arc::new(ManualTimer::new());
        let db = Arc::new(
            IpsecDb::new(IpsecConfig::default(), Arc::new(SoftwareCrypto::new()), timer.clone())
                .unwrap(),
        );
        db.add_group("wan").unwrap();
        db.add_interface("wan", IF_INDEX).unwrap();
        db.add_policy(
            "wan",
            Policy::new(
                Selector::hosts(addr(local), addr(remote)),
                PolicyAction::Apply,
                PolicyFlow::DualAsynchronous,
            )
            .with_security(esp())
            .with_lifetime(Lifetime::new(900, ExpiryAction::Refresh)),
        )
        .unwrap();

        let queue = Arc::new(QueueTransmitter::new());
        let ike = IkeContext::new(config, db.clone(), timer.clone(), queue.clone(), addr(local)).unwrap();
        ike.add_group("wan").unwrap();
        ike.add_policy(
            "wan",
            IkePolicy::new(AddrSpec::Single(addr(remote)), b"correct horse battery staple")
                .with_modes(modes)
                .with_proposal(Phase1Proposal::new(
                    EncryptAlgorithm::Aes128Cbc,
                    PrfAlgorithm::Sha1,
                    DhGroup::Modp1024,
                    3_600,
                )),
        )
        .unwrap();
        ike.start();

        Host {
            address: addr(local),
            db,
            ike,
            queue,
            timer,
        }
    }

    fn request(&self, remote: &Host) -> InitiateRequest {
        InitiateRequest::new(
            IF_INDEX,
            remote.address,
            Selector::hosts(self.address, remote.address),
            esp(),
        )
    }
}

fn pair(modes: &[Phase1Mode]) -> (Host, Host) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    (
        Host::new(A, B, IkeConfig::default(), modes),
        Host::new(B, A, IkeConfig::default(), modes),
    )
}

/// Deliver queued messages in both directions until both queues are empty
///
/// Returns the number of messages delivered.
fn pump(a: &Host, b: &Host) -> usize {
    let mut delivered = 0;
    for _ in 0..32 {
        let from_a = a.queue.drain();
        let from_b = b.queue.drain();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for (_, data) in from_a {
            let _ = b.ike.dispatch(&data, SocketAddr::new(a.address, 500), IF_INDEX);
            delivered += 1;
        }
        for (_, data) in from_b {
            let _ = a.ike.dispatch(&data, SocketAddr::new(b.address, 500), IF_INDEX);
            delivered += 1;
        }
    }
    delivered
}

fn assert_traffic_flows(a: &Host, b: &Host) {
    let original = udp_v4(A, B, b"protected payload");
    let mut chain = BufferChain::from_slice(&original);
    assert_eq!(a.db.apply_outbound(IF_INDEX, &mut chain), Ok(Verdict::Protected(1)));
    assert_ne!(chain.to_vec(), original);

    let mut received = BufferChain::from_slice(&chain.to_vec());
    assert_eq!(b.db.apply_inbound(IF_INDEX, &mut received), Ok(Verdict::Protected(1)));
    assert_eq!(received.to_vec(), original);

    let reply = udp_v4(B, A, b"reply");
    let mut chain = BufferChain::from_slice(&reply);
    assert_eq!(b.db.apply_outbound(IF_INDEX, &mut chain), Ok(Verdict::Protected(1)));
    let mut received = BufferChain::from_slice(&chain.to_vec());
    assert_eq!(a.db.apply_inbound(IF_INDEX, &mut received), Ok(Verdict::Protected(1)));
    assert_eq!(received.to_vec(), reply);
}

//
// Key exchange
//

#[test]
fn test_main_mode_installs_sa_pairs() {
    let (a, b) = pair(&[Phase1Mode::Main]);
    a.ike.initiate(&a.request(&b)).unwrap();

    let status = a.ike.status().unwrap();
    assert_eq!(status.phase1_exchanges, 1);
    assert_eq!(status.queued, 1);

    // 6 main mode messages, INITIAL-CONTACT, 3 quick mode messages
    assert_eq!(pump(&a, &b), 10);

    for host in [&a, &b] {
        let status = host.ike.status().unwrap();
        assert_eq!(status.isakmp_sas, 1);
        assert_eq!(status.phase1_exchanges, 0);
        assert_eq!(status.phase2_exchanges, 0);
        assert_eq!(host.db.inbound_spis("wan").unwrap().len(), 1);
        assert_eq!(host.db.outbound_spis("wan").unwrap().len(), 1);
        let metrics = host.db.metrics().snapshot();
        assert_eq!(metrics.phase1_completed, 1);
        assert_eq!(metrics.phase2_completed, 1);
    }
    // each side sends with the SPI the other side chose
    assert_eq!(a.db.outbound_spis("wan").unwrap(), b.db.inbound_spis("wan").unwrap());
    assert_eq!(b.db.outbound_spis("wan").unwrap(), a.db.inbound_spis("wan").unwrap());

    assert_traffic_flows(&a, &b);
}

#[test]
fn test_aggressive_mode_installs_sa_pairs() {
    let (a, b) = pair(&[Phase1Mode::Aggressive]);
    a.ike.initiate(&a.request(&b)).unwrap();
    let first = a.queue.drain();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].1[18], ExchangeType::Aggressive.to_u8());
    b.ike
        .dispatch(&first[0].1, SocketAddr::new(a.address, 500), IF_INDEX)
        .unwrap();

    pump(&a, &b);
    assert_eq!(a.ike.status().unwrap().isakmp_sas, 1);
    assert_eq!(b.ike.status().unwrap().isakmp_sas, 1);
    assert_traffic_flows(&a, &b);
}

#[test]
fn test_second_request_goes_straight_to_quick_mode() {
    let (a, b) = pair(&[Phase1Mode::Main]);
    a.ike.initiate(&a.request(&b)).unwrap();
    pump(&a, &b);

    a.ike.initiate(&a.request(&b)).unwrap();
    let status = a.ike.status().unwrap();
    assert_eq!(status.phase1_exchanges, 0);
    assert_eq!(status.phase2_exchanges, 1);
    assert_eq!(status.queued, 0);

    let sent = a.queue.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1[18], ExchangeType::Quick.to_u8());
    for (_, data) in sent {
        b.ike.dispatch(&data, SocketAddr::new(a.address, 500), IF_INDEX).unwrap();
    }
    pump(&a, &b);
    assert_eq!(a.db.outbound_spis("wan").unwrap().len(), 2);
    assert_eq!(b.db.inbound_spis("wan").unwrap().len(), 2);
}

#[test]
fn test_outbound_packet_triggers_negotiation() {
    let (a, b) = pair(&[Phase1Mode::Main]);
    let mut chain = BufferChain::from_slice(&udp_v4(A, B, b"first"));
    assert!(matches!(
        a.db.apply_outbound(IF_INDEX, &mut chain),
        Err(Error::SaNotFound(_))
    ));
    assert_eq!(a.db.metrics().snapshot().sa_requests, 1);
    assert_eq!(a.ike.status().unwrap().phase1_exchanges, 1);

    pump(&a, &b);
    assert_traffic_flows(&a, &b);
}

#[test]
fn test_mismatched_keys_abort_phase1() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let a = Host::new(A, B, IkeConfig::default(), &[Phase1Mode::Main]);
    let b = Host::new(B, A, IkeConfig::default(), &[Phase1Mode::Main]);
    b.ike.remove_policy("wan", 1).unwrap();
    b.ike
        .add_policy(
            "wan",
            IkePolicy::new(AddrSpec::Single(a.address), b"another secret").with_proposal(
                Phase1Proposal::new(EncryptAlgorithm::Aes128Cbc, PrfAlgorithm::Sha1, DhGroup::Modp1024, 3_600),
            ),
        )
        .unwrap();

    a.ike.initiate(&a.request(&b)).unwrap();
    pump(&a, &b);
    assert_eq!(a.ike.status().unwrap().isakmp_sas, 0);
    assert!(a.db.outbound_spis("wan").unwrap().is_empty());
    let failed = a.db.metrics().snapshot().phase1_failed + b.db.metrics().snapshot().phase1_failed;
    assert!(failed >= 1);
}

#[test]
fn test_delete_notification_removes_both_ends() {
    let (a, b) = pair(&[Phase1Mode::Main]);
    a.ike.initiate(&a.request(&b)).unwrap();
    pump(&a, &b);

    let spis = a.db.inbound_spis("wan").unwrap();
    a.ike
        .send_delete_notification("wan", &b.address, IpsecProtocol::Esp, &spis)
        .unwrap();
    assert!(a.db.inbound_spis("wan").unwrap().is_empty());
    assert!(a.db.outbound_spis("wan").unwrap().is_empty());

    pump(&a, &b);
    assert!(b.db.outbound_spis("wan").unwrap().is_empty());
    assert!(b.db.inbound_spis("wan").unwrap().is_empty());
    // the ISAKMP SA survives
    assert_eq!(b.ike.status().unwrap().isakmp_sas, 1);
}

#[test]
fn test_retransmitted_final_message_is_answered() {
    let (a, b) = pair(&[Phase1Mode::Main]);
    a.ike.initiate(&a.request(&b)).unwrap();
    for _ in 0..2 {
        for (_, data) in a.queue.drain() {
            b.ike.dispatch(&data, SocketAddr::new(a.address, 500), IF_INDEX).unwrap();
        }
        for (_, data) in b.queue.drain() {
            a.ike.dispatch(&data, SocketAddr::new(b.address, 500), IF_INDEX).unwrap();
        }
    }
    for (_, data) in a.queue.drain() {
        b.ike.dispatch(&data, SocketAddr::new(a.address, 500), IF_INDEX).unwrap();
    }
    // main mode message 5 reached the responder; message 6 is lost
    let lost = b.queue.drain();
    assert_eq!(lost.len(), 1);
    assert_eq!(b.ike.status().unwrap().isakmp_sas, 1);

    // the initiator resends message 5 and gets message 6 again
    for event in a.timer.advance(Duration::from_secs(2)) {
        a.ike.handle_timer(&event).unwrap();
    }
    for (_, data) in a.queue.drain() {
        b.ike.dispatch(&data, SocketAddr::new(a.address, 500), IF_INDEX).unwrap();
    }
    let again = b.queue.drain();
    assert_eq!(again, lost);
}

#[test]
fn test_spoofed_source_is_dropped() {
    let (a, b) = pair(&[Phase1Mode::Main]);
    a.ike.initiate(&a.request(&b)).unwrap();
    pump(&a, &b);

    a.ike.initiate(&a.request(&b)).unwrap();
    let sent = a.queue.drain();
    let spoofed: SocketAddr = "10.0.0.66:500".parse().unwrap();
    assert_eq!(
        b.ike.dispatch(&sent[0].1, spoofed, IF_INDEX),
        Err(Error::AddressMismatch)
    );
    assert!(b.db.metrics().snapshot().messages_dropped >= 1);
}

#[test]
fn test_garbage_is_counted_as_dropped() {
    let (a, _b) = pair(&[Phase1Mode::Main]);
    assert!(a
        .ike
        .dispatch(&[0xde, 0xad], "10.0.0.2:500".parse().unwrap(), IF_INDEX)
        .is_err());
    assert_eq!(a.db.metrics().snapshot().messages_dropped, 1);
}

//
// Blocking requests
//

#[tokio::test]
async fn test_blocking_initiate_returns_after_install() {
    let (a, b) = pair(&[Phase1Mode::Main]);
    let request = a.request(&b);

    let blocking = a.ike.initiate_blocking(&request);
    let network = async {
        tokio::task::yield_now().await;
        pump(&a, &b);
    };
    let (result, ()) = tokio::join!(blocking, network);
    result.unwrap();
    assert_eq!(a.db.outbound_spis("wan").unwrap().len(), 1);
    assert_eq!(a.ike.status().unwrap().waiting, 0);
}

#[tokio::test]
async fn test_blocking_slots_are_limited() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = IkeConfig::builder().with_max_wait_events(1).build().unwrap();
    let a = Host::new(A, B, config, &[Phase1Mode::Main]);
    let b = Host::new(B, A, IkeConfig::default(), &[Phase1Mode::Main]);
    let request = a.request(&b);

    let first = a.ike.initiate_blocking(&request);
    let second = async {
        tokio::task::yield_now().await;
        let result = a.ike.initiate_blocking(&request).await;
        pump(&a, &b);
        result
    };
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    assert_eq!(second, Err(Error::TooManyBlockingExchanges));
}

#[tokio::test]
async fn test_stop_wakes_blocked_caller() {
    let (a, b) = pair(&[Phase1Mode::Main]);
    let request = a.request(&b);
    let blocking = a.ike.initiate_blocking(&request);
    let stop = async {
        tokio::task::yield_now().await;
        a.ike.stop().unwrap();
    };
    let (result, ()) = tokio::join!(blocking, stop);
    assert!(matches!(result, Err(Error::InvalidState(_))));
    assert_eq!(a.ike.status().unwrap().phase1_exchanges, 0);
}

//
// Anti-replay
//

#[test]
fn test_replay_window_sequence() {
    let mut window = ReplayWindow::new(1, false);
    assert_eq!(window.check_and_update(5), Ok(5));
    assert_eq!(window.check_and_update(6), Ok(6));
    assert!(window.check_and_update(6).is_err());
    assert_eq!(window.check_and_update(4), Ok(4));
    assert_eq!(window.check_and_update(50), Ok(50));
    // 6 is still inside the 64 packet window
    assert!(window.check_and_update(6).is_err());
    assert_eq!(window.check_and_update(7), Ok(7));
}

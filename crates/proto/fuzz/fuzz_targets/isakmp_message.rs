//! Fuzz target for ISAKMP message parsing.
//!
//! This fuzzer feeds random input to the header and payload parsers and to
//! a running IKE daemon to find:
//! - Panics
//! - Infinite loops
//! - Incorrect error handling
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run isakmp_message -- -max_total_time=300
//! ```

#![no_main]
use std::net::IpAddr;
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;
use strata_proto::ipsec::{
    config::{IkeConfig, IpsecConfig},
    crypto::{EncryptAlgorithm, PrfAlgorithm, SoftwareCrypto},
    ike::{
        constants::ISAKMP_HEADER_LEN, header::IsakmpHeader, payload::Message, DhGroup, IkeContext, IkePolicy, Phase1Proposal,
        QueueTransmitter,
    },
    selector::AddrSpec,
    spd::IpsecDb,
    timer::ManualTimer,
};

static DAEMON: Lazy<(Arc<IkeContext>, Arc<QueueTransmitter>)> = Lazy::new(|| {
    let timer = Arc::new(ManualTimer::new());
    let db = Arc::new(
        IpsecDb::new(IpsecConfig::default(), Arc::new(SoftwareCrypto::new()), timer.clone()).unwrap(),
    );
    db.add_group("wan").unwrap();
    db.add_interface("wan", 1).unwrap();
    let queue = Arc::new(QueueTransmitter::new());
    let local: IpAddr = "10.0.0.1".parse().unwrap();
    let ike = IkeContext::new(IkeConfig::default(), db, timer, queue.clone(), local).unwrap();
    ike.add_group("wan").unwrap();
    ike.add_policy(
        "wan",
        IkePolicy::new(AddrSpec::Any, b"fuzz").with_proposal(Phase1Proposal::new(
            EncryptAlgorithm::Aes128Cbc,
            PrfAlgorithm::Sha1,
            DhGroup::Modp1024,
            3_600,
        )),
    )
    .unwrap();
    ike.start();
    (ike, queue)
});

fuzz_target!(|data: &[u8]| {
    // Parsers must fail cleanly
    if let Ok(header) = IsakmpHeader::from_bytes(data) {
        let body = &data[ISAKMP_HEADER_LEN..header.length as usize];
        let _ = Message::parse(header.clone(), body);

        // A header that parses must survive a round trip
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(body);
        let reparsed = IsakmpHeader::from_bytes(&bytes).expect("Round-trip parsing should never fail");
        assert_eq!(header, reparsed);
    }

    // The daemon must survive anything a peer sends
    let (ike, queue) = &*DAEMON;
    let _ = ike.dispatch(data, "10.0.0.2:500".parse().unwrap(), 1);
    queue.drain();
});

//! End-to-end forwarding over real loopback sockets.
//!
//! Each test stands up a router with programmatically built tables, runs
//! it on its own threads, and plays the part of the attached leaves with
//! plain UDP sockets.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use forest_router::{Router, RouterConfig};
use forest_wire::payload::{ConnectBody, SubUnsub};
use forest_wire::{Fadr, NodeType, Packet, PacketType, RateSpec, CONNECT_COMT};

const COMT: u32 = 100;

struct Leaf {
    sock: UdpSocket,
    adr: Fadr,
}

impl Leaf {
    fn new(adr: Fadr) -> Self {
        let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        Leaf { sock, adr }
    }

    fn port(&self) -> u16 {
        self.sock.local_addr().unwrap().port()
    }

    fn send(&self, to: SocketAddr, pkt: &Packet) {
        self.sock.send_to(&pkt.encode(), to).unwrap();
    }

    fn recv(&self) -> Option<Packet> {
        let mut buf = [0u8; 2048];
        match self.sock.recv_from(&mut buf) {
            Ok((n, _)) => Packet::decode(&buf[..n]),
            Err(_) => None,
        }
    }

    fn data(&self, dst: Fadr, payload: &'static [u8]) -> Packet {
        Packet::new(
            PacketType::ClientData,
            COMT,
            self.adr,
            dst,
            Bytes::from_static(payload),
        )
    }
}

struct Harness {
    rtr: Arc<Router>,
    rtr_addr: SocketAddr,
    handle: thread::JoinHandle<()>,
}

/// Build a router with one interface and a link for each peer, all in
/// comtree 100, then start it.
fn start_router_with(
    peers: &[(usize, &Leaf, NodeType)],
    parent: Option<usize>,
    routes: &[(Fadr, usize)],
) -> Harness {
    let cfg = RouterConfig {
        my_adr: Fadr::unicast(1, 1),
        first_leaf_adr: Fadr::unicast(1, 16),
        last_leaf_adr: Fadr::unicast(1, 63),
        fin_time: 0,
        ..RouterConfig::default()
    };
    let rtr = Arc::new(Router::new(cfg));
    let fast = RateSpec::symmetric(8_000_000, 1_000_000);
    {
        let mut ift = rtr.ift.lock().unwrap();
        ift.add_entry(1, Ipv4Addr::LOCALHOST, 0, fast).unwrap();
        let mut lt = rtr.lt.lock().unwrap();
        let mut ctt = rtr.ctt.lock().unwrap();
        let ctx = ctt.add_entry(COMT).unwrap();
        for (lnk, leaf, ntype) in peers {
            lt.add_entry(
                *lnk,
                1,
                Ipv4Addr::LOCALHOST,
                leaf.port(),
                *ntype,
                leaf.adr,
                RateSpec::symmetric(100_000, 100_000),
                *lnk as u64 * 1111,
            )
            .unwrap();
            let is_rtr = *ntype == NodeType::Router;
            let cl = ctt.add_link(ctx, *lnk, is_rtr, false, &mut lt).unwrap();
            ctt.clink_mut(cl).unwrap().rates = RateSpec::symmetric(100_000, 100_000);
        }
        if let Some(plnk) = parent {
            ctt.set_plnk(ctx, plnk).unwrap();
        }
        let mut rt = rtr.rt.lock().unwrap();
        for (dest, lnk) in routes {
            let cl = ctt.get_comt_link(COMT, *lnk).unwrap();
            rt.add_route(COMT, *dest, cl).unwrap();
            ctt.register_rte(cl, *dest);
        }
    }
    rtr.setup().unwrap();
    let rtr_port = rtr.ift.lock().unwrap().get(1).unwrap().port;
    let rtr_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, rtr_port));

    let run_rtr = Arc::clone(&rtr);
    let handle = thread::spawn(move || {
        let _ = run_rtr.run();
    });
    Harness {
        rtr,
        rtr_addr,
        handle,
    }
}

/// Client-only topology.
fn start_router(leaves: &[(usize, &Leaf)], routes: &[(Fadr, usize)]) -> Harness {
    let peers: Vec<(usize, &Leaf, NodeType)> = leaves
        .iter()
        .map(|(lnk, leaf)| (*lnk, *leaf, NodeType::Client))
        .collect();
    start_router_with(&peers, None, routes)
}

fn stop(h: Harness) {
    h.rtr.request_stop();
    let _ = h.handle.join();
}

#[test]
fn unicast_forward_with_route() {
    let a = Leaf::new(Fadr::unicast(1, 16));
    let b = Leaf::new(Fadr::unicast(1, 17));
    let h = start_router(&[(3, &a), (7, &b)], &[(b.adr, 7), (a.adr, 3)]);

    a.send(h.rtr_addr, &a.data(b.adr, b"XYZ"));

    let got = b.recv().expect("packet should arrive at B");
    assert_eq!(got.header.ptype, PacketType::ClientData);
    assert_eq!(got.header.comtree, COMT);
    assert_eq!(got.header.src, a.adr);
    assert_eq!(got.header.dst, b.adr);
    assert_eq!(got.payload, &b"XYZ"[..]);

    // nothing for A: the packet went to link 7 only
    a.sock
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(a.recv().is_none());

    let sm = h.rtr.sm.lock().unwrap();
    assert_eq!(sm.link(3).pkts_in, 1);
    assert_eq!(sm.link(7).pkts_out, 1);
    drop(sm);
    stop(h);
}

#[test]
fn unknown_local_destination_is_reported() {
    let a = Leaf::new(Fadr::unicast(1, 16));
    let h = start_router(&[(3, &a)], &[(a.adr, 3)]);

    // 1.40 is inside the leaf range but nobody is attached there
    a.send(h.rtr_addr, &a.data(Fadr::unicast(1, 40), b"hello"));

    let got = a.recv().expect("UNKNOWN_DEST should come back");
    assert_eq!(got.header.ptype, PacketType::UnknownDest);
    let body = forest_wire::payload::UnknownDest::decode(&got.payload).unwrap();
    assert_eq!(body.dest, Fadr::unicast(1, 40));
    stop(h);
}

#[test]
fn connect_handshake_acks_and_marks_link() {
    let a = Leaf::new(Fadr::unicast(1, 16));
    let h = start_router(&[(3, &a)], &[]);

    let connect = Packet::new(
        PacketType::Connect,
        CONNECT_COMT,
        a.adr,
        Fadr::unicast(1, 1),
        ConnectBody { nonce: 3 * 1111 }.encode(),
    );
    a.send(h.rtr_addr, &connect);

    let ack = a.recv().expect("connect ack");
    assert_eq!(ack.header.ptype, PacketType::Connect);
    assert!(ack.header.flags.ack());
    assert_eq!(ConnectBody::decode(&ack.payload).unwrap().nonce, 3 * 1111);

    assert!(h.rtr.lt.lock().unwrap().get(3).unwrap().connected);
    stop(h);
}

#[test]
fn wrong_nonce_gets_no_ack() {
    let a = Leaf::new(Fadr::unicast(1, 16));
    let h = start_router(&[(3, &a)], &[]);

    let connect = Packet::new(
        PacketType::Connect,
        CONNECT_COMT,
        a.adr,
        Fadr::unicast(1, 1),
        ConnectBody { nonce: 999 }.encode(),
    );
    a.send(h.rtr_addr, &connect);

    a.sock
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(a.recv().is_none());
    assert!(!h.rtr.lt.lock().unwrap().get(3).unwrap().connected);
    stop(h);
}

#[test]
fn subscribe_creates_route_and_delivers_multicast() {
    let a = Leaf::new(Fadr::unicast(1, 16));
    let b = Leaf::new(Fadr::unicast(1, 17));
    let h = start_router(&[(3, &a), (7, &b)], &[]);
    let group = Fadr(0x8000_0042);

    // B subscribes to the group
    let sub = Packet::new(
        PacketType::SubUnsub,
        COMT,
        b.adr,
        Fadr::unicast(1, 1),
        SubUnsub {
            seq: 1,
            adds: vec![group],
            drops: vec![],
        }
        .encode(),
    );
    b.send(h.rtr_addr, &sub);

    let ack = b.recv().expect("subscription ack");
    assert_eq!(ack.header.ptype, PacketType::SubUnsub);
    assert!(ack.header.flags.ack());

    // A sends to the group; B gets a copy
    a.send(h.rtr_addr, &a.data(group, b"to-the-group"));
    let got = b.recv().expect("multicast copy for subscriber");
    assert_eq!(got.header.dst, group);
    assert_eq!(got.payload, &b"to-the-group"[..]);

    // B unsubscribes; further traffic no longer reaches it
    let unsub = Packet::new(
        PacketType::SubUnsub,
        COMT,
        b.adr,
        Fadr::unicast(1, 1),
        SubUnsub {
            seq: 2,
            adds: vec![],
            drops: vec![group],
        }
        .encode(),
    );
    b.send(h.rtr_addr, &unsub);
    assert!(b.recv().map(|p| p.header.flags.ack()).unwrap_or(false));

    a.send(h.rtr_addr, &a.data(group, b"again"));
    b.sock
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(b.recv().is_none(), "unsubscribed leaf got traffic");
    stop(h);
}

#[test]
fn unrouted_destination_floods_router_neighbours() {
    let a = Leaf::new(Fadr::unicast(1, 16));
    let r1 = Leaf::new(Fadr::unicast(2, 1));
    let r2 = Leaf::new(Fadr::unicast(3, 1));
    let h = start_router_with(
        &[
            (3, &a, NodeType::Client),
            (2, &r1, NodeType::Router),
            (5, &r2, NodeType::Router),
        ],
        None,
        &[],
    );

    // 2.9 is in another zip and has no route
    a.send(h.rtr_addr, &a.data(Fadr::unicast(2, 9), b"find-me"));

    for r in [&r1, &r2] {
        let got = r.recv().expect("flooded copy for router neighbour");
        assert_eq!(got.header.ptype, PacketType::ClientData);
        assert!(got.header.flags.rte_req(), "flood must ask for a route");
        assert_eq!(got.header.dst, Fadr::unicast(2, 9));
        assert_eq!(got.payload, &b"find-me"[..]);
    }
    // the sender gets nothing back
    a.sock
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(a.recv().is_none());
    stop(h);
}

#[test]
fn subscription_propagates_to_parent() {
    let b = Leaf::new(Fadr::unicast(1, 17));
    let parent = Leaf::new(Fadr::unicast(2, 1));
    let h = start_router_with(
        &[(7, &b, NodeType::Client), (2, &parent, NodeType::Router)],
        Some(2),
        &[],
    );
    let group = Fadr(0x8000_0007);

    let sub = Packet::new(
        PacketType::SubUnsub,
        COMT,
        b.adr,
        Fadr::unicast(1, 1),
        SubUnsub {
            seq: 5,
            adds: vec![group],
            drops: vec![],
        }
        .encode(),
    );
    b.send(h.rtr_addr, &sub);

    // B gets its ack
    let ack = b.recv().expect("subscription ack");
    assert!(ack.header.flags.ack());

    // the parent router sees a fresh upward request naming only the
    // newly created group
    let up = parent.recv().expect("upward subscription");
    assert_eq!(up.header.ptype, PacketType::SubUnsub);
    assert!(!up.header.flags.ack());
    assert_eq!(up.header.src, Fadr::unicast(1, 1));
    assert_eq!(up.header.dst, parent.adr);
    let body = SubUnsub::decode(&up.payload).unwrap();
    assert_eq!(body.adds, vec![group]);
    assert!(body.drops.is_empty());
    assert_ne!(body.seq, 5, "propagation carries the router's own sequence");
    stop(h);
}

#[test]
fn spoofed_source_is_dropped() {
    let a = Leaf::new(Fadr::unicast(1, 16));
    let b = Leaf::new(Fadr::unicast(1, 17));
    let h = start_router(&[(3, &a), (7, &b)], &[(b.adr, 7)]);

    // A claims B's address as its source
    let spoof = Packet::new(
        PacketType::ClientData,
        COMT,
        b.adr,
        b.adr,
        Bytes::from_static(b"spoof"),
    );
    a.send(h.rtr_addr, &spoof);

    b.sock
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(b.recv().is_none(), "spoofed packet was forwarded");
    stop(h);
}

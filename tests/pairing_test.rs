// End-to-end pairing and forwarding over real sockets.
//
// Each test starts a full broker on ephemeral ports in a background thread
// and talks to it with plain TcpStream clients, the way supply and demand
// peers would in production.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use splicer::{Broker, Config};

fn base_config() -> Config {
    Config {
        supply_port: 0,
        demand_port: 0,
        driver_port: 0,
        idle_timeout: 0,
        driver_period: 0,
        verbose: false,
        exit_flag: false,
    }
}

/// Bind the broker, then run it on a background thread. Returns the
/// resolved (supply, demand, driver) ports.
fn start_broker(config: Config) -> (u16, u16, Option<u16>) {
    let mut broker = Broker::new(config).expect("create broker");
    broker.bind().expect("bind listeners");
    let ports = broker.ports();
    thread::spawn(move || {
        let _ = broker.run();
    });
    ports
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to broker");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

#[test]
fn supply_first_pairing_forwards_both_ways() {
    let (supply_port, demand_port, _) = start_broker(base_config());

    let mut supply = connect(supply_port);
    // Give the broker a moment to queue the supply peer.
    thread::sleep(Duration::from_millis(200));

    let mut demand = connect(demand_port);

    demand.write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    supply.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    supply.write_all(b"world").unwrap();
    demand.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"world");
}

#[test]
fn bytes_sent_while_frozen_arrive_after_pairing() {
    let (supply_port, demand_port, _) = start_broker(base_config());

    let mut supply = connect(supply_port);
    // The broker must not read these until a partner exists; the kernel
    // holds them while the descriptor is frozen.
    supply.write_all(b"queued ahead").unwrap();
    thread::sleep(Duration::from_millis(300));

    let mut demand = connect(demand_port);
    let mut buf = [0u8; 12];
    demand.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"queued ahead");
}

#[test]
fn forwarding_preserves_bytes_across_chunking() {
    let (supply_port, demand_port, _) = start_broker(base_config());

    let mut supply = connect(supply_port);
    thread::sleep(Duration::from_millis(200));
    let mut demand = connect(demand_port);

    // Uneven chunks, some larger than the broker's read granularity.
    let mut sent = Vec::new();
    for (i, size) in [1usize, 7, 300, 4096, 9000, 13, 2048].iter().enumerate() {
        let chunk: Vec<u8> = (0..*size).map(|j| ((i * 31 + j) % 251) as u8).collect();
        demand.write_all(&chunk).unwrap();
        sent.extend_from_slice(&chunk);
    }

    let mut received = vec![0u8; sent.len()];
    supply.read_exact(&mut received).unwrap();
    assert_eq!(received, sent);
}

#[test]
fn partner_disconnect_cascades_to_the_peer() {
    let (supply_port, demand_port, _) = start_broker(base_config());

    let mut supply = connect(supply_port);
    thread::sleep(Duration::from_millis(200));
    let mut demand = connect(demand_port);

    // Confirm the pair is live before killing one side.
    demand.write_all(b"up?").unwrap();
    let mut buf = [0u8; 3];
    supply.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"up?");

    drop(demand);

    // The broker must tear down the supply side as well.
    expect_eof(&mut supply);
}

/// Read until EOF (or reset), retrying reads the alarm signal interrupts.
fn expect_eof(stream: &mut TcpStream) {
    let mut probe = [0u8; 1];
    loop {
        match stream.read(&mut probe) {
            Ok(0) => return,
            Ok(n) => panic!("expected EOF, read {n} bytes"),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => return,
            Err(e) => panic!("expected EOF, got {e}"),
        }
    }
}

#[test]
fn two_pairs_run_independently() {
    let (supply_port, demand_port, _) = start_broker(base_config());

    let mut s1 = connect(supply_port);
    thread::sleep(Duration::from_millis(200));
    let mut d1 = connect(demand_port);
    d1.write_all(b"first").unwrap();
    let mut buf = [0u8; 5];
    s1.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"first");

    let mut s2 = connect(supply_port);
    thread::sleep(Duration::from_millis(200));
    let mut d2 = connect(demand_port);
    d2.write_all(b"other").unwrap();
    s2.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"other");

    // Traffic on pair 1 must not bleed into pair 2.
    s1.write_all(b"reply").unwrap();
    d1.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"reply");
}

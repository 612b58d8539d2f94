// Idle-timeout reaping.
//
// Runs in its own process because the timing assertions assume the broker's
// one-second alarm cadence is the only clock in play.

use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use splicer::{Broker, Config};

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
        .set_read_timeout(Some(Duration::from_secs(8)))
        .unwrap();
    stream
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
fn silent_pair_is_reaped_and_late_supply_queues() {
    let config = Config {
        supply_port: 0,
        demand_port: 0,
        driver_port: 0,
        idle_timeout: 2,
        driver_period: 0,
        verbose: false,
        exit_flag: false,
    };
    let (supply_port, demand_port, _) = start_broker(config);

    let mut supply = connect(supply_port);
    thread::sleep(Duration::from_millis(200));
    let mut demand = connect(demand_port);

    // Both sides go silent; the reaper must take the pair down within the
    // timeout plus one alarm tick.
    let start = Instant::now();
    expect_eof(&mut supply);
    expect_eof(&mut demand);
    assert!(
        start.elapsed() < Duration::from_secs(6),
        "reap took too long: {:?}",
        start.elapsed()
    );

    // A fresh supply peer has no partner left and queues instead of being
    // closed outright.
    let mut late = connect(supply_port);
    late.set_read_timeout(Some(Duration::from_millis(800)))
        .unwrap();
    let mut probe = [0u8; 1];
    loop {
        match late.read(&mut probe) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            other => panic!("late supply should still be queued, got {other:?}"),
        }
    }
}

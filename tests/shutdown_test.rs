// Graceful shutdown on SIGTERM.
//
// Lives in its own test binary: the raised signal is process-wide and must
// not leak into unrelated broker instances.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use splicer::{Broker, Config};

fn free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
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
fn sigterm_closes_every_peer_and_exits_cleanly() {
    let config = Config {
        supply_port: 0,
        demand_port: 0,
        driver_port: free_port(),
        idle_timeout: 0,
        driver_period: 0,
        verbose: false,
        exit_flag: false,
    };
    let mut broker = Broker::new(config).expect("create broker");
    broker.bind().expect("bind listeners");
    let (supply_port, demand_port, driver_port) = broker.ports();
    let handle = thread::spawn(move || broker.run());

    // Three live pairs plus a driver.
    let mut pairs = Vec::new();
    for i in 0..3u8 {
        let mut supply = connect(supply_port);
        thread::sleep(Duration::from_millis(200));
        let mut demand = connect(demand_port);

        // Prove the pair is spliced before shutdown.
        demand.write_all(&[i]).unwrap();
        let mut byte = [0u8; 1];
        supply.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], i);

        pairs.push((supply, demand));
    }
    let mut driver = connect(driver_port.expect("driver listener"));
    // Wait for the initial count so the driver is registered before the
    // signal lands.
    let mut first = [0u8; 2];
    driver.read_exact(&mut first).unwrap();
    assert_eq!(&first, b"0\n");

    unsafe { libc::raise(libc::SIGTERM) };

    // Every peer socket closes...
    for (supply, demand) in &mut pairs {
        expect_eof(supply);
        expect_eof(demand);
    }
    // ...including the driver, with nothing published after the count it
    // already read.
    let mut rest = Vec::new();
    driver.read_to_end(&mut rest).expect("driver drains");
    assert_eq!(rest, b"");

    // ...and the engine reports a clean shutdown.
    let result = handle.join().expect("broker thread must not panic");
    assert!(result.is_ok(), "expected clean exit, got {result:?}");
}

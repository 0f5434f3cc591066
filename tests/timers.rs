//! Timer behaviour: sleep bounds, zero-duration sleeps, FIFO ties, and
//! write timeouts against a peer that never reads.
//!
//! Every scenario runs once per reactor.

use std::cell::RefCell;
use std::net::TcpListener;
use std::rc::Rc;
use std::time::{Duration, Instant};

use warden_io::test_utils::init_test_logging;
use warden_io::{AcceptStream, PollWarden, Starter, Warden};

fn short_sleep<W: Warden + 'static>(ward: &Rc<W>) {
    let start = Instant::now();
    ward.run(async {
        ward.sleep(Duration::from_millis(20)).await.expect("sleep");
    });
    let slept = start.elapsed();
    assert!(slept >= Duration::from_millis(20), "woke early: {slept:?}");
    assert!(slept < Duration::from_millis(100), "woke late: {slept:?}");
}

fn zero_sleep_resumes_promptly<W: Warden + 'static>(ward: &Rc<W>) {
    let start = Instant::now();
    ward.run(async {
        ward.sleep(Duration::ZERO).await.expect("sleep");
    });
    assert!(start.elapsed() < Duration::from_millis(50));
}

/// Two sleeps posted A then B with the same duration resume in post
/// order.
fn timer_ties_fire_in_post_order<W: Warden + 'static>(ward: &Rc<W>) {
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut starter = Starter::new(&**ward);

    for name in ["a", "b"] {
        let w = Rc::clone(ward);
        let order = Rc::clone(&order);
        starter.post(async move {
            w.sleep(Duration::from_millis(10)).await.expect("sleep");
            order.borrow_mut().push(name);
        });
    }

    ward.run(async {
        ward.sleep(Duration::from_millis(50)).await.expect("sleep");
    });
    assert_eq!(*order.borrow(), vec!["a", "b"]);
}

/// An already-elapsed deadline fails the operation on the next driver
/// iteration instead of hanging.
fn elapsed_deadline_fires_immediately<W: Warden + 'static>(ward: &Rc<W>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let addr = listener.local_addr().expect("addr");

    ward.run(async {
        let fd = ward
            .create_socket(libc::AF_INET, libc::SOCK_STREAM, 0)
            .expect("socket");
        ward.connect(&fd, addr).await.expect("connect");
        let mut buf = [0u8; 8];
        let err = ward
            .read_some(&fd, &mut buf)
            .deadline(Instant::now())
            .await
            .expect_err("nothing to read, must time out");
        assert!(err.is_timeout(), "unexpected error: {err}");
    });
}

/// A writer against a peer that never reads eventually observes a
/// timeout, and no other error kind.
fn write_times_out_when_peer_stalls<W: Warden + 'static>(ward: &Rc<W>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let addr = listener.local_addr().expect("addr");

    let mut starter = Starter::new(&**ward);
    let server = Rc::clone(ward);
    starter.post(async move {
        let mut acceptor = AcceptStream::new(&*server, &listener);
        let _conn = acceptor.next().await.expect("accept");
        // Hold the connection open without ever reading from it.
        let _ = server.sleep(Duration::from_secs(30)).await;
    });

    let buffer = vec![0u8; 1 << 20];
    ward.run(async {
        let fd = ward
            .create_socket(libc::AF_INET, libc::SOCK_STREAM, 0)
            .expect("socket");
        ward.connect(&fd, addr).await.expect("connect");
        for _ in 0..100_000 {
            match ward
                .write_some(&fd, &buffer)
                .timeout(Duration::from_millis(10))
                .await
            {
                Ok(written) => assert!(written > 0),
                Err(err) => {
                    assert!(err.is_timeout(), "unexpected error kind: {err}");
                    return;
                }
            }
        }
        panic!("send buffer never filled");
    });
}

mod poll {
    use super::*;

    fn ward() -> Rc<PollWarden> {
        init_test_logging();
        Rc::new(PollWarden::new().expect("poll warden"))
    }

    #[test]
    fn short_sleep() {
        super::short_sleep(&ward());
    }

    #[test]
    fn zero_sleep_resumes_promptly() {
        super::zero_sleep_resumes_promptly(&ward());
    }

    #[test]
    fn timer_ties_fire_in_post_order() {
        super::timer_ties_fire_in_post_order(&ward());
    }

    #[test]
    fn elapsed_deadline_fires_immediately() {
        super::elapsed_deadline_fires_immediately(&ward());
    }

    #[test]
    fn write_times_out_when_peer_stalls() {
        super::write_times_out_when_peer_stalls(&ward());
    }
}

#[cfg(all(target_os = "linux", feature = "io-uring"))]
mod uring {
    use super::*;
    use warden_io::UringWarden;

    fn ward() -> Option<Rc<UringWarden>> {
        init_test_logging();
        match UringWarden::new() {
            Ok(ward) => Some(Rc::new(ward)),
            Err(err) => {
                eprintln!("io_uring unavailable, skipping: {err}");
                None
            }
        }
    }

    #[test]
    fn short_sleep() {
        if let Some(ward) = ward() {
            super::short_sleep(&ward);
        }
    }

    #[test]
    fn zero_sleep_resumes_promptly() {
        if let Some(ward) = ward() {
            super::zero_sleep_resumes_promptly(&ward);
        }
    }

    #[test]
    fn timer_ties_fire_in_post_order() {
        if let Some(ward) = ward() {
            super::timer_ties_fire_in_post_order(&ward);
        }
    }

    #[test]
    fn elapsed_deadline_fires_immediately() {
        if let Some(ward) = ward() {
            super::elapsed_deadline_fires_immediately(&ward);
        }
    }

    #[test]
    fn write_times_out_when_peer_stalls() {
        if let Some(ward) = ward() {
            super::write_times_out_when_peer_stalls(&ward);
        }
    }
}

//! Cancellation and lifecycle: dropping tasks unregisters their
//! operations, accept streams end when the listener goes away, and
//! starter garbage collection is idempotent.

use std::net::TcpListener;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use warden_io::test_utils::init_test_logging;
use warden_io::{AcceptStream, PollWarden, Starter, Warden};

/// Dropping a task that is parked on a read leaves no waiter and no
/// multiplexer registration behind.
#[test]
fn dropping_task_unregisters_poll_waiters() {
    init_test_logging();
    let ward = Rc::new(PollWarden::new().expect("poll warden"));

    let (ours, theirs) = UnixStream::pair().expect("socketpair");
    ours.set_nonblocking(true).expect("nonblocking");

    let mut starter = Starter::new(&*ward);
    let w = Rc::clone(&ward);
    starter.post(async move {
        let mut buf = [0u8; 16];
        // Nothing ever arrives; this parks on first poll.
        let _ = w.read_some(&ours, &mut buf).await;
    });

    assert_eq!(ward.pending_operations(), 1);
    assert_eq!(ward.registered_fds(), 1);

    drop(starter);

    assert_eq!(ward.pending_operations(), 0);
    assert_eq!(ward.registered_fds(), 0);
    drop(theirs);
}

#[cfg(all(target_os = "linux", feature = "io-uring"))]
#[test]
fn dropping_task_reaps_uring_submissions() {
    use warden_io::UringWarden;

    init_test_logging();
    let Ok(ward) = UringWarden::new() else {
        eprintln!("io_uring unavailable, skipping");
        return;
    };
    let ward = Rc::new(ward);

    let (ours, theirs) = UnixStream::pair().expect("socketpair");

    let mut starter = Starter::new(&*ward);
    let w = Rc::clone(&ward);
    starter.post(async move {
        let mut buf = [0u8; 16];
        let _ = w.read_some(&ours, &mut buf).await;
    });

    assert_eq!(ward.pending_operations(), 1);

    // Drop synchronously cancels against the kernel and drains the CQE
    // before the task's buffer is released.
    drop(starter);

    assert_eq!(ward.pending_operations(), 0);
    drop(theirs);
}

fn accept_stream_ends_when_listener_closes<W: Warden + 'static>(ward: &Rc<W>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");

    ward.run(async {
        let mut acceptor = AcceptStream::new(&**ward, &listener);
        drop(listener);
        let end = acceptor.next().await.expect("stream end is not an error");
        assert!(end.is_none(), "closed listener must end the stream");
    });
}

fn starter_gc_is_idempotent<W: Warden + 'static>(ward: &Rc<W>) {
    let mut starter = Starter::new(&**ward);

    let w = Rc::clone(ward);
    starter.post(async move {
        w.sleep(Duration::from_millis(1)).await.expect("sleep");
    });
    starter.post(async {});

    // The second task already finished on its eager first poll.
    assert_eq!(starter.len(), 2);
    starter.gc();
    assert_eq!(starter.len(), 1);
    starter.gc();
    assert_eq!(starter.len(), 1);

    ward.run(async {
        ward.sleep(Duration::from_millis(10)).await.expect("sleep");
    });

    starter.gc();
    assert_eq!(starter.len(), 0);
    starter.gc();
    assert_eq!(starter.len(), 0);
}

/// Dropping a never-polled operation handle is a clean no-op; nothing
/// was registered.
#[test]
fn dropping_unpolled_iop_registers_nothing() {
    init_test_logging();
    let ward = Rc::new(PollWarden::new().expect("poll warden"));
    let iop = ward.sleep(Duration::from_secs(60));
    drop(iop);
    assert_eq!(ward.pending_operations(), 0);
}

mod poll {
    use super::*;

    fn ward() -> Rc<PollWarden> {
        init_test_logging();
        Rc::new(PollWarden::new().expect("poll warden"))
    }

    #[test]
    fn accept_stream_ends_when_listener_closes() {
        super::accept_stream_ends_when_listener_closes(&ward());
    }

    #[test]
    fn starter_gc_is_idempotent() {
        super::starter_gc_is_idempotent(&ward());
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
    fn accept_stream_ends_when_listener_closes() {
        if let Some(ward) = ward() {
            super::accept_stream_ends_when_listener_closes(&ward);
        }
    }

    #[test]
    fn starter_gc_is_idempotent() {
        if let Some(ward) = ward() {
            super::starter_gc_is_idempotent(&ward);
        }
    }
}

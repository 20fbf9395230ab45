//! Reactor cycle behavior: deferred tasks, the end-of-cycle hook,
//! descriptor dispatch on both backends, and run bounds.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use riptide::{Backend, Interest, Reactor, ReactorConfig};

#[test]
fn deferred_tasks_run_in_enqueue_order() {
    let reactor = Reactor::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 0..5 {
        let order = Rc::clone(&order);
        let r2 = reactor.clone();
        reactor.do_later(move || {
            order.borrow_mut().push(i);
            if i == 4 {
                r2.stop();
            }
        });
    }

    reactor.run(Some(Duration::from_secs(1)), None).unwrap();
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn task_enqueued_by_a_task_waits_for_the_next_cycle() {
    let reactor = Reactor::new().unwrap();
    let cycle = Rc::new(Cell::new(0u32));
    let seen = Rc::new(RefCell::new(Vec::new()));

    let c2 = Rc::clone(&cycle);
    reactor.set_on_every_cycle(move || c2.set(c2.get() + 1));

    let seen2 = Rc::clone(&seen);
    let c3 = Rc::clone(&cycle);
    let r2 = reactor.clone();
    reactor.do_later(move || {
        seen2.borrow_mut().push(c3.get());
        let seen3 = Rc::clone(&seen2);
        let c4 = Rc::clone(&c3);
        let r3 = r2.clone();
        r2.do_later(move || {
            seen3.borrow_mut().push(c4.get());
            r3.stop();
        });
    });

    reactor.run(Some(Duration::from_secs(1)), None).unwrap();
    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert!(seen[1] > seen[0]);
}

#[test]
fn on_every_cycle_runs_each_iteration() {
    let reactor = Reactor::new().unwrap();
    let cycles = Rc::new(Cell::new(0));

    // A fast recurring timer keeps the loop cycling.
    reactor.schedule_rel(
        Duration::from_millis(1),
        Duration::from_millis(1),
        true,
        |_| {},
    );

    let cycles2 = Rc::clone(&cycles);
    let r2 = reactor.clone();
    reactor.set_on_every_cycle(move || {
        cycles2.set(cycles2.get() + 1);
        if cycles2.get() >= 5 {
            r2.stop();
        }
    });

    reactor.run(Some(Duration::from_secs(2)), None).unwrap();
    assert!(cycles.get() >= 5);
}

fn echo_roundtrip_on(backend: Backend) {
    let reactor = Reactor::with_backend(backend, ReactorConfig::default()).unwrap();
    let (mut tx, rx) = UnixStream::pair().unwrap();
    rx.set_nonblocking(true).unwrap();
    let rx = Rc::new(rx);
    let fd = rx.as_raw_fd();

    let received = Rc::new(RefCell::new(Vec::new()));
    let received2 = Rc::clone(&received);
    let rx2 = Rc::clone(&rx);
    let r2 = reactor.clone();
    reactor
        .register_descriptor(fd, Interest::READABLE, move |_| {
            use std::io::Read;
            let mut buf = [0u8; 64];
            if let Ok(n) = (&*rx2).read(&mut buf) {
                received2.borrow_mut().extend_from_slice(&buf[..n]);
            }
            if received2.borrow().len() >= 5 {
                let _ = r2.unregister_fd(fd);
                r2.stop();
            }
        })
        .unwrap();

    tx.write_all(b"hello").unwrap();
    reactor.run(Some(Duration::from_secs(2)), None).unwrap();
    assert_eq!(*received.borrow(), b"hello");
}

#[test]
fn descriptor_dispatch_select_backend() {
    echo_roundtrip_on(Backend::Select);
}

#[cfg(target_os = "linux")]
#[test]
fn descriptor_dispatch_epoll_backend() {
    echo_roundtrip_on(Backend::Epoll);
}

#[test]
fn clear_silences_everything() {
    let reactor = Reactor::new().unwrap();
    let touched = Rc::new(Cell::new(false));

    let t1 = Rc::clone(&touched);
    reactor.schedule_rel(Duration::from_millis(1), Duration::ZERO, true, move |_| {
        t1.set(true);
    });
    let t2 = Rc::clone(&touched);
    reactor.do_later(move || t2.set(true));

    reactor.clear();
    reactor.run(Some(Duration::from_millis(40)), None).unwrap();
    assert!(!touched.get());
}

#[test]
fn run_respects_max_duration() {
    let reactor =
        Reactor::with_config(ReactorConfig::new().max_sleep(Duration::from_millis(20))).unwrap();
    let start = Instant::now();
    reactor.run(Some(Duration::from_millis(100)), None).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(90));
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn stopper_works_from_another_thread() {
    let reactor =
        Reactor::with_config(ReactorConfig::new().max_sleep(Duration::from_millis(10))).unwrap();
    let stopper = reactor.stopper();

    let worker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        stopper.stop();
    });

    let start = Instant::now();
    reactor.run(Some(Duration::from_secs(5)), None).unwrap();
    worker.join().unwrap();
    // Stopped by the worker, well before the 5 s bound.
    assert!(start.elapsed() < Duration::from_secs(2));
}

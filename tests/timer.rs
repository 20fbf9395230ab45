//! Timer behavior through a running reactor: one-shots, recurrence,
//! catch-up realignment, ordering, and handle mutation.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use riptide::Reactor;

#[test]
fn one_shot_relative_timer_fires_once() {
    let reactor = Reactor::new().unwrap();
    let fires = Rc::new(RefCell::new(Vec::new()));

    let start = Instant::now();
    let fires2 = Rc::clone(&fires);
    let r2 = reactor.clone();
    reactor.schedule_rel(Duration::from_millis(100), Duration::ZERO, true, move |_| {
        fires2.borrow_mut().push(Instant::now());
        r2.stop();
    });

    reactor.run(Some(Duration::from_secs(1)), None).unwrap();

    let fires = fires.borrow();
    assert_eq!(fires.len(), 1);
    let elapsed = fires[0] - start;
    assert!(elapsed >= Duration::from_millis(100), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired far too late: {elapsed:?}");
}

#[test]
fn absolute_timer_never_fires_before_deadline() {
    let reactor = Reactor::new().unwrap();
    let deadline = reactor.now_uncached() + Duration::from_millis(50);

    let observed = Rc::new(Cell::new(None));
    let observed2 = Rc::clone(&observed);
    let r2 = reactor.clone();
    reactor.schedule(deadline, Duration::ZERO, true, move |now| {
        observed2.set(Some(now));
        r2.stop();
    });

    reactor.run(Some(Duration::from_secs(1)), None).unwrap();
    // The cycle's cached now at dispatch is at or past the deadline.
    assert!(observed.get().expect("timer fired") >= deadline);
}

#[test]
fn recurring_timer_fires_repeatedly() {
    let reactor = Reactor::new().unwrap();
    let count = Rc::new(Cell::new(0));

    let count2 = Rc::clone(&count);
    let r2 = reactor.clone();
    reactor.schedule_rel(
        Duration::from_millis(10),
        Duration::from_millis(10),
        true,
        move |_| {
            count2.set(count2.get() + 1);
            if count2.get() >= 5 {
                r2.stop();
            }
        },
    );

    reactor.run(Some(Duration::from_secs(2)), None).unwrap();
    assert!(count.get() >= 5);
}

#[test]
fn non_catchup_deadlines_keep_fixed_delta_across_a_stall() {
    let reactor = Reactor::new().unwrap();
    let deadlines = Rc::new(RefCell::new(Vec::new()));
    let handle_slot: Rc<RefCell<Option<riptide::TimerHandle>>> = Rc::new(RefCell::new(None));

    let deadlines2 = Rc::clone(&deadlines);
    let slot2 = Rc::clone(&handle_slot);
    let count = Rc::new(Cell::new(0));
    let count2 = Rc::clone(&count);
    let r2 = reactor.clone();
    let handle = reactor.schedule_rel(
        Duration::from_millis(20),
        Duration::from_millis(20),
        false,
        move |_| {
            let n = count2.get() + 1;
            count2.set(n);
            if let Some(h) = slot2.borrow().as_ref() {
                // The deadline of the firing in progress.
                deadlines2.borrow_mut().push(h.next_fire_time().unwrap());
            }
            if n == 1 {
                // Stall the loop well past two intervals.
                std::thread::sleep(Duration::from_millis(70));
            }
            if n >= 5 {
                r2.stop();
            }
        },
    );
    *handle_slot.borrow_mut() = Some(handle);

    reactor.run(Some(Duration::from_secs(2)), None).unwrap();

    let deadlines = deadlines.borrow();
    assert!(deadlines.len() >= 5);
    for pair in deadlines.windows(2) {
        // Pacing mode: exactly one interval apart, no matter how late the
        // previous firing ran.
        assert_eq!(pair[1] - pair[0], Duration::from_millis(20));
    }
}

#[test]
fn catchup_realigns_to_future_phase_after_a_stall() {
    let reactor = Reactor::new().unwrap();
    let interval = Duration::from_millis(50);
    let deadlines = Rc::new(RefCell::new(Vec::new()));
    let handle_slot: Rc<RefCell<Option<riptide::TimerHandle>>> = Rc::new(RefCell::new(None));

    let deadlines2 = Rc::clone(&deadlines);
    let slot2 = Rc::clone(&handle_slot);
    let count = Rc::new(Cell::new(0));
    let count2 = Rc::clone(&count);
    let r2 = reactor.clone();
    let handle = reactor.schedule_rel(interval, interval, true, move |_| {
        let n = count2.get() + 1;
        count2.set(n);
        if let Some(h) = slot2.borrow().as_ref() {
            deadlines2.borrow_mut().push(h.next_fire_time().unwrap());
        }
        if n == 1 {
            std::thread::sleep(Duration::from_millis(120));
        }
        if n >= 3 {
            r2.stop();
        }
    });
    *handle_slot.borrow_mut() = Some(handle);

    reactor.run(Some(Duration::from_secs(2)), None).unwrap();

    let deadlines = deadlines.borrow();
    assert!(deadlines.len() >= 3);
    let phase = deadlines[0];
    for &d in deadlines.iter() {
        // Every firing stays phase-aligned to the original deadline.
        assert_eq!((d - phase).as_micros() % interval.as_micros(), 0);
    }
    // The stall was over two intervals, so at least two periods were
    // skipped rather than burst through.
    assert!(deadlines[2] - deadlines[0] >= Duration::from_millis(150));
}

#[test]
fn same_deadline_timers_fire_in_insertion_order() {
    let reactor = Reactor::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    let deadline = reactor.now_uncached() + Duration::from_millis(20);

    for tag in ["first", "second", "third"] {
        let order = Rc::clone(&order);
        let r2 = reactor.clone();
        reactor.schedule(deadline, Duration::ZERO, true, move |_| {
            order.borrow_mut().push(tag);
            if order.borrow().len() == 3 {
                r2.stop();
            }
        });
    }

    reactor.run(Some(Duration::from_secs(1)), None).unwrap();
    assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
}

#[test]
fn canceled_timer_never_fires() {
    let reactor = Reactor::new().unwrap();
    let fired = Rc::new(Cell::new(false));

    let fired2 = Rc::clone(&fired);
    let handle = reactor.schedule_rel(Duration::from_millis(20), Duration::ZERO, true, move |_| {
        fired2.set(true);
    });
    handle.cancel();
    assert!(handle.is_canceled());

    reactor.run(Some(Duration::from_millis(80)), None).unwrap();
    assert!(!fired.get());
}

#[test]
fn rescheduling_during_firing_gets_a_second_shot() {
    let reactor = Reactor::new().unwrap();
    let count = Rc::new(Cell::new(0));
    let handle_slot: Rc<RefCell<Option<riptide::TimerHandle>>> = Rc::new(RefCell::new(None));

    let count2 = Rc::clone(&count);
    let slot2 = Rc::clone(&handle_slot);
    let r2 = reactor.clone();
    let handle = reactor.schedule_rel(Duration::from_millis(20), Duration::ZERO, true, move |_| {
        let n = count2.get() + 1;
        count2.set(n);
        if n == 1 {
            if let Some(h) = slot2.borrow().as_ref() {
                h.set_next_fire_time(r2.now() + Duration::from_millis(30));
            }
        } else {
            r2.stop();
        }
    });
    *handle_slot.borrow_mut() = Some(handle);

    reactor.run(Some(Duration::from_secs(1)), None).unwrap();
    assert_eq!(count.get(), 2);
}

#[test]
fn interval_change_applies_to_subsequent_recurrences() {
    let reactor = Reactor::new().unwrap();
    let deadlines = Rc::new(RefCell::new(Vec::new()));
    let handle_slot: Rc<RefCell<Option<riptide::TimerHandle>>> = Rc::new(RefCell::new(None));

    let deadlines2 = Rc::clone(&deadlines);
    let slot2 = Rc::clone(&handle_slot);
    let r2 = reactor.clone();
    let handle = reactor.schedule_rel(
        Duration::from_millis(10),
        Duration::from_millis(100),
        false,
        move |_| {
            let handle = slot2.borrow();
            let h = handle.as_ref().unwrap();
            deadlines2.borrow_mut().push(h.next_fire_time().unwrap());
            if deadlines2.borrow().len() == 1 {
                h.set_recur_interval(Duration::from_millis(10));
            }
            if deadlines2.borrow().len() >= 3 {
                r2.stop();
            }
        },
    );
    *handle_slot.borrow_mut() = Some(handle);

    reactor.run(Some(Duration::from_secs(2)), None).unwrap();

    let deadlines = deadlines.borrow();
    assert!(deadlines.len() >= 3);
    // The new interval took effect at the first recurrence computation.
    assert_eq!(deadlines[1] - deadlines[0], Duration::from_millis(10));
    assert_eq!(deadlines[2] - deadlines[1], Duration::from_millis(10));
}

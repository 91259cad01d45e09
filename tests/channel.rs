use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use cordage::cord;
use cordage::fiber::{self, Channel, RecvError, TryRecvError, TrySendError};

/// Counts drops of the payload, to observe message destruction.
#[derive(Debug)]
struct Tracked {
    counter: Rc<Cell<u32>>,
}

impl Tracked {
    fn new(counter: &Rc<Cell<u32>>) -> Self {
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.counter.set(self.counter.get() + 1);
    }
}

#[test]
fn buffered_put_fails_fast_when_full() {
    cord::run(|| {
        let ch: Channel<i32> = Channel::new(3);
        for i in 0..3 {
            ch.try_send(i).unwrap();
        }
        match ch.try_send(4) {
            Err(TrySendError::Full(4)) => {}
            other => panic!("expected Full, got {other:?}"),
        }
        assert!(ch.is_full());
        assert_eq!(ch.len(), 3);
    })
    .unwrap();
}

#[test]
fn rendezvous_meets_in_both_orders() {
    cord::run(|| {
        // Sender first.
        let ch: Channel<&str> = Channel::new(0);
        let tx = ch.clone();
        let started = Instant::now();
        let producer = fiber::start_proc(move || {
            tx.send_timeout("x", Duration::from_secs(1)).unwrap();
        });
        fiber::sleep(Duration::from_millis(100));
        assert_eq!(ch.recv_timeout(Duration::from_secs(1)).unwrap(), "x");
        producer.join();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(90));
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");

        // Receiver first.
        let rx = ch.clone();
        let consumer = fiber::start(move || rx.recv_timeout(Duration::from_secs(1)).unwrap());
        ch.send_timeout("y", Duration::from_secs(1)).unwrap();
        assert_eq!(consumer.join(), "y");
    })
    .unwrap();
}

#[test]
fn parked_readers_are_served_fifo() {
    cord::run(|| {
        let ch: Channel<i32> = Channel::new(0);
        let r1 = {
            let ch = ch.clone();
            fiber::start(move || ch.recv().unwrap())
        };
        let r2 = {
            let ch = ch.clone();
            fiber::start(move || ch.recv().unwrap())
        };
        assert!(ch.has_readers());
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        assert_eq!(r1.join(), 1);
        assert_eq!(r2.join(), 2);
    })
    .unwrap();
}

#[test]
fn get_refills_the_ring_from_parked_writers() {
    cord::run(|| {
        let ch: Channel<i32> = Channel::new(1);
        ch.try_send(1).unwrap();
        let w2 = {
            let ch = ch.clone();
            fiber::start_proc(move || ch.send(2).unwrap())
        };
        assert!(ch.has_writers());
        // Draining one slot pulls the parked writer's message into the
        // ring, preserving delivery order.
        assert_eq!(ch.recv().unwrap(), 1);
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.recv().unwrap(), 2);
        w2.join();
    })
    .unwrap();
}

#[test]
fn close_fails_senders_and_receivers() {
    cord::run(|| {
        let drops = Rc::new(Cell::new(0));
        let ch: Channel<Tracked> = Channel::new(2);
        ch.try_send(Tracked::new(&drops)).unwrap();
        ch.try_send(Tracked::new(&drops)).unwrap();
        ch.close();
        assert!(ch.is_closed());
        // Buffered messages are destroyed exactly once each.
        assert_eq!(drops.get(), 2);
        assert!(matches!(
            ch.try_send(Tracked::new(&drops)),
            Err(TrySendError::Closed(_))
        ));
        assert!(matches!(ch.try_recv(), Err(TryRecvError::Closed)));
        // Closing again is a no-op.
        ch.close();
        assert_eq!(drops.get(), 3); // 2 buffered + the rejected send
    })
    .unwrap();
}

// A buffered message goes to the first getter; the remaining parked
// getters are all woken by close with a "closed" verdict, and nothing is
// destroyed twice.
#[test]
fn close_wakes_parked_getters() {
    cord::run(|| {
        let drops = Rc::new(Cell::new(0));
        let ch: Channel<Tracked> = Channel::new(1);
        ch.try_send(Tracked::new(&drops)).unwrap();

        let g1 = {
            let ch = ch.clone();
            fiber::start(move || ch.recv().map(|_msg| ()).map_err(|e| e))
        };
        let g2 = {
            let ch = ch.clone();
            fiber::start(move || ch.recv().map(|_msg| ()).map_err(|e| e))
        };
        let g3 = {
            let ch = ch.clone();
            fiber::start(move || ch.recv().map(|_msg| ()).map_err(|e| e))
        };
        // g1 consumed the buffered message synchronously and dropped it.
        assert_eq!(drops.get(), 1);

        let closed_at = Instant::now();
        ch.close();
        assert_eq!(g2.join(), Err(RecvError::Closed));
        assert_eq!(g3.join(), Err(RecvError::Closed));
        assert!(closed_at.elapsed() < Duration::from_secs(1));
        assert_eq!(g1.join(), Ok(()));
        // Close destroyed nothing: the only message was delivered.
        assert_eq!(drops.get(), 1);
    })
    .unwrap();
}

#[test]
fn close_returns_the_message_to_a_parked_sender() {
    cord::run(|| {
        let ch: Channel<String> = Channel::new(0);
        let tx = ch.clone();
        let sender = fiber::start(move || tx.send("undelivered".to_string()));
        ch.close();
        match sender.join() {
            Err(e) => assert_eq!(e.into_inner(), "undelivered"),
            Ok(()) => panic!("send on a closed channel succeeded"),
        }
    })
    .unwrap();
}

#[test]
fn recv_timeout_expires() {
    cord::run(|| {
        let ch: Channel<i32> = Channel::new(1);
        let started = Instant::now();
        assert_eq!(
            ch.recv_timeout(Duration::from_millis(50)),
            Err(RecvError::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
    })
    .unwrap();
}

#[test]
fn cancelled_waiter_fails_with_cancelled() {
    cord::run(|| {
        let ch: Channel<i32> = Channel::new(0);
        let rx = ch.clone();
        let reader = fiber::start(move || rx.recv());
        reader.cancel();
        assert_eq!(reader.join(), Err(RecvError::Cancelled));
        // The channel stays usable.
        let rx = ch.clone();
        let reader = fiber::start(move || rx.recv().unwrap());
        ch.send(7).unwrap();
        assert_eq!(reader.join(), 7);
    })
    .unwrap();
}

#[test]
fn cancelled_receiver_still_drains_available_messages() {
    cord::run(|| {
        let ch: Channel<i32> = Channel::new(1);
        ch.try_send(1).unwrap();
        let rx = ch.clone();
        let reader = fiber::start(move || {
            while !fiber::is_cancelled() {
                fiber::yield_now();
            }
            // A cancelled fiber can still take what is already there.
            rx.recv()
        });
        reader.cancel();
        assert_eq!(reader.join(), Ok(1));
    })
    .unwrap();
}

#[test]
fn iterator_drains_until_close() {
    cord::run(|| {
        let ch: Channel<i32> = Channel::new(0);
        let tx = ch.clone();
        let producer = fiber::defer_proc(move || {
            for i in 0..3 {
                tx.send(i).unwrap();
            }
            tx.close();
        });
        let got: Vec<_> = ch.iter().collect();
        assert_eq!(got, vec![0, 1, 2]);
        producer.join();
    })
    .unwrap();
}

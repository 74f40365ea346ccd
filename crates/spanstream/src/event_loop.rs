//! Cooperative event loop for the recorder's single I/O thread.
//!
//! Wraps a `mio::Poll` with a one-shot timer heap and a cross-thread
//! waker. Timer callbacks are tagged variants owned by the driving
//! [`EventHandler`], dispatched by value; sockets are dispatched by token.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::time::{Duration, Instant};

/// Token reserved for the cross-thread waker.
pub const WAKER_TOKEN: Token = Token(0);

/// Snapshot of a socket event, detached from the poll's event buffer.
#[derive(Debug, Clone, Copy)]
pub struct SocketReadiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error condition (e.g. a refused non-blocking connect).
    pub error: bool,
}

/// Component driving the loop: receives timer and socket dispatches.
pub trait EventHandler<T: Copy> {
    fn on_timer(&mut self, event_loop: &mut EventLoop<T>, tag: T);
    fn on_socket(&mut self, event_loop: &mut EventLoop<T>, readiness: SocketReadiness);
}

struct TimerEntry<T> {
    deadline: Instant,
    seq: u64,
    tag: T,
}

impl<T> PartialEq for TimerEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for TimerEntry<T> {}

impl<T> PartialOrd for TimerEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for TimerEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Single-threaded dispatcher over timers and non-blocking sockets.
pub struct EventLoop<T> {
    poll: Poll,
    events: Events,
    timers: BinaryHeap<Reverse<TimerEntry<T>>>,
    timer_seq: u64,
    ready: Vec<SocketReadiness>,
    due: Vec<T>,
    break_requested: bool,
}

impl<T: Copy> EventLoop<T> {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            ready: Vec::new(),
            due: Vec::new(),
            break_requested: false,
        })
    }

    /// Creates a waker other threads can use to interrupt the kernel wait.
    ///
    /// Wakes surface as a [`SocketReadiness`] on [`WAKER_TOKEN`].
    pub fn waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), WAKER_TOKEN)
    }

    pub fn register(
        &self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn deregister(&self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Schedules a one-shot timer `delay` from now.
    pub fn on_timeout(&mut self, delay: Duration, tag: T) {
        let seq = self.timer_seq;
        self.timer_seq += 1;
        self.timers.push(Reverse(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            tag,
        }));
    }

    /// Requests the dispatch loop to exit after the current turn.
    pub fn loop_break(&mut self) {
        self.break_requested = true;
    }

    /// Dispatches until [`loop_break`](Self::loop_break) is called.
    pub fn run<H>(&mut self, handler: &mut H) -> io::Result<()>
    where
        H: EventHandler<T>,
    {
        while !self.break_requested {
            self.turn(None, handler)?;
        }
        Ok(())
    }

    /// One dispatch turn: waits for the next timer or socket event (capped
    /// by `max_wait`), then dispatches everything that became ready.
    pub fn turn<H>(&mut self, max_wait: Option<Duration>, handler: &mut H) -> io::Result<()>
    where
        H: EventHandler<T>,
    {
        let now = Instant::now();
        let until_timer = self
            .timers
            .peek()
            .map(|Reverse(entry)| entry.deadline.saturating_duration_since(now));
        let timeout = match (until_timer, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        // Detach events before dispatching so handlers may register
        // sockets and schedule timers on the loop.
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter().map(|event| SocketReadiness {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
        }));
        for readiness in ready.drain(..) {
            handler.on_socket(self, readiness);
        }
        self.ready = ready;

        let now = Instant::now();
        let mut due = std::mem::take(&mut self.due);
        due.clear();
        while self
            .timers
            .peek()
            .is_some_and(|Reverse(entry)| entry.deadline <= now)
        {
            if let Some(Reverse(entry)) = self.timers.pop() {
                due.push(entry.tag);
            }
        }
        for tag in due.drain(..) {
            handler.on_timer(self, tag);
        }
        self.due = due;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Tag {
        A,
        B,
        C,
    }

    struct Recorder {
        fired: Vec<Tag>,
        stop_after: usize,
        woken: bool,
    }

    impl EventHandler<Tag> for Recorder {
        fn on_timer(&mut self, event_loop: &mut EventLoop<Tag>, tag: Tag) {
            self.fired.push(tag);
            if self.fired.len() >= self.stop_after {
                event_loop.loop_break();
            }
        }

        fn on_socket(&mut self, event_loop: &mut EventLoop<Tag>, readiness: SocketReadiness) {
            if readiness.token == WAKER_TOKEN {
                self.woken = true;
                event_loop.loop_break();
            }
        }
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let mut handler = Recorder {
            fired: Vec::new(),
            stop_after: 3,
            woken: false,
        };
        event_loop.on_timeout(Duration::from_millis(30), Tag::C);
        event_loop.on_timeout(Duration::from_millis(10), Tag::A);
        event_loop.on_timeout(Duration::from_millis(20), Tag::B);

        event_loop.run(&mut handler).unwrap();
        assert_eq!(handler.fired, vec![Tag::A, Tag::B, Tag::C]);
    }

    #[test]
    fn equal_deadlines_dispatch_in_schedule_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let mut handler = Recorder {
            fired: Vec::new(),
            stop_after: 3,
            woken: false,
        };
        for tag in [Tag::B, Tag::A, Tag::C] {
            event_loop.on_timeout(Duration::ZERO, tag);
        }
        event_loop.run(&mut handler).unwrap();
        assert_eq!(handler.fired, vec![Tag::B, Tag::A, Tag::C]);
    }

    #[test]
    fn waker_interrupts_the_kernel_wait() {
        let mut event_loop = EventLoop::new().unwrap();
        let waker = Arc::new(event_loop.waker().unwrap());
        let mut handler = Recorder {
            fired: Vec::new(),
            stop_after: usize::MAX,
            woken: false,
        };

        let wake_from_elsewhere = {
            let waker = Arc::clone(&waker);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                waker.wake().unwrap();
            })
        };

        event_loop.run(&mut handler).unwrap();
        wake_from_elsewhere.join().unwrap();
        assert!(handler.woken);
        assert!(handler.fired.is_empty());
    }
}

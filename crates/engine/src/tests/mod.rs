//! Engine-internal tests: tracker and nudge semantics that the public
//! surface cannot observe directly.

use crate::{
    channel::{ChannelFlags, ChannelState},
    driver::ThreadAction,
    engine::Engine,
    mem,
    port::{IoPort, MemPort},
    ready::{self, EventSource},
    thread,
};
use std::{sync::Arc, time::Duration};

fn engine() -> (Engine, Arc<MemPort>) {
    let port = Arc::new(MemPort::new());
    let engine = Engine::with_port(Arc::clone(&port) as Arc<dyn IoPort>);
    (engine, port)
}

fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached in time");
}

#[test]
fn test_ready_enqueue_single_flight() {
    let (_engine, port) = engine();
    let source = EventSource::register(|| {});
    let (handle, _ep) = mem::pair(&port);
    let chan = handle.channel();
    let (_, tsd) = thread::ensure_current();

    {
        let mut g = chan.lock();
        ready::ready_enqueue(chan, &mut g, false);
        // Tracker suppresses the second enqueue between dequeues
        ready::ready_enqueue(chan, &mut g, false);
    }
    assert_eq!(1, tsd.inner.lock().ready.len());

    // Forced enqueues bypass the tracker
    {
        let mut g = chan.lock();
        ready::ready_enqueue(chan, &mut g, true);
    }
    assert_eq!(2, tsd.inner.lock().ready.len());

    // Two entries collapse into one event: the event tracker catches the
    // second
    let mut events = Vec::new();
    source.check(|ev| events.push(ev));
    assert_eq!(1, events.len());
    assert!(tsd.inner.lock().ready.is_empty());
    for ev in events {
        assert!(ev.service());
    }

    // After a dequeue the tracker is clear and enqueuing works again
    {
        let mut g = chan.lock();
        ready::ready_enqueue(chan, &mut g, false);
    }
    assert_eq!(1, tsd.inner.lock().ready.len());
    source.check(|ev| {
        ev.service();
    });
    handle.close();
}

#[test]
fn test_nudge_wakes_instead_of_queueing() {
    let (_engine, port) = engine();
    let _source = EventSource::register(|| {});
    let (handle, _ep) = mem::pair(&port);
    let chan = handle.channel();
    let (_, tsd) = thread::ensure_current();

    {
        let mut g = chan.lock();
        g.flags.insert(ChannelFlags::BLOCKED_READ);
        ready::nudge(chan, &mut g, ChannelFlags::BLOCKED_READ, false);
        assert!(!g.flags.contains(ChannelFlags::BLOCKED_READ));
    }
    // The blocked marker consumed the nudge; nothing was queued
    assert!(tsd.inner.lock().ready.is_empty());
    handle.close();
}

#[test]
fn test_nudge_unwatched_channel_is_silent() {
    let (_engine, port) = engine();
    let _source = EventSource::register(|| {});
    let (handle, _ep) = mem::pair(&port);
    let chan = handle.channel();
    let (_, tsd) = thread::ensure_current();

    {
        let mut g = chan.lock();
        ready::nudge(chan, &mut g, ChannelFlags::empty(), false);
    }
    assert!(tsd.inner.lock().ready.is_empty());
    handle.close();
}

#[test]
fn test_check_drops_disowned_entries() {
    let (_engine, port) = engine();
    let source = EventSource::register(|| {});
    let (handle, _ep) = mem::pair(&port);
    let chan = handle.channel();

    {
        let mut g = chan.lock();
        ready::ready_enqueue(chan, &mut g, true);
    }
    handle.thread_action(ThreadAction::Detach);
    let mut events = 0;
    source.check(|_| events += 1);
    assert_eq!(0, events);
    handle.close();
}

#[test]
fn test_detached_enqueue_is_noop() {
    let (_engine, port) = engine();
    let _source = EventSource::register(|| {});
    let (handle, _ep) = mem::pair(&port);
    let chan = handle.channel();
    let (_, tsd) = thread::ensure_current();

    handle.thread_action(ThreadAction::Detach);
    {
        let mut g = chan.lock();
        ready::ready_enqueue(chan, &mut g, true);
    }
    assert!(tsd.inner.lock().ready.is_empty());
    handle.close();
}

#[test]
fn test_orphan_thread_drops_entries() {
    let (_engine, port) = engine();
    let (handle, _ep) = mem::pair(&port);
    let moved = handle.clone();

    // Attach on a thread that registers and then exits
    let worker = std::thread::spawn(move || {
        let _source = EventSource::register(|| {});
        moved.thread_action(ThreadAction::Attach);
    });
    worker.join().unwrap();

    // The owner's state block is now orphaned; enqueues drop their entry
    let chan = handle.channel();
    {
        let mut g = chan.lock();
        assert!(g.owner.is_some());
        ready::ready_enqueue(chan, &mut g, true);
        assert!(g.ready_thread.is_none());
    }
    handle.close();
}

#[test]
fn test_completion_reaches_input_queue() {
    let (_engine, port) = engine();
    let _source = EventSource::register(|| {});
    let (handle, ep) = mem::pair(&port);
    let chan = handle.channel();

    ep.push_bytes(b"ping");
    wait_until(|| !chan.lock().input.is_empty());

    let g = chan.lock();
    assert_eq!(ChannelState::Open, g.state);
    assert!(g.pending_reads < g.max_pending_reads);
    drop(g);
    handle.close();
}

//! End-to-end scenarios over real pipes and sockets.
//!
//! Timing assertions use generous bounds so loaded CI machines do not
//! produce false failures.

use std::cell::{Cell, RefCell};
use std::io::Write as _;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::{Buffer, ChainOp, ChunkMarker, Error, Resume, Runtime, Timer};

fn rt() -> Runtime {
    Runtime::new().expect("runtime setup failed")
}

/// Read exactly `n` bytes from `io`, looping over short reads.
fn read_exact(rt: &Runtime, io: &impl AsRawFd, n: usize) -> Vec<u8> {
    let buf = Buffer::new();
    let mut got = 0;
    while got < n {
        match rt.read(io, &buf, n - got, false, got).expect("read failed") {
            Some(k) => got += k,
            None => break,
        }
    }
    buf.to_vec()
}

#[test]
fn test_root_fiber_can_do_io() {
    let rt = rt();
    let (reader, writer) = std::io::pipe().unwrap();

    let n = rt.write(&writer, &Buffer::from("ping")).unwrap();
    assert_eq!(n, 4);
    assert_eq!(read_exact(&rt, &reader, 4), b"ping");
}

#[test]
fn test_snooze_is_fifo() {
    let rt = rt();
    let order = Rc::new(RefCell::new(Vec::new()));

    for tag in 1..=3 {
        let order = order.clone();
        rt.spawn(move |rt| {
            order.borrow_mut().push(tag);
            rt.snooze()?;
            order.borrow_mut().push(tag + 10);
            Ok(())
        })
        .unwrap();
    }
    rt.run().unwrap();

    assert_eq!(&*order.borrow(), &[1, 2, 3, 11, 12, 13]);
}

#[test]
fn test_suspend_resumes_with_scheduled_value() {
    let rt = rt();
    let seen = Rc::new(Cell::new(0i64));

    let seen2 = seen.clone();
    let waiter = rt
        .spawn(move |rt| {
            if let Resume::Value(v) = rt.suspend()? {
                seen2.set(v);
            }
            Ok(())
        })
        .unwrap();

    rt.spawn(move |rt| {
        rt.snooze()?; // let the waiter suspend first
        waiter.schedule_value(99);
        Ok(())
    })
    .unwrap();

    rt.run().unwrap();
    assert_eq!(seen.get(), 99);
}

#[test]
fn test_write_then_read_roundtrip() {
    let rt = rt();
    let (reader, writer) = std::io::pipe().unwrap();
    let payload = "the quick brown fox";

    let n = rt.write(&writer, &Buffer::from(payload)).unwrap();
    assert_eq!(n, payload.len());
    drop(writer);

    let buf = Buffer::new();
    let got = rt.read(&reader, &buf, 1024, true, 0).unwrap();
    assert_eq!(got, Some(payload.len()));
    assert_eq!(&*buf.bytes(), payload.as_bytes());

    // Next read observes EOF as a null result.
    assert_eq!(rt.read(&reader, &buf, 1024, true, 0).unwrap(), None);
}

#[test]
fn test_read_zero_len_submits_nothing() {
    let rt = rt();
    let (reader, _writer) = std::io::pipe().unwrap();
    let before = rt.stats().op_count;

    let buf = Buffer::new();
    assert_eq!(rt.read(&reader, &buf, 0, false, 0).unwrap(), None);
    assert_eq!(rt.stats().op_count, before);
}

#[test]
fn test_read_preserves_prefix_at_pos() {
    let rt = rt();
    let (reader, writer) = std::io::pipe().unwrap();
    rt.write(&writer, &Buffer::from("XYZ")).unwrap();

    let buf = Buffer::from("ab-old-tail");
    let got = rt.read(&reader, &buf, 8, false, 2).unwrap();
    assert_eq!(got, Some(3));
    assert_eq!(&*buf.bytes(), b"abXYZ");
}

#[test]
fn test_read_bad_fd_surfaces_errno() {
    let rt = rt();
    let buf = Buffer::new();
    struct BadFd;
    impl AsRawFd for BadFd {
        fn as_raw_fd(&self) -> i32 {
            -1
        }
    }
    match rt.read(&BadFd, &buf, 16, false, 0) {
        Err(Error::Os(e)) => assert_eq!(e, libc::EBADF),
        other => panic!("expected EBADF, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_writev_matches_concatenation() {
    let rt = rt();
    let (reader, writer) = std::io::pipe().unwrap();

    let bufs = [Buffer::from("ab"), Buffer::from("cd"), Buffer::from("ef")];
    let n = rt.writev(&writer, &bufs).unwrap();
    assert_eq!(n, 6);
    assert_eq!(read_exact(&rt, &reader, 6), b"abcdef");
}

#[test]
fn test_read_loop_chunks_until_eof() {
    let rt = rt();
    let (reader, mut writer) = std::io::pipe().unwrap();
    writer.write_all(b"0123456789").unwrap();
    drop(writer);

    let collected = Rc::new(RefCell::new(Vec::new()));
    let chunks = Rc::new(Cell::new(0usize));
    {
        let collected = collected.clone();
        let chunks = chunks.clone();
        rt.read_loop(&reader, 4, move |data| {
            collected.borrow_mut().extend_from_slice(data);
            chunks.set(chunks.get() + 1);
            Ok(())
        })
        .unwrap();
    }
    assert_eq!(&*collected.borrow(), b"0123456789");
    assert!(chunks.get() >= 3);
}

#[test]
fn test_echo_server() {
    let rt = rt();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    rt.spawn(move |rt| {
        let client: TcpStream = rt.accept(&listener)?;
        rt.read_loop(&client, 8192, |data| {
            rt.write(&client, &Buffer::from(data)).map(|_| ())
        })
    })
    .unwrap();

    let echoed = Rc::new(RefCell::new(Vec::new()));
    {
        let echoed = echoed.clone();
        rt.spawn(move |rt| {
            let stream = TcpStream::connect(addr).expect("connect failed");
            rt.write(&stream, &Buffer::from("hello world"))?;
            stream.shutdown(std::net::Shutdown::Write).ok();

            let buf = Buffer::new();
            rt.read(&stream, &buf, 64, true, 0)?;
            echoed.borrow_mut().extend_from_slice(&buf.bytes());
            Ok(())
        })
        .unwrap();
    }

    rt.run().unwrap();
    assert_eq!(&*echoed.borrow(), b"hello world");
}

#[test]
fn test_connect_through_ring() {
    let rt = rt();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let received = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        rt.spawn(move |rt| {
            let client: TcpStream = rt.accept(&listener)?;
            let buf = Buffer::new();
            rt.read(&client, &buf, 64, true, 0)?;
            received.borrow_mut().extend_from_slice(&buf.bytes());
            Ok(())
        })
        .unwrap();
    }

    rt.spawn(move |rt| {
        let raw = unsafe {
            libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
        };
        assert!(raw >= 0);
        let sock = unsafe { OwnedFd::from_raw_fd(raw) };
        rt.connect(&sock, "127.0.0.1", port)?;
        rt.write(&sock, &Buffer::from("over the ring"))?;
        Ok(())
    })
    .unwrap();

    rt.run().unwrap();
    assert_eq!(&*received.borrow(), b"over the ring");
}

#[test]
fn test_sleep_zero_yields_once() {
    let rt = rt();
    rt.sleep(Duration::ZERO).unwrap();
}

#[test]
fn test_sleep_duration() {
    let rt = rt();
    let start = Instant::now();
    rt.sleep(Duration::from_millis(30)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(25));
}

#[test]
fn test_timer_loop_stops_on_error() {
    let rt = rt();
    let ticks = Rc::new(Cell::new(0u32));
    let t = ticks.clone();
    let result = rt.timer_loop(Duration::from_millis(5), move || {
        t.set(t.get() + 1);
        if t.get() >= 3 { Err(Error::Cancelled) } else { Ok(()) }
    });
    assert_eq!(result, Err(Error::Cancelled));
    assert_eq!(ticks.get(), 3);
}

#[test]
fn test_ring_timeout_move_on_value() {
    let rt = rt();
    let result = rt.timeout(Duration::from_millis(10), None, Some(42), || {
        rt.sleep(Duration::from_secs(5))?;
        Ok(7)
    });
    assert_eq!(result, Ok(42));
}

#[test]
fn test_ring_timeout_exception() {
    let rt = rt();
    let result: crate::Result<()> = rt.timeout(
        Duration::from_millis(10),
        Some(Error::Cancelled),
        None,
        || {
            rt.sleep(Duration::from_secs(5))?;
            Ok(())
        },
    );
    assert_eq!(result, Err(Error::Cancelled));
}

#[test]
fn test_ring_timeout_block_wins() {
    let rt = rt();
    let result = rt.timeout(Duration::from_secs(5), None, Some(0), || Ok(1));
    assert_eq!(result, Ok(1));
    // The pending timer was cancelled; follow-up ops still work.
    rt.sleep(Duration::from_millis(1)).unwrap();
}

#[test]
fn test_nested_timeouts_innermost_wins() {
    let rt = rt();
    let result = rt.timeout(Duration::from_secs(5), None, Some(-1), || {
        let inner = rt.timeout(Duration::from_millis(10), None, Some(99), || {
            rt.sleep(Duration::from_secs(5))?;
            Ok(0)
        })?;
        Ok(inner)
    });
    assert_eq!(result, Ok(99));
}

#[test]
fn test_cancel_blocked_reader_releases_buffer() {
    let rt = rt();
    let (reader, writer) = std::io::pipe().unwrap();
    let buf = Buffer::with_capacity(1 << 20);

    let observer = buf.clone();
    let blocked = {
        let buf = buf.clone();
        rt.spawn(move |rt| {
            // Blocks: the writer never sends anything.
            rt.read(&reader, &buf, 1 << 20, true, 0).map(|_| ())
        })
        .unwrap()
    };

    rt.spawn(move |rt| {
        rt.sleep(Duration::from_millis(10))?;
        blocked.cancel();
        // Backend stays fully usable after the cancellation.
        let (r2, w2) = std::io::pipe().unwrap();
        rt.write(&w2, &Buffer::from("still alive"))?;
        let check = Buffer::new();
        rt.read(&r2, &check, 64, false, 0)?;
        assert_eq!(&*check.bytes(), b"still alive");
        // Give the kernel time to deliver the cancellation completion.
        rt.sleep(Duration::from_millis(20))?;
        Ok(())
    })
    .unwrap();

    rt.run().unwrap();
    drop(writer);

    // The interruption pinned the buffer to the op context; once the
    // cancellation completion arrived it was let go. Two handles remain:
    // ours and the observer's.
    assert!(observer.handle_count() <= 2, "buffer still pinned");
    let stats = rt.stats();
    assert!(
        stats.context_capacity - stats.free_contexts <= 1,
        "context leaked: {} of {} free",
        stats.free_contexts,
        stats.context_capacity
    );
}

#[test]
fn test_chain_writes_atomically() {
    let rt = rt();
    let (reader, writer) = std::io::pipe().unwrap();

    let total = rt
        .chain(&[
            ChainOp::write(&writer, "hello"),
            ChainOp::write(&writer, " world"),
        ])
        .unwrap();
    assert_eq!(total, 11);
    assert_eq!(read_exact(&rt, &reader, 11), b"hello world");
}

#[test]
fn test_chain_invalid_op_submits_nothing() {
    let rt = rt();
    let (reader, writer) = std::io::pipe().unwrap();
    let before = rt.stats();

    let result = rt.chain(&[
        ChainOp::write(&writer, "data"),
        ChainOp::splice(&reader, &writer, 0),
    ]);
    assert!(matches!(result, Err(Error::Arg(_))));

    let after = rt.stats();
    assert_eq!(before.op_count, after.op_count);
    assert_eq!(before.free_contexts, after.free_contexts);
}

#[test]
fn test_chain_empty_is_zero() {
    let rt = rt();
    assert_eq!(rt.chain(&[]).unwrap(), 0);
}

#[test]
fn test_splice_moves_bytes() {
    let rt = rt();
    let (src_r, mut src_w) = std::io::pipe().unwrap();
    let (dst_r, dst_w) = std::io::pipe().unwrap();
    src_w.write_all(b"spliced payload").unwrap();

    let n = rt.splice(&src_r, &dst_w, 64).unwrap();
    assert_eq!(n, 15);
    assert_eq!(read_exact(&rt, &dst_r, 15), b"spliced payload");
}

#[test]
fn test_splice_to_eof_loops() {
    let rt = rt();
    let (src_r, mut src_w) = std::io::pipe().unwrap();
    let (dst_r, dst_w) = std::io::pipe().unwrap();
    src_w.write_all(b"abcdefgh").unwrap();
    drop(src_w);

    // Negative maxlen: loop until EOF in |maxlen| chunks.
    let n = rt.splice(&src_r, &dst_w, -3).unwrap();
    assert_eq!(n, 8);
    assert_eq!(read_exact(&rt, &dst_r, 8), b"abcdefgh");
}

#[test]
fn test_double_splice() {
    let rt = rt();
    let (src_r, mut src_w) = std::io::pipe().unwrap();
    let (dst_r, dst_w) = std::io::pipe().unwrap();
    src_w.write_all(b"through the middle pipe").unwrap();
    drop(src_w);

    let total = Rc::new(Cell::new(0usize));
    {
        let total = total.clone();
        rt.spawn(move |rt| {
            total.set(rt.double_splice(&src_r, &dst_w)?);
            Ok(())
        })
        .unwrap();
    }
    rt.run().unwrap();

    assert_eq!(total.get(), 23);
    assert_eq!(read_exact(&rt, &dst_r, 23), b"through the middle pipe");
}

#[test]
fn test_tee_duplicates_without_consuming() {
    let rt = rt();
    let (src_r, mut src_w) = std::io::pipe().unwrap();
    let (dst_r, dst_w) = std::io::pipe().unwrap();
    src_w.write_all(b"mirror").unwrap();

    let n = rt.tee(&src_r, &dst_w, 64).unwrap();
    assert_eq!(n, 6);
    assert_eq!(read_exact(&rt, &dst_r, 6), b"mirror");
    // Source still holds the bytes.
    assert_eq!(read_exact(&rt, &src_r, 6), b"mirror");
}

#[test]
fn test_splice_chunks_frames_output() {
    let rt = rt();
    let (src_r, mut src_w) = std::io::pipe().unwrap();
    let (dst_r, dst_w) = std::io::pipe().unwrap();
    src_w.write_all(b"foobar").unwrap();
    drop(src_w);

    let prefix = Buffer::from("[");
    let postfix = Buffer::from("]");
    let chunk_prefix = ChunkMarker::Dynamic(Box::new(|len| Buffer::from(format!("{}:", len).as_str())));

    let total = rt
        .splice_chunks(
            &src_r,
            &dst_w,
            Some(&prefix),
            Some(&postfix),
            Some(&chunk_prefix),
            None,
            4,
        )
        .unwrap();
    assert_eq!(total, 6);
    assert_eq!(read_exact(&rt, &dst_r, 12), b"[4:foob2:ar]");
}

#[test]
fn test_wait_io_readable() {
    let rt = rt();
    let (reader, writer) = std::io::pipe().unwrap();

    rt.spawn(move |rt| {
        rt.sleep(Duration::from_millis(10))?;
        rt.write(&writer, &Buffer::from("x"))?;
        Ok(())
    })
    .unwrap();

    let done = Rc::new(Cell::new(false));
    {
        let done = done.clone();
        rt.spawn(move |rt| {
            rt.wait_io(&reader, false)?;
            done.set(true);
            Ok(())
        })
        .unwrap();
    }
    rt.run().unwrap();
    assert!(done.get());
}

#[test]
fn test_wait_event_until_scheduled() {
    let rt = rt();
    let woken = Rc::new(Cell::new(false));

    let waiter = {
        let woken = woken.clone();
        rt.spawn(move |rt| {
            rt.wait_event(true)?;
            woken.set(true);
            Ok(())
        })
        .unwrap()
    };

    rt.spawn(move |rt| {
        rt.sleep(Duration::from_millis(10))?;
        waiter.schedule();
        Ok(())
    })
    .unwrap();

    rt.run().unwrap();
    assert!(woken.get());
}

#[test]
fn test_waitpid_reaps_child() {
    let rt = rt();
    let child = std::process::Command::new("true")
        .spawn()
        .expect("spawn true");
    let pid = child.id() as i32;
    std::mem::forget(child);

    let (reaped, status) = rt.waitpid(pid).unwrap();
    assert_eq!(reaped, pid);
    assert_eq!(status, 0);
}

#[test]
fn test_close_fd_through_ring() {
    let rt = rt();
    let (reader, writer) = std::io::pipe().unwrap();
    let raw = writer.as_raw_fd();
    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
    std::mem::forget(writer);

    rt.close_fd(owned).unwrap();

    // Writer closed: reader sees EOF.
    let buf = Buffer::new();
    assert_eq!(rt.read(&reader, &buf, 16, true, 0).unwrap(), None);
}

#[test]
fn test_timer_every_granularity() {
    let rt = rt();
    let timer = Timer::with_resolution(&rt, Duration::from_millis(2)).unwrap();
    let counter = Rc::new(Cell::new(0u32));

    let worker = {
        let counter = counter.clone();
        let timer = timer.clone();
        rt.spawn(move |_| {
            timer.every(Duration::from_millis(10), || {
                counter.set(counter.get() + 1);
                Ok(())
            })
        })
        .unwrap()
    };

    {
        let timer = timer.clone();
        rt.spawn(move |rt| {
            rt.sleep(Duration::from_millis(50))?;
            worker.cancel();
            timer.stop();
            Ok(())
        })
        .unwrap();
    }

    rt.run().unwrap();
    let ticks = counter.get();
    assert!((2..=7).contains(&ticks), "ticks = {}", ticks);
}

#[test]
fn test_timer_sleep() {
    let rt = rt();
    let timer = Timer::with_resolution(&rt, Duration::from_millis(2)).unwrap();

    let elapsed = Rc::new(Cell::new(Duration::ZERO));
    {
        let elapsed = elapsed.clone();
        let timer = timer.clone();
        rt.spawn(move |_| {
            let start = Instant::now();
            timer.sleep(Duration::from_millis(20))?;
            elapsed.set(start.elapsed());
            timer.stop();
            Ok(())
        })
        .unwrap();
    }
    rt.run().unwrap();
    assert!(elapsed.get() >= Duration::from_millis(15));
    assert_eq!(timer.active(), 0, "record must be removed on exit");
}

#[test]
fn test_timer_cancel_after_fires() {
    let rt = rt();
    let timer = Timer::with_resolution(&rt, Duration::from_millis(2)).unwrap();

    let result = Rc::new(RefCell::new(Ok(())));
    {
        let result = result.clone();
        let timer = timer.clone();
        rt.spawn(move |rt| {
            let r = timer.cancel_after(Duration::from_millis(10), || {
                rt.sleep(Duration::from_secs(5))?;
                Ok(())
            });
            *result.borrow_mut() = r;
            timer.stop();
            Ok(())
        })
        .unwrap();
    }
    rt.run().unwrap();
    assert_eq!(*result.borrow(), Err(Error::Cancelled));
    assert_eq!(timer.active(), 0);
}

#[test]
fn test_timer_move_on_after() {
    let rt = rt();
    let timer = Timer::with_resolution(&rt, Duration::from_millis(2)).unwrap();

    let result = Rc::new(Cell::new(0));
    {
        let result = result.clone();
        let timer = timer.clone();
        rt.spawn(move |rt| {
            let r = timer.move_on_after(Duration::from_millis(10), -7, || {
                rt.sleep(Duration::from_secs(5))?;
                Ok(1)
            })?;
            result.set(r);
            timer.stop();
            Ok(())
        })
        .unwrap();
    }
    rt.run().unwrap();
    assert_eq!(result.get(), -7);
}

#[test]
fn test_timer_reset_defers_cancellation() {
    let rt = rt();
    let timer = Timer::with_resolution(&rt, Duration::from_millis(2)).unwrap();

    let result = Rc::new(RefCell::new(Err(Error::Cancelled)));
    {
        let result = result.clone();
        let timer = timer.clone();
        rt.spawn(move |rt| {
            // Total work (5 x 15ms) far exceeds the 40ms deadline, but each
            // iteration re-arms it in time.
            let r = timer.cancel_after(Duration::from_millis(40), || {
                for _ in 0..5 {
                    rt.sleep(Duration::from_millis(15))?;
                    timer.reset();
                }
                Ok(())
            });
            *result.borrow_mut() = r;
            timer.stop();
            Ok(())
        })
        .unwrap();
    }
    rt.run().unwrap();
    assert_eq!(*result.borrow(), Ok(()));
}

#[test]
fn test_timer_after_spawns_delayed_fiber() {
    let rt = rt();
    let timer = Timer::with_resolution(&rt, Duration::from_millis(2)).unwrap();
    let fired = Rc::new(Cell::new(false));

    {
        let fired = fired.clone();
        let stop = timer.clone();
        timer
            .after(Duration::from_millis(10), move |_| {
                fired.set(true);
                stop.stop();
                Ok(())
            })
            .unwrap();
    }
    rt.run().unwrap();
    assert!(fired.get());
}

#[test]
fn test_multishot_accept_feeds_queue() {
    let rt = rt();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let served = Rc::new(Cell::new(0u32));
    {
        let served = served.clone();
        let rt2 = rt.clone();
        let result = rt.spawn(move |rt| {
            let outcome = rt.multishot_accept(&listener, || {
                for _ in 0..2 {
                    let client: TcpStream = rt2.accept(&listener)?;
                    let buf = Buffer::new();
                    rt2.read(&client, &buf, 64, true, 0)?;
                    served.set(served.get() + 1);
                }
                Ok(())
            });
            match outcome {
                Ok(()) => Ok(()),
                // Kernel predates multishot accept; nothing to test.
                Err(Error::Unsupported(_)) => Ok(()),
                Err(e) => Err(e),
            }
        });
        result.unwrap();
    }

    rt.spawn(move |rt| {
        for _ in 0..2 {
            let stream = TcpStream::connect(addr).expect("connect");
            rt.write(&stream, &Buffer::from("hi"))?;
        }
        Ok(())
    })
    .unwrap();

    rt.run().unwrap();
    // Either the kernel served both connections or multishot was
    // unsupported and the body was skipped.
    assert!(served.get() == 2 || served.get() == 0);
}

#[test]
fn test_wakeup_handle_noop_when_not_polling() {
    let rt = rt();
    let handle = rt.wakeup_handle();
    assert!(!handle.wake());
}

#[test]
fn test_no_context_leak_after_mixed_workload() {
    let rt = rt();
    let (reader, writer) = std::io::pipe().unwrap();

    rt.spawn(move |rt| {
        for i in 0..10 {
            rt.write(&writer, &Buffer::from(format!("msg-{}", i).as_str()))?;
            rt.sleep(Duration::from_millis(1))?;
        }
        Ok(())
    })
    .unwrap();

    rt.spawn(move |rt| {
        let buf = Buffer::new();
        let mut seen = 0usize;
        while seen < 50 {
            match rt.read(&reader, &buf, 64, false, 0)? {
                Some(n) => seen += n,
                None => break,
            }
        }
        Ok(())
    })
    .unwrap();

    rt.run().unwrap();
    let stats = rt.stats();
    // At most the armed wakeup poll may hold a context.
    assert!(
        stats.context_capacity - stats.free_contexts <= 1,
        "contexts leaked: {}/{} free",
        stats.free_contexts,
        stats.context_capacity
    );
}

#[test]
fn test_idle_hook_runs() {
    let rt = rt();
    let ran = Rc::new(Cell::new(false));
    {
        let ran = ran.clone();
        rt.set_idle_hook(move || ran.set(true));
    }
    // Sleeping forces a blocking poll, which runs idle tasks first.
    rt.sleep(Duration::from_millis(5)).unwrap();
    assert!(ran.get());
}

#[test]
fn test_stats_count_ops_and_switches() {
    let rt = rt();
    rt.sleep(Duration::from_millis(1)).unwrap();
    rt.sleep(Duration::from_millis(1)).unwrap();
    let stats = rt.stats();
    assert!(stats.op_count >= 2);
    assert!(stats.switch_count >= 2);
    assert!(stats.poll_count >= 1);
}

//! Many readers against one writer on a shared frame buffer

use std::sync::{Arc, Barrier};
use std::thread;

use bytes::Bytes;
use rectiflow::capture::{ColorSpace, Frame, FrameMetadata, PixelFormat, TimeBase};
use rectiflow::pipeline::{FrameProducer, StopToken, WaitOutcome};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;
const FRAMES: i64 = 400;
const READERS: usize = 6;

/// Every byte of the frame encodes its timestamp, so a mix of two frames is detectable
fn stamped(pts: i64) -> Frame {
    let meta = FrameMetadata {
        sequence: pts as u64,
        width: WIDTH,
        height: HEIGHT,
        stride: WIDTH * 3,
        format: PixelFormat::Rgb24,
        color_space: ColorSpace::Srgb,
        pts,
        time_base: TimeBase::per_frame(30),
    };
    let value = (pts % 251) as u8;
    Frame::new(meta, Bytes::from(vec![value; (WIDTH * HEIGHT * 3) as usize])).unwrap()
}

fn assert_consistent(frame: &Frame) {
    let expected = (frame.pts() % 251) as u8;
    assert!(
        frame.data.iter().all(|&b| b == expected),
        "frame pts={} holds bytes from another frame",
        frame.pts()
    );
}

#[test]
fn readers_never_observe_torn_frames_or_going_backwards() {
    let mut producer = FrameProducer::new("raw", None);
    let stop = StopToken::new();
    stop.watch(producer.buffer());
    let start = Arc::new(Barrier::new(READERS + 1));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let observer = producer.observer();
            let stop = stop.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let mut last = None;
                let mut seen = 0u64;
                loop {
                    match observer.wait_newer(last, &stop) {
                        WaitOutcome::Frame(frame) => {
                            assert_consistent(&frame);
                            if let Some(last) = last {
                                assert!(frame.pts() > last, "{} after {}", frame.pts(), last);
                            }
                            last = Some(frame.pts());
                            seen += 1;
                        }
                        WaitOutcome::EndOfStream | WaitOutcome::Closed => break,
                        WaitOutcome::Stopped => panic!("nobody requested a stop"),
                    }
                }
                seen
            })
        })
        .collect();

    start.wait();
    for pts in 0..FRAMES {
        producer.update(Some(stamped(pts))).unwrap();
        if pts % 50 == 0 {
            thread::yield_now();
        }
    }
    producer.update(None).unwrap();

    for reader in readers {
        let seen = reader.join().unwrap();
        assert!(seen <= FRAMES as u64);
    }
}

#[test]
fn polling_reads_are_consistent_while_writing() {
    let mut producer = FrameProducer::new("raw", None);
    let observer = producer.observer();
    producer.update(Some(stamped(0))).unwrap();

    let pollers: Vec<_> = (0..READERS)
        .map(|_| {
            let observer = observer.clone();
            thread::spawn(move || {
                let mut last = 0;
                while let Ok(Some(frame)) = observer.latest() {
                    assert_consistent(&frame);
                    assert!(frame.pts() >= last);
                    last = frame.pts();
                    if last == FRAMES - 1 {
                        break;
                    }
                }
                last
            })
        })
        .collect();

    for pts in 1..FRAMES {
        producer.update(Some(stamped(pts))).unwrap();
    }

    for poller in pollers {
        assert_eq!(poller.join().unwrap(), FRAMES - 1);
    }
    drop(producer);
    assert!(observer.is_closed());
}

#[test]
fn stop_wakes_every_blocked_reader() {
    let producer = FrameProducer::new("idle", None);
    let stop = StopToken::new();
    stop.watch(producer.buffer());
    let start = Arc::new(Barrier::new(READERS + 1));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let observer = producer.observer();
            let stop = stop.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                observer.wait_newer(None, &stop)
            })
        })
        .collect();

    start.wait();
    thread::sleep(std::time::Duration::from_millis(30));
    assert!(stop.request_stop());

    for reader in readers {
        assert!(matches!(reader.join().unwrap(), WaitOutcome::Stopped));
    }
    // Producer still alive: it was the stop, not a close, that released them
    assert!(!producer.observer().is_closed());
}

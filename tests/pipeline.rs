//! Whole-pipeline runs with scripted sources, detectors and sinks

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use image::RgbImage;
use rectiflow::capture::{
    ColorSpace, Frame, FrameMetadata, FrameSource, ImageSequenceSource, MediaFrame, PixelFormat,
    TimeBase,
};
use nalgebra::Point2;
use rectiflow::detect::{MarkerDetector, ReplayDetector};
use rectiflow::geometry::Quad;
use rectiflow::pipeline::{FrameSink, ImageSequenceSink};
use rectiflow::{Config, MarkerSet, Pipeline};

fn square(x: f64, y: f64, size: f64) -> Quad {
    [
        Point2::new(x, y),
        Point2::new(x + size, y),
        Point2::new(x + size, y + size),
        Point2::new(x, y + size),
    ]
}

fn frame(pts: i64, width: u32, height: u32) -> Frame {
    let meta = FrameMetadata {
        sequence: pts as u64,
        width,
        height,
        stride: width * 3,
        format: PixelFormat::Rgb24,
        color_space: ColorSpace::Srgb,
        pts,
        time_base: TimeBase::per_frame(30),
    };
    Frame::new(meta, Bytes::from(vec![128u8; (width * height * 3) as usize])).unwrap()
}

fn surface() -> MarkerSet {
    MarkerSet::new()
        .with(0, square(40.0, 30.0, 10.0))
        .with(1, square(270.0, 35.0, 10.0))
        .with(2, square(265.0, 200.0, 10.0))
        .with(3, square(45.0, 195.0, 10.0))
}

fn config() -> Config {
    let mut config = Config::default();
    config.rectify.output_width = 160;
    config.rectify.output_height = 120;
    config
}

#[derive(Clone, Default)]
struct Written(Arc<Mutex<Vec<(i64, u32, u32)>>>);

impl Written {
    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Block until the sink has taken `count` frames, or give up after a while
    fn wait_for(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl FrameSink for Written {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .push((frame.pts(), frame.meta.width, frame.meta.height));
        Ok(())
    }
}

/// Hands out the next frame only once the previous one reached the sink
struct LockStep {
    next: i64,
    total: i64,
    written: Written,
}

impl FrameSource for LockStep {
    fn next_frame(&mut self) -> Result<Option<MediaFrame>> {
        self.written.wait_for(self.next as usize);
        if self.next == self.total {
            return Ok(None);
        }
        let pts = self.next;
        self.next += 1;
        Ok(Some(MediaFrame::Video(frame(pts, 320, 240))))
    }
}

/// Endless stream at roughly 1 kHz
struct Endless(i64);

impl FrameSource for Endless {
    fn next_frame(&mut self) -> Result<Option<MediaFrame>> {
        thread::sleep(Duration::from_millis(1));
        self.0 += 1;
        Ok(Some(MediaFrame::Video(frame(self.0, 64, 48))))
    }
}

/// Surface visible on frames before pts `visible`, then lost
struct Scripted {
    visible: i64,
}

impl MarkerDetector for Scripted {
    fn detect(&mut self, _image: &RgbImage, pts: i64) -> Result<MarkerSet> {
        Ok(if pts < self.visible {
            surface()
        } else {
            MarkerSet::new()
        })
    }
}

#[test]
fn every_frame_is_rectified_in_order() {
    let written = Written::default();
    let source = LockStep {
        next: 0,
        total: 6,
        written: written.clone(),
    };
    let detector = Scripted { visible: 6 };

    let pipeline = Pipeline::spawn(&config(), source, detector, written.clone()).unwrap();
    let errors = pipeline.join();
    assert!(errors.is_empty(), "{errors:?}");

    let frames = written.0.lock().unwrap().clone();
    let expected: Vec<_> = (0..6).map(|pts| (pts, 160, 120)).collect();
    assert_eq!(frames, expected);
}

#[test]
fn transform_is_kept_after_markers_disappear() {
    let written = Written::default();
    let source = LockStep {
        next: 0,
        total: 4,
        written: written.clone(),
    };
    // Seen once, then hidden: later frames are still warped with the first transform
    let detector = Scripted { visible: 1 };

    let pipeline = Pipeline::spawn(&config(), source, detector, written.clone()).unwrap();
    assert!(pipeline.join().is_empty());

    let frames = written.0.lock().unwrap().clone();
    assert_eq!(frames.len(), 4);
    assert!(frames.iter().all(|&(_, w, h)| (w, h) == (160, 120)));
}

#[test]
fn without_markers_frames_pass_through() {
    let written = Written::default();
    let source = LockStep {
        next: 0,
        total: 3,
        written: written.clone(),
    };
    let detector = Scripted { visible: 0 };

    let pipeline = Pipeline::spawn(&config(), source, detector, written.clone()).unwrap();
    assert!(pipeline.join().is_empty());

    let frames = written.0.lock().unwrap().clone();
    assert_eq!(frames, vec![(0, 320, 240), (1, 320, 240), (2, 320, 240)]);
}

struct FailingSink;

impl FrameSink for FailingSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.pts() >= 3 {
            return Err(eyre!("disk full"));
        }
        Ok(())
    }
}

#[test]
fn a_failing_stage_stops_everything_and_reports_once() {
    let detector = Scripted { visible: 0 };
    let pipeline = Pipeline::spawn(&config(), Endless(0), detector, FailingSink).unwrap();

    let errors = pipeline.join();
    assert_eq!(errors.len(), 1, "{errors:?}");
    let chain: Vec<String> = errors[0].chain().map(ToString::to_string).collect();
    assert_eq!(chain.len(), 2);
    assert!(chain[0].starts_with("output stage: writing pts="), "{chain:?}");
    assert_eq!(chain[1], "disk full");
}

#[test]
fn external_stop_ends_an_endless_run_cleanly() {
    let written = Written::default();
    let detector = Scripted { visible: i64::MAX };
    let pipeline = Pipeline::spawn(&config(), Endless(0), detector, written.clone()).unwrap();

    written.wait_for(3);
    pipeline.request_stop();
    assert!(pipeline.coordinator().is_stop_requested());
    assert!(pipeline.join().is_empty());

    let frames = written.0.lock().unwrap().clone();
    assert!(frames.len() >= 3);
    assert!(frames.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn image_directories_end_to_end() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    for index in 0..3 {
        RgbImage::from_pixel(320, 240, image::Rgb([90, 120, 150]))
            .save(input.path().join(format!("img_{index:03}.png")))
            .unwrap();
    }
    let recording = r#"[{"id":0,"corners":[[40,30],[50,30],[50,40],[40,40]]},{"id":1,"corners":[[270,35],[280,35],[280,45],[270,45]]},{"id":2,"corners":[[265,200],[275,200],[275,210],[265,210]]},{"id":3,"corners":[[45,195],[55,195],[55,205],[45,205]]}]"#;

    let mut config = config();
    config.capture.input_dir = input.path().to_path_buf();
    config.capture.fps = 20;
    config.output.output_dir = output.path().join("rectified");

    let source = ImageSequenceSource::new(&config.capture).unwrap();
    let detector =
        ReplayDetector::from_reader(recording.as_bytes()).unwrap();
    let sink = ImageSequenceSink::new(&config.output).unwrap();

    let pipeline = Pipeline::spawn(&config, source, detector, sink).unwrap();
    assert!(pipeline.join().is_empty());

    let mut names: Vec<String> = std::fs::read_dir(&config.output.output_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert!(!names.is_empty());
    let allowed = ["frame_000000.png", "frame_000001.png", "frame_000002.png"];
    assert!(names.iter().all(|n| allowed.contains(&n.as_str())), "{names:?}");

    for name in &names {
        let img = image::open(config.output.output_dir.join(name))
            .unwrap()
            .into_rgb8();
        assert_eq!(img.dimensions(), (160, 120));
    }
}

//! Demo frame source that renders synthetic race footage
//!
//! Colored blocks travel top to bottom across the frame, each at its own lap
//! period, so they cross a horizontal finish line once per lap. Lets the
//! whole pipeline run without a camera.

use anyhow::Result;
use image::{Rgb, RgbImage};
use perlap_core::geometry::{FinishLine, Point};
use perlap_core::source::FrameSource;
use std::thread;
use std::time::{Duration, Instant};

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;
const FRAME_INTERVAL: Duration = Duration::from_millis(33); // ~30Hz
const BLOCK_SIZE: u32 = 40;
const BACKGROUND: Rgb<u8> = Rgb([60, 60, 60]);

/// One synthetic car
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoCar {
    pub color: [u8; 3],
    pub lap_period: Duration,
    /// Left edge of the car's lane
    pub x: u32,
}

fn demo_cars() -> Vec<DemoCar> {
    vec![
        DemoCar {
            color: [220, 30, 30],
            lap_period: Duration::from_millis(4200),
            x: 180,
        },
        DemoCar {
            color: [30, 60, 220],
            lap_period: Duration::from_millis(5100),
            x: 420,
        },
    ]
}

pub struct DemoFrameSource {
    cars: Vec<DemoCar>,
    open: bool,
    start_time: Option<Instant>,
    next_frame: Instant,
    frame_count: u64,
}

impl DemoFrameSource {
    pub fn new() -> Self {
        Self::with_cars(demo_cars())
    }

    pub fn with_cars(cars: Vec<DemoCar>) -> Self {
        Self {
            cars,
            open: false,
            start_time: None,
            next_frame: Instant::now(),
            frame_count: 0,
        }
    }

    pub fn cars(&self) -> &[DemoCar] {
        &self.cars
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// The horizontal line every demo car crosses
    pub fn finish_line() -> FinishLine {
        let y = (FRAME_HEIGHT / 2) as i32;
        FinishLine::new(Point::new(40, y), Point::new(FRAME_WIDTH as i32 - 40, y))
    }

    /// Block's top edge at `elapsed`; starts above the frame, ends below it
    fn block_y(car: &DemoCar, elapsed: Duration) -> i64 {
        let period = car.lap_period.as_millis().max(1) as i64;
        let phase = elapsed.as_millis() as i64 % period;
        let travel = (FRAME_HEIGHT + BLOCK_SIZE) as i64;
        phase * travel / period - BLOCK_SIZE as i64
    }

    /// Render the scene at a given time since open
    pub fn render_at(&self, elapsed: Duration) -> RgbImage {
        let mut img = RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, BACKGROUND);

        for car in &self.cars {
            let top = Self::block_y(car, elapsed);
            let y0 = top.clamp(0, FRAME_HEIGHT as i64) as u32;
            let y1 = (top + BLOCK_SIZE as i64).clamp(0, FRAME_HEIGHT as i64) as u32;
            let x0 = car.x.min(FRAME_WIDTH);
            let x1 = (car.x + BLOCK_SIZE).min(FRAME_WIDTH);
            for y in y0..y1 {
                for x in x0..x1 {
                    img.put_pixel(x, y, Rgb(car.color));
                }
            }
        }

        img
    }
}

impl Default for DemoFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for DemoFrameSource {
    fn name(&self) -> &str {
        "Demo"
    }

    fn open(&mut self) -> Result<()> {
        let now = Instant::now();
        self.open = true;
        self.start_time = Some(now);
        self.next_frame = now;
        self.frame_count = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.start_time = None;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(start) = self.start_time.filter(|_| self.open) else {
            return Ok(None);
        };

        // Pace to the nominal frame rate
        let now = Instant::now();
        if now < self.next_frame {
            thread::sleep(self.next_frame - now);
        }
        self.next_frame = Instant::now() + FRAME_INTERVAL;

        self.frame_count += 1;
        Ok(Some(self.render_at(start.elapsed())))
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

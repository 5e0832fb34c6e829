//! Test fixtures: synthetic screenshots and canned detector output

use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use ui_detect::models::detection::{Annotation, Tag};

/// A synthetic screenshot with known dimensions.
#[derive(Debug, Clone, Copy)]
pub struct ScreenshotFixture {
    pub filename: &'static str,
    pub width: u32,
    pub height: u32,
    pub description: &'static str,
}

pub const SCREENSHOTS: &[ScreenshotFixture] = &[
    ScreenshotFixture {
        filename: "login_form.png",
        width: 32,
        height: 24,
        description: "Small form, roughly 2KB encoded",
    },
    ScreenshotFixture {
        filename: "settings_page.png",
        width: 320,
        height: 240,
        description: "Medium settings page",
    },
    ScreenshotFixture {
        filename: "dashboard.png",
        width: 1280,
        height: 800,
        description: "Full desktop viewport",
    },
];

impl ScreenshotFixture {
    /// Encode the fixture as PNG. The pixel pattern keeps the encoder from
    /// collapsing the image to a few bytes.
    pub fn png_bytes(&self) -> Vec<u8> {
        let img = RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x ^ y) % 256) as u8])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .expect("PNG encoding failed");
        out.into_inner()
    }
}

pub fn small_screenshot() -> &'static ScreenshotFixture {
    &SCREENSHOTS[0]
}

/// The single button a scripted detector reports.
pub fn button_annotation() -> Annotation {
    Annotation {
        x: 10.0,
        y: 10.0,
        width: 20.0,
        height: 20.0,
        tag: Tag::Button,
    }
}

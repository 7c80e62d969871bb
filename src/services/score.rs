//! Password score meter: the strength percent and a gradient bar image.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{Value, json};
use std::io::Cursor;

use super::{ServiceError, ServiceResult, password::password_strength};

pub const DEFAULT_WIDTH: u32 = 60;
pub const DEFAULT_HEIGHT: u32 = 16;
const MAX_SIDE: u32 = 1000;

/// Column colors of the bar: red to yellow, then yellow to green, spread so
/// that a full score reaches green at the right edge. Columns past the
/// gradient stay black.
fn gradient(score: u32, width: u32) -> Vec<Rgb<u8>> {
    let width = width as usize;
    let step = f64::from(score) * 512.0 / 100.0 / width as f64;
    let mut columns = Vec::with_capacity(width);
    let mut level = 0.0;
    while level <= 255.0 && columns.len() < width {
        columns.push(Rgb([255, level as u8, 0]));
        level += step;
    }
    let mut level = 255.0;
    while level >= 0.0 && columns.len() < width {
        columns.push(Rgb([level as u8, 255, 0]));
        level -= step;
    }
    columns
}

/// PNG bar of `width` by `height` pixels for `score`.
pub fn score_image(score: u32, width: u32, height: u32) -> ServiceResult<Vec<u8>> {
    let width = width.clamp(1, MAX_SIDE);
    let height = height.clamp(1, MAX_SIDE);
    let mut image = RgbImage::new(width, height);
    for (x, color) in gradient(score.min(100), width).into_iter().enumerate() {
        for y in 0..height {
            image.put_pixel(x as u32, y, color);
        }
    }
    let mut png = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|err| ServiceError::internal(format!("Could not encode score image: {}", err)))?;
    Ok(png)
}

/// Score of `pass` against `min_score` with the meter inlined as a data URI.
pub fn score_report(pass: &str, min_score: u32, width: u32, height: u32) -> ServiceResult<Value> {
    let score = password_strength(pass);
    let image = score_image(score, width, height)?;
    Ok(json!({
        "score": format!("{}%", score),
        "image": format!("data:image/png;base64,{}", BASE64.encode(image)),
        "valid": if score >= min_score { "ok" } else { "ko" },
    }))
}

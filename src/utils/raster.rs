//! Binary raster operations used by the classical segmentation strategies

use image::{GrayImage, RgbImage};
use std::collections::VecDeque;

/// Boolean raster, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRaster {
    width: u32,
    height: u32,
    data: Vec<bool>,
}

impl BinaryRaster {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![false; width as usize * height as usize],
        }
    }

    #[must_use]
    pub fn from_fn<F: Fn(u32, u32) -> bool>(width: u32, height: u32, f: F) -> Self {
        let mut raster = Self::new(width, height);
        for y in 0..height {
            for x in 0..width {
                raster.set(x, y, f(x, y));
            }
        }
        raster
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height).then(|| y as usize * self.width as usize + x as usize)
    }

    /// Value at `(x, y)`; outside the raster reads as `false`
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.index(x, y)
            .and_then(|i| self.data.get(i).copied())
            .unwrap_or(false)
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        if let Some(cell) = self.index(x, y).and_then(|i| self.data.get_mut(i)) {
            *cell = value;
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    #[must_use]
    pub fn invert(&self) -> Self {
        Self {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|v| !v).collect(),
        }
    }

    /// Square-kernel dilation
    #[must_use]
    pub fn dilate(&self, radius: u32) -> Self {
        self.morph(radius, true)
    }

    /// Square-kernel erosion
    #[must_use]
    pub fn erode(&self, radius: u32) -> Self {
        self.morph(radius, false)
    }

    /// Dilate then erode: fills small holes
    #[must_use]
    pub fn close(&self, radius: u32) -> Self {
        self.dilate(radius).erode(radius)
    }

    /// Erode then dilate: removes specks
    #[must_use]
    pub fn open(&self, radius: u32) -> Self {
        self.erode(radius).dilate(radius)
    }

    fn morph(&self, radius: u32, dilate: bool) -> Self {
        if radius == 0 {
            return self.clone();
        }
        let r = i64::from(radius);
        Self::from_fn(self.width, self.height, |x, y| {
            let mut hit = !dilate;
            'scan: for dy in -r..=r {
                for dx in -r..=r {
                    let nx = i64::from(x) + dx;
                    let ny = i64::from(y) + dy;
                    let inside = nx >= 0
                        && ny >= 0
                        && nx < i64::from(self.width)
                        && ny < i64::from(self.height);
                    // Pixels outside the raster count as background for both operations
                    let value = inside && self.get(nx as u32, ny as u32);
                    if dilate && value {
                        hit = true;
                        break 'scan;
                    }
                    if !dilate && !value {
                        hit = false;
                        break 'scan;
                    }
                }
            }
            hit
        })
    }

    /// Pixels reachable from the border through `passable` pixels (4-connected)
    #[must_use]
    pub fn flood_from_border<F>(width: u32, height: u32, passable: F) -> Self
    where
        F: Fn(u32, u32) -> bool,
    {
        let mut reached = Self::new(width, height);
        let mut queue = VecDeque::new();

        let seed = |x: u32, y: u32, reached: &mut Self, queue: &mut VecDeque<(u32, u32)>| {
            if !reached.get(x, y) && passable(x, y) {
                reached.set(x, y, true);
                queue.push_back((x, y));
            }
        };

        for x in 0..width {
            seed(x, 0, &mut reached, &mut queue);
            seed(x, height.saturating_sub(1), &mut reached, &mut queue);
        }
        for y in 0..height {
            seed(0, y, &mut reached, &mut queue);
            seed(width.saturating_sub(1), y, &mut reached, &mut queue);
        }

        while let Some((x, y)) = queue.pop_front() {
            for (nx, ny) in neighbours(x, y, width, height) {
                seed(nx, ny, &mut reached, &mut queue);
            }
        }

        reached
    }

    /// Largest 4-connected set of `true` pixels
    #[must_use]
    pub fn largest_component(&self) -> Self {
        let mut visited = Self::new(self.width, self.height);
        let mut best: Vec<(u32, u32)> = Vec::new();

        for y in 0..self.height {
            for x in 0..self.width {
                if !self.get(x, y) || visited.get(x, y) {
                    continue;
                }

                let mut component = Vec::new();
                let mut queue = VecDeque::from([(x, y)]);
                visited.set(x, y, true);
                while let Some((cx, cy)) = queue.pop_front() {
                    component.push((cx, cy));
                    for (nx, ny) in neighbours(cx, cy, self.width, self.height) {
                        if self.get(nx, ny) && !visited.get(nx, ny) {
                            visited.set(nx, ny, true);
                            queue.push_back((nx, ny));
                        }
                    }
                }

                if component.len() > best.len() {
                    best = component;
                }
            }
        }

        let mut result = Self::new(self.width, self.height);
        for (x, y) in best {
            result.set(x, y, true);
        }
        result
    }

    /// 0/255 grayscale rendering
    #[must_use]
    pub fn to_gray(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            image::Luma([if self.get(x, y) { 255 } else { 0 }])
        })
    }
}

fn neighbours(x: u32, y: u32, width: u32, height: u32) -> impl Iterator<Item = (u32, u32)> {
    let candidates = [
        (x.checked_sub(1), Some(y)),
        (x.checked_add(1).filter(|&nx| nx < width), Some(y)),
        (Some(x), y.checked_sub(1)),
        (Some(x), y.checked_add(1).filter(|&ny| ny < height)),
    ];
    candidates
        .into_iter()
        .filter_map(|(nx, ny)| Some((nx?, ny?)))
}

/// Sobel gradient magnitude per pixel, row-major
#[must_use]
pub fn gradient_magnitude(gray: &GrayImage) -> Vec<f32> {
    let (width, height) = gray.dimensions();
    let sample = |x: i64, y: i64| -> f32 {
        let cx = x.clamp(0, i64::from(width) - 1) as u32;
        let cy = y.clamp(0, i64::from(height) - 1) as u32;
        f32::from(gray.get_pixel(cx, cy)[0])
    };

    let mut magnitudes = Vec::with_capacity(width as usize * height as usize);
    for y in 0..i64::from(height) {
        for x in 0..i64::from(width) {
            let gx = (sample(x + 1, y - 1) + 2.0 * sample(x + 1, y) + sample(x + 1, y + 1))
                - (sample(x - 1, y - 1) + 2.0 * sample(x - 1, y) + sample(x - 1, y + 1));
            let gy = (sample(x - 1, y + 1) + 2.0 * sample(x, y + 1) + sample(x + 1, y + 1))
                - (sample(x - 1, y - 1) + 2.0 * sample(x, y - 1) + sample(x + 1, y - 1));
            magnitudes.push((gx * gx + gy * gy).sqrt());
        }
    }
    magnitudes
}

/// Euclidean RGB distance
#[must_use]
pub fn color_distance(a: [u8; 3], b: [f32; 3]) -> f32 {
    let dr = f32::from(a[0]) - b[0];
    let dg = f32::from(a[1]) - b[1];
    let db = f32::from(a[2]) - b[2];
    (dr * dr + dg * dg + db * db).sqrt()
}

/// Pixels of the four `size` x `size` corner patches
#[must_use]
pub fn corner_pixels(image: &RgbImage, size: u32) -> Vec<[u8; 3]> {
    let (width, height) = image.dimensions();
    let size = size.clamp(1, width.min(height).max(1));
    let origins = [
        (0, 0),
        (width.saturating_sub(size), 0),
        (0, height.saturating_sub(size)),
        (width.saturating_sub(size), height.saturating_sub(size)),
    ];

    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for (ox, oy) in origins {
        for y in oy..(oy + size).min(height) {
            for x in ox..(ox + size).min(width) {
                pixels.push(image.get_pixel(x, y).0);
            }
        }
    }
    pixels
}

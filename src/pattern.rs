// src/pattern.rs - Raster pattern with palette and bounding box
use thiserror::Error;

pub const MAX_PATTERN_WIDTH: u32 = 400;
pub const MAX_PATTERN_HEIGHT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };
    pub const WHITE: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
}

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern dimensions {0}x{1} exceed limit of {MAX_PATTERN_WIDTH}x{MAX_PATTERN_HEIGHT}")]
    TooLarge(u32, u32),
    #[error("pattern dimensions {0}x{1} must be nonzero")]
    Empty(u32, u32),
    #[error("palette is full, at most 255 colors are supported")]
    PaletteFull,
    #[error("pattern has no foreground pixels")]
    NoForeground,
}

/// A row-major raster of palette indices. Index 0 is the transparent
/// background and is never present in the palette itself: palette slot
/// `n` holds the color for index `n + 1`.
#[derive(Debug, Clone)]
pub struct Pattern {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    palette: Vec<Rgb>,
    min_x: i32,
    max_x: i32,
    min_y: i32,
    max_y: i32,
}

impl Pattern {
    pub fn new(width: u32, height: u32) -> Result<Self, PatternError> {
        if width == 0 || height == 0 {
            return Err(PatternError::Empty(width, height));
        }
        if width > MAX_PATTERN_WIDTH || height > MAX_PATTERN_HEIGHT {
            return Err(PatternError::TooLarge(width, height));
        }
        Ok(Self {
            width,
            height,
            pixels: vec![0; (width * height) as usize],
            palette: Vec::new(),
            min_x: 0,
            max_x: -1,
            min_y: 0,
            max_y: -1,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn min_x(&self) -> i32 {
        self.min_x
    }

    pub fn max_x(&self) -> i32 {
        self.max_x
    }

    pub fn min_y(&self) -> i32 {
        self.min_y
    }

    pub fn max_y(&self) -> i32 {
        self.max_y
    }

    /// Color index at a coordinate, 0 (background) outside the raster.
    pub fn color_at(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        self.pixels[(y as u32 * self.width + x as u32) as usize]
    }

    pub fn set_index(&mut self, x: u32, y: u32, index: u8) {
        if x < self.width && y < self.height {
            self.pixels[(y * self.width + x) as usize] = index;
        }
    }

    /// Returns the palette index for a color, interning it if unseen.
    /// White maps to the background index 0.
    pub fn index_for_color(&mut self, color: Rgb) -> Result<u8, PatternError> {
        if color == Rgb::WHITE {
            return Ok(0);
        }
        if let Some(pos) = self.palette.iter().position(|&c| c == color) {
            return Ok(pos as u8 + 1);
        }
        if self.palette.len() >= 255 {
            return Err(PatternError::PaletteFull);
        }
        self.palette.push(color);
        Ok(self.palette.len() as u8)
    }

    /// Color behind a palette index; `None` for the background index
    /// and for indices the palette does not cover.
    pub fn palette_color(&self, index: u8) -> Option<Rgb> {
        if index == 0 {
            return None;
        }
        self.palette.get(index as usize - 1).copied()
    }

    pub fn used_colors(&self) -> usize {
        self.palette.len()
    }

    /// Recomputes the bounding box of all non-background pixels. An
    /// all-background pattern gets the empty box `(0, -1, 0, -1)`.
    pub fn update_min_max(&mut self) {
        let mut min_x = i32::MAX;
        let mut max_x = -1;
        let mut min_y = i32::MAX;
        let mut max_y = -1;
        for y in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                if self.color_at(x, y) != 0 {
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);
                }
            }
        }
        if max_x < 0 {
            self.min_x = 0;
            self.max_x = -1;
            self.min_y = 0;
            self.max_y = -1;
        } else {
            self.min_x = min_x;
            self.max_x = max_x;
            self.min_y = min_y;
            self.max_y = max_y;
        }
    }

    fn has_foreground(&self) -> bool {
        self.max_x >= 0
    }

    /// Overlays `new` onto `self` into a fresh pattern: non-background
    /// pixels of `new` win, old pixels survive where `new` is
    /// background. Neither input is mutated, so a failed merge leaves
    /// the active pattern intact.
    pub fn merge(&self, new: &Pattern) -> Result<Pattern, PatternError> {
        let width = self.width.max(new.width);
        let height = self.height.max(new.height);
        let mut merged = Pattern::new(width, height)?;
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                let (index, source) = match new.color_at(x, y) {
                    0 => (self.color_at(x, y), self),
                    index => (index, new),
                };
                if index == 0 {
                    continue;
                }
                let color = source
                    .palette_color(index)
                    .unwrap_or(Rgb::BLACK);
                let merged_index = merged.index_for_color(color)?;
                merged.set_index(x as u32, y as u32, merged_index);
            }
        }
        merged.update_min_max();
        Ok(merged)
    }

    /// Produces a new pattern exactly covering the non-background
    /// bounding box. Fails on an all-background pattern.
    pub fn trim(&self) -> Result<Pattern, PatternError> {
        let mut source = self.clone();
        source.update_min_max();
        if !source.has_foreground() {
            return Err(PatternError::NoForeground);
        }
        let width = (source.max_x - source.min_x + 1) as u32;
        let height = (source.max_y - source.min_y + 1) as u32;
        let mut trimmed = Pattern::new(width, height)?;
        trimmed.palette = source.palette.clone();
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                let index = source.color_at(x + source.min_x, y + source.min_y);
                trimmed.set_index(x as u32, y as u32, index);
            }
        }
        trimmed.update_min_max();
        Ok(trimmed)
    }
}

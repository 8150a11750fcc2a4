//! Affine pixel-to-geo transforms
//!
//! `geo_x = a*col + b*row + c`, `geo_y = d*col + e*row + f`, with pixel
//! `(0, 0)` at the top-left *corner* of the grid. World files use the centre of
//! the top-left pixel instead; conversion helpers handle the half-pixel shift.

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Six-coefficient affine transform between pixel and geo coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineGeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl AffineGeoTransform {
    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// North-up transform from the top-left corner and pixel size.
    ///
    /// `pixel_height` is the positive ground size; it is stored negated in `e`.
    pub fn north_up(left: f64, top: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self::new(pixel_width, 0.0, left, 0.0, -pixel_height, top)
    }

    /// Fails for zero resolution or non-finite coefficients
    pub fn validate(&self) -> Result<()> {
        let coefficients = [self.a, self.b, self.c, self.d, self.e, self.f];
        if coefficients.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidTransform(format!(
                "non-finite coefficient in {self:?}"
            )));
        }
        if self.a == 0.0 || self.e == 0.0 {
            return Err(Error::InvalidTransform(format!(
                "zero resolution (a={}, e={})",
                self.a, self.e
            )));
        }
        Ok(())
    }

    pub fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    /// Same resolution, re-anchored so local `(0, 0)` is `(origin_col, origin_row)`
    pub fn for_window(&self, origin_col: f64, origin_row: f64) -> Self {
        let (c, f) = self.pixel_to_geo(origin_col, origin_row);
        Self { c, f, ..*self }
    }

    /// Positive per-pixel ground size `(res_x, res_y)` for north-up rasters
    pub fn resolution(&self) -> (f64, f64) {
        (self.a.abs(), self.e.abs())
    }

    /// Extent of a `width x height` pixel block as `(left, bottom, right, top)`
    pub fn bounds(&self, width: f64, height: f64) -> (f64, f64, f64, f64) {
        let corners = [
            self.pixel_to_geo(0.0, 0.0),
            self.pixel_to_geo(width, 0.0),
            self.pixel_to_geo(0.0, height),
            self.pixel_to_geo(width, height),
        ];
        let mut bounds = (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            bounds.0 = bounds.0.min(x);
            bounds.1 = bounds.1.min(y);
            bounds.2 = bounds.2.max(x);
            bounds.3 = bounds.3.max(y);
        }
        bounds
    }

    /// World file body: `a, d, b, e` then the centre of the top-left pixel
    pub fn to_world_file(&self) -> String {
        let (center_x, center_y) = self.pixel_to_geo(0.5, 0.5);
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n",
            self.a, self.d, self.b, self.e, center_x, center_y
        )
    }

    /// Parse a world file back into a corner-anchored transform
    pub fn from_world_file(content: &str) -> Result<Self> {
        let values = content
            .split_whitespace()
            .map(|token| {
                token.parse::<f64>().map_err(|e| {
                    Error::InvalidInput(format!("world file value '{token}': {e}"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;

        let [a, d, b, e, center_x, center_y] = values[..] else {
            return Err(Error::InvalidInput(format!(
                "world file must contain 6 numbers, found {}",
                values.len()
            )));
        };

        // Shift from the pixel centre back to the pixel corner
        let c = center_x - 0.5 * a - 0.5 * b;
        let f = center_y - 0.5 * d - 0.5 * e;
        let transform = Self::new(a, b, c, d, e, f);
        transform.validate()?;
        Ok(transform)
    }
}

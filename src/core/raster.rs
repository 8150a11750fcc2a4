//! Raster access for the tiler
//!
//! [`RasterSource`] is the narrow interface the tiler needs from a raster
//! decoder: dimensions, georeferencing and boundless window reads. The GeoTIFF
//! decoder loads the whole image into an [`InMemoryRaster`].

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use crate::core::error::{Error, Result};
use crate::core::transform::AffineGeoTransform;

const GEOKEY_RASTER_TYPE: u32 = 1025;
const GEOKEY_GEOGRAPHIC_TYPE: u32 = 2048;
const GEOKEY_PROJECTED_CS_TYPE: u32 = 3072;
const RASTER_PIXEL_IS_POINT: u32 = 2;
// 32767 is the GeoTIFF "user-defined" sentinel
const GEOKEY_USER_DEFINED: u32 = 32767;

/// Coordinate reference system identifier such as `EPSG:32635`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Crs(String);

impl Crs {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    pub fn from_epsg(code: u32) -> Self {
        Self(format!("EPSG:{code}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// EPSG code when the identifier is `EPSG:<n>` or an OGC URN
    pub fn epsg(&self) -> Option<u32> {
        let id = self.0.trim();
        if let Some(code) = id.strip_prefix("EPSG:") {
            return code.trim().parse().ok();
        }
        id.strip_prefix("urn:ogc:def:crs:EPSG::")
            .and_then(|code| code.parse().ok())
    }

    /// Name used in the GeoJSON `crs` member
    pub fn to_urn(&self) -> String {
        match self.epsg() {
            Some(code) => format!("urn:ogc:def:crs:EPSG::{code}"),
            None => self.0.clone(),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Interleaved 8-bit pixel block returned by a window read
#[derive(Debug, Clone, PartialEq)]
pub struct PixelWindow {
    pub width: u32,
    pub height: u32,
    pub bands: usize,
    pub data: Vec<u8>,
}

impl PixelWindow {
    /// Normalize to interleaved RGB.
    ///
    /// One band is replicated three times, two bands (gray + alpha) keep the
    /// gray channel, more than three bands keep the first three.
    pub fn to_rgb(&self) -> Vec<u8> {
        let pixels = self.width as usize * self.height as usize;
        let mut rgb = Vec::with_capacity(pixels * 3);
        for chunk in self.data.chunks_exact(self.bands.max(1)) {
            match self.bands {
                0 => {}
                1 | 2 => rgb.extend_from_slice(&[chunk[0], chunk[0], chunk[0]]),
                _ => rgb.extend_from_slice(&chunk[..3]),
            }
        }
        rgb
    }
}

/// What the tiler needs from a raster decoder
pub trait RasterSource {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn band_count(&self) -> usize;

    /// Corner-anchored pixel-to-geo transform of the full raster
    fn transform(&self) -> AffineGeoTransform;

    fn crs(&self) -> Option<&Crs>;

    /// Read a `width x height` block at `(x, y)`; pixels outside the raster are `fill`
    fn read_window(&self, x: i64, y: i64, width: u32, height: u32, fill: u8) -> Result<PixelWindow>;
}

/// Fully decoded raster held in memory
#[derive(Debug, Clone)]
pub struct InMemoryRaster {
    width: u32,
    height: u32,
    bands: usize,
    data: Vec<u8>,
    transform: AffineGeoTransform,
    crs: Option<Crs>,
}

impl InMemoryRaster {
    pub fn new(
        width: u32,
        height: u32,
        bands: usize,
        data: Vec<u8>,
        transform: AffineGeoTransform,
        crs: Option<Crs>,
    ) -> Result<Self> {
        if bands == 0 {
            return Err(Error::RasterError("raster has no bands".to_string()));
        }
        let expected = width as usize * height as usize * bands;
        if data.len() != expected {
            return Err(Error::RasterError(format!(
                "expected {expected} samples for {width}x{height}x{bands}, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            bands,
            data,
            transform,
            crs,
        })
    }
}

impl RasterSource for InMemoryRaster {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn band_count(&self) -> usize {
        self.bands
    }

    fn transform(&self) -> AffineGeoTransform {
        self.transform
    }

    fn crs(&self) -> Option<&Crs> {
        self.crs.as_ref()
    }

    fn read_window(&self, x: i64, y: i64, width: u32, height: u32, fill: u8) -> Result<PixelWindow> {
        let bands = self.bands;
        let mut data = vec![fill; width as usize * height as usize * bands];

        // Intersection of the requested window with the raster
        let x0 = x.max(0);
        let y0 = y.max(0);
        let x1 = (x + width as i64).min(self.width as i64);
        let y1 = (y + height as i64).min(self.height as i64);

        if x0 < x1 && y0 < y1 {
            let span = (x1 - x0) as usize * bands;
            for src_row in y0..y1 {
                let src_start = (src_row as usize * self.width as usize + x0 as usize) * bands;
                let dst_row = (src_row - y) as usize;
                let dst_start = (dst_row * width as usize + (x0 - x) as usize) * bands;
                data[dst_start..dst_start + span]
                    .copy_from_slice(&self.data[src_start..src_start + span]);
            }
        }

        Ok(PixelWindow {
            width,
            height,
            bands,
            data,
        })
    }
}

/// Decode a GeoTIFF into memory with its georeferencing.
///
/// The transform comes from `ModelTransformationTag`, or from
/// `ModelPixelScaleTag` + `ModelTiepointTag`, or from a `.tfw` world file
/// next to the raster. The CRS comes from the GeoKey directory.
pub fn open_raster(path: &Path) -> Result<InMemoryRaster> {
    info!("Opening raster: {}", path.display());
    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file))?;
    let (width, height) = decoder.dimensions()?;

    let geo_keys = read_geo_keys(&mut decoder)?;
    let transform = match read_tiff_transform(&mut decoder, &geo_keys)? {
        Some(transform) => transform,
        None => read_sidecar_transform(path)?,
    };
    transform.validate()?;

    let crs = crs_from_geo_keys(&geo_keys);
    if crs.is_none() {
        warn!("No EPSG code in {}; tiles will carry no CRS", path.display());
    }

    let pixels = width as usize * height as usize;
    let data = match decoder.read_image()? {
        DecodingResult::U8(buf) => buf,
        // 16-bit scans are reduced to their high byte
        DecodingResult::U16(buf) => buf.into_iter().map(|v| (v >> 8) as u8).collect(),
        _ => {
            return Err(Error::RasterError(format!(
                "unsupported sample format in {}",
                path.display()
            )))
        }
    };
    if pixels == 0 || data.len() % pixels != 0 {
        return Err(Error::RasterError(format!(
            "cannot derive band count from {} samples for {width}x{height}",
            data.len()
        )));
    }
    let bands = data.len() / pixels;

    debug!(
        "Raster {}: {width}x{height}, {bands} bands, transform {transform:?}",
        path.display()
    );
    InMemoryRaster::new(width, height, bands, data, transform, crs)
}

fn read_geo_keys(decoder: &mut Decoder<BufReader<File>>) -> Result<Vec<(u32, u32)>> {
    let Some(value) = decoder.find_tag(Tag::GeoKeyDirectoryTag)? else {
        return Ok(Vec::new());
    };
    let raw = value.into_u32_vec()?;
    Ok(parse_geo_key_directory(&raw))
}

/// Inline `(key, value)` pairs of a GeoKey directory; keys stored in other tags are skipped
fn parse_geo_key_directory(raw: &[u32]) -> Vec<(u32, u32)> {
    if raw.len() < 4 {
        return Vec::new();
    }
    let count = raw[3] as usize;
    raw[4..]
        .chunks_exact(4)
        .take(count)
        .filter(|entry| entry[1] == 0)
        .map(|entry| (entry[0], entry[3]))
        .collect()
}

fn crs_from_geo_keys(keys: &[(u32, u32)]) -> Option<Crs> {
    let lookup = |wanted: u32| {
        keys.iter()
            .find(|(key, value)| *key == wanted && *value != GEOKEY_USER_DEFINED && *value != 0)
            .map(|(_, value)| *value)
    };
    lookup(GEOKEY_PROJECTED_CS_TYPE)
        .or_else(|| lookup(GEOKEY_GEOGRAPHIC_TYPE))
        .map(Crs::from_epsg)
}

fn read_tiff_transform(
    decoder: &mut Decoder<BufReader<File>>,
    geo_keys: &[(u32, u32)],
) -> Result<Option<AffineGeoTransform>> {
    if let Some(value) = decoder.find_tag(Tag::ModelTransformationTag)? {
        let m = value.into_f64_vec()?;
        if m.len() >= 8 {
            return Ok(Some(AffineGeoTransform::new(m[0], m[1], m[3], m[4], m[5], m[7])));
        }
    }

    let scale = decoder.find_tag(Tag::ModelPixelScaleTag)?;
    let tiepoint = decoder.find_tag(Tag::ModelTiepointTag)?;
    let (Some(scale), Some(tiepoint)) = (scale, tiepoint) else {
        return Ok(None);
    };
    let scale = scale.into_f64_vec()?;
    let tiepoint = tiepoint.into_f64_vec()?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(Error::RasterError(
            "truncated GeoTIFF tie point or pixel scale".to_string(),
        ));
    }

    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    let mut transform = AffineGeoTransform::new(
        scale[0],
        0.0,
        x - i * scale[0],
        0.0,
        -scale[1],
        y + j * scale[1],
    );

    let pixel_is_point = geo_keys
        .iter()
        .any(|(key, value)| *key == GEOKEY_RASTER_TYPE && *value == RASTER_PIXEL_IS_POINT);
    if pixel_is_point {
        // Tie point refers to the pixel centre; move it to the corner
        transform = transform.for_window(-0.5, -0.5);
    }
    Ok(Some(transform))
}

fn read_sidecar_transform(path: &Path) -> Result<AffineGeoTransform> {
    for extension in ["tfw", "tifw", "wld"] {
        let sidecar = path.with_extension(extension);
        if sidecar.exists() {
            debug!("Using world file {}", sidecar.display());
            let content = std::fs::read_to_string(&sidecar)?;
            return AffineGeoTransform::from_world_file(&content);
        }
    }
    Err(Error::RasterError(format!(
        "{} has no GeoTIFF transform and no world file",
        path.display()
    )))
}

use crate::types::{DataType, GeoTransform, MosaicError, MosaicResult, Pixel, RasterBlock, RasterSource};
use gdal::raster::{Buffer, GdalType};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use ndarray::{s, Array3, Axis};
use std::path::Path;

/// Pixel window in a raster's own grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub x_offset: usize,
    pub y_offset: usize,
    pub x_size: usize,
    pub y_size: usize,
}

impl PixelWindow {
    pub fn new(x_offset: usize, y_offset: usize, x_size: usize, y_size: usize) -> Self {
        Self { x_offset, y_offset, x_size, y_size }
    }

    pub fn is_empty(&self) -> bool {
        self.x_size == 0 || self.y_size == 0
    }

    fn fits(&self, width: usize, height: usize) -> bool {
        self.x_offset + self.x_size <= width && self.y_offset + self.y_size <= height
    }
}

impl RasterSource {
    /// Read `band_count` bands of `window`, resampled (nearest neighbour) to `out_size`.
    ///
    /// Returns the pixels and each band's own nodata value, if it declares one.
    pub fn read_window(
        &self,
        window: &PixelWindow,
        out_size: (usize, usize),
        band_count: usize,
    ) -> MosaicResult<(RasterBlock, Vec<Option<f64>>)> {
        match self {
            RasterSource::Gdal(path) => read_gdal_window(path, window, out_size, band_count),
            RasterSource::InMemory { data, nodata } => {
                let block = read_memory_window(data, window, out_size, band_count)?;
                Ok((block, vec![*nodata; band_count]))
            }
        }
    }
}

fn read_gdal_window(
    path: &Path,
    window: &PixelWindow,
    out_size: (usize, usize),
    band_count: usize,
) -> MosaicResult<(RasterBlock, Vec<Option<f64>>)> {
    let dataset = Dataset::open(path)
        .map_err(|e| MosaicError::RasterIo(format!("Cannot open {}: {}", path.display(), e)))?;

    let (width, height) = dataset.raster_size();
    if !window.fits(width, height) {
        return Err(MosaicError::RasterIo(format!(
            "Window {:?} exceeds raster {} of {}x{} pixels",
            window,
            path.display(),
            width,
            height
        )));
    }

    let available = dataset.raster_count() as usize;
    if available < band_count {
        return Err(MosaicError::RasterIo(format!(
            "{} has {} bands, mosaic expects {}",
            path.display(),
            available,
            band_count
        )));
    }

    let (out_w, out_h) = out_size;
    let mut block = Array3::<Pixel>::zeros((band_count, out_h, out_w));
    let mut nodata = Vec::with_capacity(band_count);

    for band_no in 0..band_count {
        let band = dataset
            .rasterband(band_no as isize + 1)
            .map_err(|e| MosaicError::RasterIo(format!("{} band {}: {}", path.display(), band_no + 1, e)))?;

        let buffer = band
            .read_as::<Pixel>(
                (window.x_offset as isize, window.y_offset as isize),
                (window.x_size, window.y_size),
                (out_w, out_h),
                None,
            )
            .map_err(|e| MosaicError::RasterIo(format!("Read from {} failed: {}", path.display(), e)))?;

        let plane = ndarray::Array2::from_shape_vec((out_h, out_w), buffer.data)
            .map_err(|e| MosaicError::RasterIo(format!("Failed to reshape band data: {}", e)))?;
        block.index_axis_mut(Axis(0), band_no).assign(&plane);
        nodata.push(band.no_data_value());
    }

    Ok((block, nodata))
}

fn read_memory_window(
    data: &RasterBlock,
    window: &PixelWindow,
    out_size: (usize, usize),
    band_count: usize,
) -> MosaicResult<RasterBlock> {
    let (bands, rows, cols) = data.dim();
    if !window.fits(cols, rows) {
        return Err(MosaicError::RasterIo(format!(
            "Window {:?} exceeds in-memory raster of {}x{} pixels",
            window, cols, rows
        )));
    }
    if bands < band_count {
        return Err(MosaicError::RasterIo(format!(
            "In-memory raster has {} bands, mosaic expects {}",
            bands, band_count
        )));
    }

    let (out_w, out_h) = out_size;
    if (out_w, out_h) == (window.x_size, window.y_size) {
        let view = data.slice(s![
            ..band_count,
            window.y_offset..window.y_offset + window.y_size,
            window.x_offset..window.x_offset + window.x_size
        ]);
        return Ok(view.to_owned());
    }

    // Nearest neighbour: sample the source pixel under each output pixel centre
    let sample = |out: usize, out_len: usize, offset: usize, len: usize| -> usize {
        let pos = ((out as f64 + 0.5) * len as f64 / out_len as f64).floor() as usize;
        offset + pos.min(len - 1)
    };

    Ok(Array3::from_shape_fn((band_count, out_h, out_w), |(b, r, c)| {
        let src_row = sample(r, out_h, window.y_offset, window.y_size);
        let src_col = sample(c, out_w, window.x_offset, window.x_size);
        data[[b, src_row, src_col]]
    }))
}

/// Conversion from working pixels to a band's storage type
trait StoredPixel: GdalType + Copy {
    fn from_pixel(value: Pixel) -> Self;
}

macro_rules! stored_pixel {
    (int: $($t:ty),*) => {$(
        impl StoredPixel for $t {
            // `as` saturates at the type bounds and maps NaN to 0
            fn from_pixel(value: Pixel) -> Self {
                value.round() as $t
            }
        }
    )*};
    (float: $($t:ty),*) => {$(
        impl StoredPixel for $t {
            fn from_pixel(value: Pixel) -> Self {
                value as $t
            }
        }
    )*};
}

stored_pixel!(int: u8, u16, i16, u32, i32);
stored_pixel!(float: f32, f64);

/// Write a multi-band block as a GeoTIFF with `data_type` bands
pub fn write_geotiff<P: AsRef<Path>>(
    path: P,
    block: &RasterBlock,
    transform: &GeoTransform,
    srid: u32,
    nodata: &[Pixel],
    data_type: DataType,
) -> MosaicResult<()> {
    let path = path.as_ref();
    match data_type {
        DataType::Byte => write_typed::<u8>(path, block, transform, srid, nodata),
        DataType::UInt16 => write_typed::<u16>(path, block, transform, srid, nodata),
        DataType::Int16 => write_typed::<i16>(path, block, transform, srid, nodata),
        DataType::UInt32 => write_typed::<u32>(path, block, transform, srid, nodata),
        DataType::Int32 => write_typed::<i32>(path, block, transform, srid, nodata),
        DataType::Float32 => write_typed::<f32>(path, block, transform, srid, nodata),
        DataType::Float64 => write_typed::<f64>(path, block, transform, srid, nodata),
    }
}

fn write_typed<T: StoredPixel>(
    path: &Path,
    block: &RasterBlock,
    transform: &GeoTransform,
    srid: u32,
    nodata: &[Pixel],
) -> MosaicResult<()> {
    let (bands, height, width) = block.dim();
    let fail = |e: gdal::errors::GdalError| {
        MosaicError::RasterIo(format!("Cannot write {}: {}", path.display(), e))
    };

    log::debug!("Writing {}x{}x{} tile to {}", bands, width, height, path.display());

    let driver = DriverManager::get_driver_by_name("GTiff").map_err(fail)?;
    let mut dataset = driver
        .create_with_band_type::<T, _>(path, width as isize, height as isize, bands as isize)
        .map_err(fail)?;

    dataset.set_geo_transform(&transform.to_gdal()).map_err(fail)?;
    let srs = SpatialRef::from_epsg(srid).map_err(fail)?;
    dataset.set_spatial_ref(&srs).map_err(fail)?;

    for (band_no, plane) in block.axis_iter(Axis(0)).enumerate() {
        let mut band = dataset.rasterband(band_no as isize + 1).map_err(fail)?;
        let buffer = Buffer::new((width, height), plane.iter().map(|&v| T::from_pixel(v)).collect());
        band.write((0, 0), (width, height), &buffer).map_err(fail)?;
        if let Some(value) = nodata.get(band_no) {
            band.set_no_data_value(Some(*value as f64)).map_err(fail)?;
        }
    }

    Ok(())
}

/// Read every pixel of the first `band_count` bands of a raster file
pub fn read_raster<P: AsRef<Path>>(path: P, band_count: usize) -> MosaicResult<RasterBlock> {
    let path = path.as_ref();
    let (width, height) = Dataset::open(path)
        .map_err(|e| MosaicError::RasterIo(format!("Cannot open {}: {}", path.display(), e)))?
        .raster_size();

    let (block, _) = read_gdal_window(
        path,
        &PixelWindow::new(0, 0, width, height),
        (width, height),
        band_count,
    )?;
    Ok(block)
}

//! Python bindings for the coverage server's metadata layer

use crate::core::{make_mosaic, Footprint};
use crate::types::{BandInfo, DataType, Dataset, Extent, Mosaic, MosaicConfig, MosaicError, RasterSource};
use chrono::{DateTime, Utc};
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

fn to_py_err(e: MosaicError) -> PyErr {
    match e {
        MosaicError::Io(_) | MosaicError::RasterIo(_) => PyIOError::new_err(e.to_string()),
        MosaicError::InvalidConfig(_) => PyValueError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

/// Python wrapper for a linked dataset
#[pyclass(name = "Dataset")]
#[derive(Clone)]
struct PyDataset {
    inner: Dataset,
}

#[pymethods]
impl PyDataset {
    #[new]
    #[pyo3(signature = (id, path, footprint_wkt, begin_time, extent, size, srid, footprint_srid = 4326))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: String,
        path: String,
        footprint_wkt: &str,
        begin_time: &str,
        extent: (f64, f64, f64, f64),
        size: (usize, usize),
        srid: u32,
        footprint_srid: u32,
    ) -> PyResult<Self> {
        let begin_time = DateTime::parse_from_rfc3339(begin_time)
            .map_err(|e| PyValueError::new_err(format!("Invalid begin time '{}': {}", begin_time, e)))?
            .with_timezone(&Utc);
        let footprint = Footprint::from_wkt(footprint_wkt, footprint_srid).map_err(to_py_err)?;

        Ok(PyDataset {
            inner: Dataset {
                id,
                footprint,
                begin_time,
                source: RasterSource::gdal(path),
                extent: Extent::new(extent.0, extent.1, extent.2, extent.3),
                size,
                srid,
            },
        })
    }

    #[getter]
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn __repr__(&self) -> String {
        format!("Dataset('{}', {})", self.inner.id, self.inner.source.describe())
    }
}

/// Rebuild a mosaic and return the path of its new tile index
#[pyfunction]
#[pyo3(signature = (mosaic_id, srid, extent, size, bands, storage_dir, datasets, tile_index_path = None, tile_edge = 256, nodata_value = 0.0, data_type = "Float32"))]
#[allow(clippy::too_many_arguments)]
fn generate_mosaic(
    py: Python<'_>,
    mosaic_id: String,
    srid: u32,
    extent: (f64, f64, f64, f64),
    size: (usize, usize),
    bands: Vec<(String, Option<f64>)>,
    storage_dir: String,
    datasets: Vec<PyRef<PyDataset>>,
    tile_index_path: Option<String>,
    tile_edge: usize,
    nodata_value: f32,
    data_type: &str,
) -> PyResult<String> {
    let data_type: DataType = data_type.parse().map_err(to_py_err)?;
    let mut mosaic = Mosaic::new(
        mosaic_id,
        srid,
        Extent::new(extent.0, extent.1, extent.2, extent.3),
        size,
        bands.into_iter().map(|(name, nodata)| BandInfo::new(name, nodata)).collect(),
        storage_dir,
    )
    .with_data_type(data_type);
    if let Some(path) = tile_index_path {
        mosaic = mosaic.with_tile_index_path(path);
    }
    mosaic.datasets = datasets.iter().map(|d| d.inner.clone()).collect();

    let config = MosaicConfig {
        tile_edge,
        nodata_value,
        ..MosaicConfig::default()
    };

    let report = py
        .allow_threads(|| make_mosaic(&mut mosaic, &mut (), config))
        .map_err(to_py_err)?;
    Ok(report.tile_index_path.display().to_string())
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyDataset>()?;
    m.add_function(wrap_pyfunction!(generate_mosaic, m)?)?;
    Ok(())
}

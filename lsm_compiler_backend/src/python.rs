//! Python bindings, built with the `python` feature.
//!
//! Exposes the compiler to acquisition notebooks: `synthesize(...)` returns the interleaved board
//! buffer as a `numpy.uint16` array together with its sample rate, `calc_signal(...)` returns the
//! `(4, n)` voltage array for plotting.

use numpy::PyArray;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::error::SynthesisError;
use crate::params::{GalvoScan, ImagingParameters};
use crate::sweep::SweepProgram;

impl From<SynthesisError> for PyErr {
    fn from(err: SynthesisError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

/// Galvo scans are given directly in volts: range and offset with unit calibration.
#[allow(clippy::too_many_arguments)]
fn params_from_volts(
    v1_range: f64,
    v1_offset: f64,
    v2_range: f64,
    v2_offset: f64,
    fps: u32,
    vps: f64,
    laser_index: u32,
    trigger_active: bool,
    points_per_ramp: u32,
) -> ImagingParameters {
    let volts = |range_um, offset_um| GalvoScan {
        range_um,
        offset_um,
        volts_per_degree: 1.,
        degrees_per_um: 1.,
    };
    ImagingParameters {
        galvo1: volts(v1_range, v1_offset),
        galvo2: volts(v2_range, v2_offset),
        fps,
        vps,
        laser_index,
        trigger_active,
        points_per_ramp,
    }
}

#[pyfunction]
#[allow(clippy::too_many_arguments)]
fn synthesize(
    py: Python,
    v1_range: f64,
    v1_offset: f64,
    v2_range: f64,
    v2_offset: f64,
    fps: u32,
    vps: f64,
    laser_index: u32,
    trigger_active: bool,
    points_per_ramp: u32,
) -> PyResult<(PyObject, u32)> {
    let params = params_from_volts(
        v1_range, v1_offset, v2_range, v2_offset, fps, vps, laser_index, trigger_active,
        points_per_ramp,
    );
    let sweep = SweepProgram::new(&params)?.compile();
    let rate = sweep.sample_rate;
    Ok((PyArray::from_vec(py, sweep.buffer.into_vec()).to_object(py), rate))
}

#[pyfunction]
#[allow(clippy::too_many_arguments)]
fn calc_signal(
    py: Python,
    v1_range: f64,
    v1_offset: f64,
    v2_range: f64,
    v2_offset: f64,
    fps: u32,
    vps: f64,
    laser_index: u32,
    trigger_active: bool,
    points_per_ramp: u32,
) -> PyResult<PyObject> {
    let params = params_from_volts(
        v1_range, v1_offset, v2_range, v2_offset, fps, vps, laser_index, trigger_active,
        points_per_ramp,
    );
    let arr = SweepProgram::new(&params)?.calc_signal();
    Ok(PyArray::from_array(py, &arr).to_object(py))
}

#[pymodule]
fn lsm_compiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(synthesize, m)?)?;
    m.add_function(wrap_pyfunction!(calc_signal, m)?)?;
    Ok(())
}

//! Minimal wrapper for the Mad City Labs MicroDrive library driving the XY stage.
//!
//! Status codes pass through [`mcl_call`] and come back as [`McoError`]. Distances are in mm and
//! velocities in mm/s, as the library expects. Built with the `mcl_hardware` feature.

use crate::driver::{Axis, StageDriver, StageInfo};
use crate::error::McoError;

type CInt = libc::c_int;
type CUint = libc::c_uint;
type CDouble = libc::c_double;
type CUshort = libc::c_ushort;

/// Unused third axis of `MCL_MDMoveThreeAxes`.
const AXIS_Z: CUint = 3;

#[link(name = "MicroDrive")]
extern "system" {
    fn MCL_InitHandle() -> CInt;
    fn MCL_ReleaseHandle(handle: CInt);
    fn MCL_GetSerialNumber(handle: CInt) -> CInt;
    fn MCL_MDInformation(
        encoderResolution: *mut CDouble,
        stepSize: *mut CDouble,
        maxVelocity: *mut CDouble,
        maxVelocityTwoAxis: *mut CDouble,
        maxVelocityThreeAxis: *mut CDouble,
        minVelocity: *mut CDouble,
        handle: CInt,
    ) -> CInt;
    fn MCL_MDMove(axis: CUint, velocity: CDouble, distance: CDouble, handle: CInt) -> CInt;
    fn MCL_MDMoveThreeAxes(
        axis1: CUint,
        velocity1: CDouble,
        distance1: CDouble,
        axis2: CUint,
        velocity2: CDouble,
        distance2: CDouble,
        axis3: CUint,
        velocity3: CDouble,
        distance3: CDouble,
        handle: CInt,
    ) -> CInt;
    fn MCL_MicroDriveWait(handle: CInt) -> CInt;
    fn MCL_MDCurrentPositionM(axis: CUint, microSteps: *mut CInt, handle: CInt) -> CInt;
    fn MCL_MDStop(status: *mut CUshort, handle: CInt) -> CInt;
}

pub fn mcl_call<F: FnOnce() -> CInt>(func: F) -> Result<(), McoError> {
    match McoError::from_code(func()) {
        None => Ok(()),
        Some(err) => {
            tracing::error!("MicroDrive call failed: {}", err);
            Err(err)
        }
    }
}

pub struct MicroDriveDriver;

impl StageDriver for MicroDriveDriver {
    fn init_handle(&self) -> i32 {
        unsafe { MCL_InitHandle() }
    }

    fn release_handle(&self, handle: i32) {
        unsafe { MCL_ReleaseHandle(handle) }
    }

    fn serial_number(&self, handle: i32) -> i32 {
        unsafe { MCL_GetSerialNumber(handle) }
    }

    fn info(&self, handle: i32) -> Result<StageInfo, McoError> {
        let (mut encoder, mut step, mut max_v, mut max_v2, mut max_v3, mut min_v) =
            (0., 0., 0., 0., 0., 0.);
        mcl_call(|| unsafe {
            MCL_MDInformation(
                &mut encoder,
                &mut step,
                &mut max_v,
                &mut max_v2,
                &mut max_v3,
                &mut min_v,
                handle,
            )
        })?;
        Ok(StageInfo {
            encoder_resolution_um: encoder,
            microstep_mm: step,
            max_velocity: max_v,
            max_velocity_two_axis: max_v2,
            min_velocity: min_v,
        })
    }

    fn move_axis(
        &self,
        handle: i32,
        axis: Axis,
        velocity: f64,
        distance_mm: f64,
    ) -> Result<(), McoError> {
        mcl_call(|| unsafe { MCL_MDMove(axis.index(), velocity, distance_mm, handle) })
    }

    fn move_two_axes(
        &self,
        handle: i32,
        velocity: f64,
        y_mm: f64,
        x_mm: f64,
    ) -> Result<(), McoError> {
        mcl_call(|| unsafe {
            MCL_MDMoveThreeAxes(
                Axis::X.index(),
                velocity,
                x_mm,
                Axis::Y.index(),
                velocity,
                y_mm,
                AXIS_Z,
                velocity,
                0.,
                handle,
            )
        })
    }

    fn wait(&self, handle: i32) -> Result<(), McoError> {
        mcl_call(|| unsafe { MCL_MicroDriveWait(handle) })
    }

    fn position_microsteps(&self, handle: i32, axis: Axis) -> Result<i32, McoError> {
        let mut steps: CInt = 0;
        mcl_call(|| unsafe { MCL_MDCurrentPositionM(axis.index(), &mut steps, handle) })?;
        Ok(steps)
    }

    fn stop(&self, handle: i32) -> Result<(), McoError> {
        let mut status: CUshort = 0;
        mcl_call(|| unsafe { MCL_MDStop(&mut status, handle) })
    }
}

//! Minimal wrapper for the parts of the MCC Universal Library (`cbw64`) the analog-output
//! session uses.
//!
//! Every C call goes through [`ul_call`], which turns a nonzero return code into a [`UlError`]
//! carrying the library's own message. [`UlDriver`] implements [`DaqDriver`] on top of these
//! calls. Built with the `mcc_hardware` feature.

use parking_lot::Mutex;

use crate::driver::{BoardDescriptor, DaqDriver, MemHandle, ScanRequest};
use crate::error::{UlError, UL_ALLOC_FAILED, UL_BADBOARD};

type CInt = libc::c_int;
type CUint = libc::c_uint;
type CLong = libc::c_long;
type CShort = libc::c_short;
type CUshort = libc::c_ushort;
type CChar = libc::c_char;
type HGlobal = *mut libc::c_void;

pub const NOERRORS: CInt = 0;
pub const ERRSTRLEN: usize = 256;
pub const USB_IFC: CInt = 1;
pub const BOARDINFO: CInt = 1;
pub const BINUMDACHANS: CInt = 13;
pub const BIP10VOLTS: CInt = 1;
pub const AOFUNCTION: CInt = 2;
pub const RUNNING: CShort = 1;
pub const BACKGROUND: CInt = 0x0001;
pub const CONTINUOUS: CInt = 0x0002;
pub const SIMULTANEOUS: CInt = 0x0200;
const MAX_INVENTORY: usize = 16;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct DaqDeviceDescriptor {
    product_name: [CChar; 64],
    product_id: CUint,
    interface_type: CInt,
    dev_string: [CChar; 64],
    unique_id: [CChar; 64],
    nuid: u64,
    reserved: [CChar; 512],
}

impl DaqDeviceDescriptor {
    fn zeroed() -> Self {
        Self {
            product_name: [0; 64],
            product_id: 0,
            interface_type: 0,
            dev_string: [0; 64],
            unique_id: [0; 64],
            nuid: 0,
            reserved: [0; 512],
        }
    }

    fn descriptor(&self) -> BoardDescriptor {
        BoardDescriptor {
            product_name: c_text(&self.product_name),
            unique_id: c_text(&self.unique_id),
        }
    }
}

/// Text of a NUL-padded fixed-size field.
fn c_text(buf: &[CChar]) -> String {
    let bytes: Vec<u8> = buf.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[link(name = "cbw64")]
extern "system" {
    fn cbIgnoreInstaCal() -> CInt;
    fn cbGetErrMsg(errCode: CInt, errMsg: *mut CChar) -> CInt;
    fn cbGetDaqDeviceInventory(
        interfaceType: CInt,
        inventory: *mut DaqDeviceDescriptor,
        numberOfDevices: *mut CInt,
    ) -> CInt;
    fn cbCreateDaqDevice(boardNum: CInt, deviceDescriptor: DaqDeviceDescriptor) -> CInt;
    fn cbReleaseDaqDevice(boardNum: CInt) -> CInt;
    fn cbGetConfig(
        infoType: CInt,
        boardNum: CInt,
        devNum: CInt,
        configItem: CInt,
        configVal: *mut CInt,
    ) -> CInt;

    fn cbWinBufAlloc(numPoints: CLong) -> HGlobal;
    fn cbWinArrayToBuf(
        dataArray: *mut CUshort,
        memHandle: HGlobal,
        firstPoint: CLong,
        count: CLong,
    ) -> CInt;
    fn cbWinBufFree(memHandle: HGlobal) -> CInt;

    fn cbAOutScan(
        boardNum: CInt,
        lowChan: CInt,
        highChan: CInt,
        count: CLong,
        rate: *mut CLong,
        range: CInt,
        memHandle: HGlobal,
        options: CInt,
    ) -> CInt;
    fn cbStopBackground(boardNum: CInt, functionType: CInt) -> CInt;
    fn cbAOut(boardNum: CInt, chan: CInt, range: CInt, dataValue: CUshort) -> CInt;
    fn cbGetStatus(
        boardNum: CInt,
        status: *mut CShort,
        curCount: *mut CLong,
        curIndex: *mut CLong,
        functionType: CInt,
    ) -> CInt;
}

/// Calls a Universal Library function and converts its return code.
///
/// A nonzero code is looked up with `cbGetErrMsg` and returned as a [`UlError`]; the caller
/// decides whether the session survives it.
pub fn ul_call<F: FnOnce() -> CInt>(func: F) -> Result<(), UlError> {
    let code = func();
    if code == NOERRORS {
        return Ok(());
    }
    let mut err_buff = [0 as CChar; ERRSTRLEN];
    unsafe {
        cbGetErrMsg(code, err_buff.as_mut_ptr());
    }
    let message = c_text(&err_buff);
    tracing::error!("UL error {}: {}", code, message);
    Err(UlError::new(code, message))
}

fn to_hglobal(memhandle: MemHandle) -> HGlobal {
    memhandle as HGlobal
}

/// Universal Library backed [`DaqDriver`].
///
/// Keeps the raw descriptors of the last inventory, since `cbCreateDaqDevice` takes the
/// descriptor by value.
pub struct UlDriver {
    inventory: Mutex<Vec<DaqDeviceDescriptor>>,
}

impl UlDriver {
    pub fn new() -> Self {
        // Device numbering comes from our own inventory, not from InstaCal
        unsafe {
            cbIgnoreInstaCal();
        }
        Self {
            inventory: Mutex::new(Vec::new()),
        }
    }
}

impl Default for UlDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqDriver for UlDriver {
    fn inventory(&self) -> Result<Vec<BoardDescriptor>, UlError> {
        let mut raw = vec![DaqDeviceDescriptor::zeroed(); MAX_INVENTORY];
        let mut found = MAX_INVENTORY as CInt;
        ul_call(|| unsafe { cbGetDaqDeviceInventory(USB_IFC, raw.as_mut_ptr(), &mut found) })?;
        raw.truncate(found.max(0) as usize);
        let boards = raw.iter().map(|dev| dev.descriptor()).collect();
        *self.inventory.lock() = raw;
        Ok(boards)
    }

    fn create_device(&self, board: u32, descriptor: &BoardDescriptor) -> Result<(), UlError> {
        let raw = self
            .inventory
            .lock()
            .iter()
            .find(|dev| dev.descriptor() == *descriptor)
            .copied()
            .ok_or_else(|| UlError::new(UL_BADBOARD, "Board not in inventory"))?;
        ul_call(|| unsafe { cbCreateDaqDevice(board as CInt, raw) })
    }

    fn release_device(&self, board: u32) -> Result<(), UlError> {
        ul_call(|| unsafe { cbReleaseDaqDevice(board as CInt) })
    }

    fn num_da_chans(&self, board: u32) -> Result<u32, UlError> {
        let mut val: CInt = 0;
        ul_call(|| unsafe { cbGetConfig(BOARDINFO, board as CInt, 0, BINUMDACHANS, &mut val) })?;
        Ok(val.max(0) as u32)
    }

    fn buf_alloc(&self, samples: usize) -> Result<MemHandle, UlError> {
        let handle = unsafe { cbWinBufAlloc(samples as CLong) };
        if handle.is_null() {
            return Err(UlError::new(
                UL_ALLOC_FAILED,
                format!("cbWinBufAlloc({}) returned a null handle", samples),
            ));
        }
        Ok(handle as MemHandle)
    }

    fn buf_write(&self, memhandle: MemHandle, samples: &[u16]) -> Result<(), UlError> {
        // The library only reads from the array
        ul_call(|| unsafe {
            cbWinArrayToBuf(
                samples.as_ptr() as *mut CUshort,
                to_hglobal(memhandle),
                0,
                samples.len() as CLong,
            )
        })
    }

    fn buf_free(&self, memhandle: MemHandle) -> Result<(), UlError> {
        ul_call(|| unsafe { cbWinBufFree(to_hglobal(memhandle)) })
    }

    fn aout_scan(&self, board: u32, request: &ScanRequest) -> Result<u32, UlError> {
        let mut rate = request.rate as CLong;
        let mut options = BACKGROUND | SIMULTANEOUS;
        if request.continuous {
            options |= CONTINUOUS;
        }
        ul_call(|| unsafe {
            cbAOutScan(
                board as CInt,
                request.low_chan as CInt,
                request.high_chan as CInt,
                request.total_samples as CLong,
                &mut rate,
                BIP10VOLTS,
                to_hglobal(request.memhandle),
                options,
            )
        })?;
        Ok(rate.max(0) as u32)
    }

    fn stop_background(&self, board: u32) -> Result<(), UlError> {
        ul_call(|| unsafe { cbStopBackground(board as CInt, AOFUNCTION) })
    }

    fn aout(&self, board: u32, chan: u32, value: u16) -> Result<(), UlError> {
        ul_call(|| unsafe { cbAOut(board as CInt, chan as CInt, BIP10VOLTS, value) })
    }

    fn is_running(&self, board: u32) -> Result<bool, UlError> {
        let mut status: CShort = 0;
        let mut cur_count: CLong = 0;
        let mut cur_index: CLong = 0;
        ul_call(|| unsafe {
            cbGetStatus(
                board as CInt,
                &mut status,
                &mut cur_count,
                &mut cur_index,
                AOFUNCTION,
            )
        })?;
        Ok(status == RUNNING)
    }
}

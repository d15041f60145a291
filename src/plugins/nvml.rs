//! NVIDIA GPU energy counters through NVML.
//!
//! The NVML library is loaded at runtime so the crate builds and runs on
//! machines without the NVIDIA driver; the plugin then fails to initialize
//! and is skipped.

use std::ffi::{c_char, c_int, c_uint, c_ulonglong, c_void, CStr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use libloading::Library;

use crate::device::{Device, DeviceKind, EnergySensor};
use crate::error::EmaError;
use crate::plugin::Plugin;

pub const PLUGIN_NAME: &str = "NVML";
pub const DEFAULT_LIBRARY: &str = "libnvidia-ml.so.1";

const NVML_SUCCESS: c_int = 0;
const NVML_DEVICE_NAME_V2_BUFFER_SIZE: usize = 96;
const NVML_DEVICE_UUID_BUFFER_SIZE: usize = 80;

type NvmlDeviceHandle = *mut c_void;

type InitFn = unsafe extern "C" fn() -> c_int;
type ShutdownFn = unsafe extern "C" fn() -> c_int;
type ErrorStringFn = unsafe extern "C" fn(c_int) -> *const c_char;
type DeviceGetCountFn = unsafe extern "C" fn(*mut c_uint) -> c_int;
type DeviceGetHandleByIndexFn = unsafe extern "C" fn(c_uint, *mut NvmlDeviceHandle) -> c_int;
type DeviceGetStringFn = unsafe extern "C" fn(NvmlDeviceHandle, *mut c_char, c_uint) -> c_int;
type DeviceGetTotalEnergyFn = unsafe extern "C" fn(NvmlDeviceHandle, *mut c_ulonglong) -> c_int;

/// Entry points resolved from the NVML shared library.
struct NvmlApi {
    init: InitFn,
    shutdown: ShutdownFn,
    error_string: ErrorStringFn,
    device_get_count: DeviceGetCountFn,
    device_get_handle_by_index: DeviceGetHandleByIndexFn,
    device_get_name: DeviceGetStringFn,
    device_get_uuid: DeviceGetStringFn,
    device_get_total_energy: DeviceGetTotalEnergyFn,
    // Keeps the function pointers above valid.
    _lib: Library,
}

impl NvmlApi {
    fn load(path: &str) -> Result<Self> {
        let lib =
            unsafe { Library::new(path) }.with_context(|| format!("Failed to load {}", path))?;
        let init = unsafe { *lib.get::<InitFn>(b"nvmlInit_v2\0")? };
        let shutdown = unsafe { *lib.get::<ShutdownFn>(b"nvmlShutdown\0")? };
        let error_string = unsafe { *lib.get::<ErrorStringFn>(b"nvmlErrorString\0")? };
        let device_get_count =
            unsafe { *lib.get::<DeviceGetCountFn>(b"nvmlDeviceGetCount_v2\0")? };
        let device_get_handle_by_index = unsafe {
            *lib.get::<DeviceGetHandleByIndexFn>(b"nvmlDeviceGetHandleByIndex_v2\0")?
        };
        let device_get_name = unsafe { *lib.get::<DeviceGetStringFn>(b"nvmlDeviceGetName\0")? };
        let device_get_uuid = unsafe { *lib.get::<DeviceGetStringFn>(b"nvmlDeviceGetUUID\0")? };
        let device_get_total_energy = unsafe {
            *lib.get::<DeviceGetTotalEnergyFn>(b"nvmlDeviceGetTotalEnergyConsumption\0")?
        };

        Ok(NvmlApi {
            init,
            shutdown,
            error_string,
            device_get_count,
            device_get_handle_by_index,
            device_get_name,
            device_get_uuid,
            device_get_total_energy,
            _lib: lib,
        })
    }

    fn error_string(&self, ret: c_int) -> String {
        let ptr = unsafe { (self.error_string)(ret) };
        if ptr.is_null() {
            return format!("NVML error {}", ret);
        }
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().to_string()
    }

    fn check(&self, ret: c_int, what: &str) -> Result<()> {
        if ret != NVML_SUCCESS {
            bail!("{}: {}", what, self.error_string(ret));
        }
        Ok(())
    }

    fn device_string(
        &self,
        f: DeviceGetStringFn,
        handle: NvmlDeviceHandle,
        size: usize,
        what: &str,
    ) -> Result<String> {
        let mut buf = vec![0 as c_char; size];
        let ret = unsafe { f(handle, buf.as_mut_ptr(), size as c_uint) };
        self.check(ret, what)?;
        let cstr = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(cstr.to_string_lossy().to_string())
    }
}

struct NvmlSensor {
    api: Arc<NvmlApi>,
    handle: NvmlDeviceHandle,
    idx: u32,
}

// NVML handles are opaque and the library is thread safe.
unsafe impl Send for NvmlSensor {}
unsafe impl Sync for NvmlSensor {}

impl EnergySensor for NvmlSensor {
    fn read_energy_uj(&self) -> Result<u64> {
        let mut energy_mj: c_ulonglong = 0;
        let ret = unsafe { (self.api.device_get_total_energy)(self.handle, &mut energy_mj) };
        if ret != NVML_SUCCESS {
            return Err(EmaError::SensorRead {
                device: format!("GPU {}", self.idx),
                reason: self.api.error_string(ret),
            }
            .into());
        }
        Ok(energy_mj.saturating_mul(1000))
    }
}

pub struct NvmlPlugin {
    library: String,
    api: Option<Arc<NvmlApi>>,
}

impl Default for NvmlPlugin {
    fn default() -> Self {
        Self::new(DEFAULT_LIBRARY)
    }
}

impl NvmlPlugin {
    pub fn new(library: impl Into<String>) -> Self {
        NvmlPlugin {
            library: library.into(),
            api: None,
        }
    }

    fn init_device(api: &Arc<NvmlApi>, idx: u32) -> Result<Device> {
        let mut handle: NvmlDeviceHandle = std::ptr::null_mut();
        let ret = unsafe { (api.device_get_handle_by_index)(idx, &mut handle) };
        api.check(ret, &format!("Failed to get handle of device {}", idx))?;

        let name = api.device_string(
            api.device_get_name,
            handle,
            NVML_DEVICE_NAME_V2_BUFFER_SIZE,
            "Failed to get device name",
        )?;
        let uuid = api.device_string(
            api.device_get_uuid,
            handle,
            NVML_DEVICE_UUID_BUFFER_SIZE,
            "Failed to get device UUID",
        )?;

        let sensor = NvmlSensor {
            api: api.clone(),
            handle,
            idx,
        };
        Device::new(PLUGIN_NAME, name, uuid, DeviceKind::Gpu, Box::new(sensor))
    }

    fn shutdown(api: &NvmlApi) -> Result<()> {
        let ret = unsafe { (api.shutdown)() };
        api.check(ret, "NVML shutdown failed")
    }
}

impl Plugin for NvmlPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn init(&mut self) -> Result<Vec<Device>> {
        let api = Arc::new(NvmlApi::load(&self.library)?);
        let ret = unsafe { (api.init)() };
        api.check(ret, "NVML initialization failed")?;

        let mut count: c_uint = 0;
        let ret = unsafe { (api.device_get_count)(&mut count) };
        if let Err(err) = api.check(ret, "Could not query device count") {
            let _ = Self::shutdown(&api);
            return Err(err);
        }

        let mut devices = Vec::new();
        for idx in 0..count {
            match Self::init_device(&api, idx) {
                Ok(device) => devices.push(device),
                Err(err) => tracing::warn!("Skipping NVML device {}: {:#}", idx, err),
            }
        }

        if devices.is_empty() && count > 0 {
            let _ = Self::shutdown(&api);
            return Err(EmaError::NoDeviceAccess {
                plugin: PLUGIN_NAME.to_string(),
            }
            .into());
        }
        if count == 0 {
            tracing::info!("No NVML devices detected");
        }

        self.api = Some(api);
        Ok(devices)
    }

    fn finalize(&mut self) -> Result<()> {
        match self.api.take() {
            Some(api) => Self::shutdown(&api),
            None => Ok(()),
        }
    }
}

//! C ABI over the global session.
//!
//! Every function returns an [`EmaStatus`] code (`0` on success, negative on
//! failure) except `EMA_get_time_in_us`. Regions are referred to by opaque
//! `u64` handles that become invalid after `EMA_finalize`. Panics never cross
//! the boundary.

#![allow(non_snake_case)]

mod handle;

use std::ffi::{c_char, CStr};
use std::sync::{Mutex, MutexGuard};

use crate::config::Config;
use crate::error::EmaError;
use crate::global;
use crate::logging;
use crate::region::Region;
use crate::utils::now_us;

use handle::HandleTable;

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmaStatus {
    Ok = 0,
    /// A pointer is null or a string is not UTF-8.
    InvalidArgument = -1,
    /// Unknown region handle, or one from a finalized session.
    InvalidHandle = -2,
    NotInitialized = -3,
    AlreadyInitialized = -4,
    /// `EMA_region_end` without a matching `EMA_region_begin`.
    RegionNotStarted = -5,
    ThreadLimit = -6,
    /// Any other failure, details are logged.
    Failed = -7,
    Panicked = -128,
}

impl From<&anyhow::Error> for EmaStatus {
    fn from(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<EmaError>() {
            Some(EmaError::NotInitialized) => EmaStatus::NotInitialized,
            Some(EmaError::AlreadyInitialized) => EmaStatus::AlreadyInitialized,
            Some(EmaError::RegionNotStarted { .. }) => EmaStatus::RegionNotStarted,
            Some(EmaError::StaleRegion { .. }) => EmaStatus::InvalidHandle,
            Some(EmaError::ThreadLimit { .. }) => EmaStatus::ThreadLimit,
            Some(EmaError::NoDeviceAccess { .. }) | Some(EmaError::SensorRead { .. }) | None => {
                EmaStatus::Failed
            }
        }
    }
}

fn status_of(result: anyhow::Result<()>, what: &str) -> i32 {
    match result {
        Ok(()) => EmaStatus::Ok as i32,
        Err(err) => {
            tracing::warn!("{} failed: {:#}", what, err);
            EmaStatus::from(&err) as i32
        }
    }
}

macro_rules! ffi_guard {
    ($body:block) => {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| $body)) {
            Ok(status) => status,
            Err(_) => EmaStatus::Panicked as i32,
        }
    };
}

static REGIONS: Mutex<HandleTable<Region>> = Mutex::new(HandleTable::new());

fn regions() -> MutexGuard<'static, HandleTable<Region>> {
    REGIONS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lookup(handle: u64) -> Option<Region> {
    regions().get(handle).cloned()
}

/// Initialize the global session, configured from the `EMA_*` environment.
#[no_mangle]
pub extern "C" fn EMA_init() -> i32 {
    ffi_guard!({
        logging::init_from_env();
        let result = Config::from_env().and_then(global::init);
        status_of(result, "EMA_init")
    })
}

/// Write the report and tear the global session down.
#[no_mangle]
pub extern "C" fn EMA_finalize() -> i32 {
    ffi_guard!({
        let result = global::finalize();
        regions().clear();
        status_of(result, "EMA_finalize")
    })
}

/// Define a region called `name` and store its handle in `*handle_out`.
///
/// Defining the same name again from the same thread yields the same handle.
///
/// # Safety
///
/// `name` must be null or a valid NUL-terminated string and `handle_out`
/// null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn EMA_region_define(name: *const c_char, handle_out: *mut u64) -> i32 {
    ffi_guard!({
        if name.is_null() || handle_out.is_null() {
            return EmaStatus::InvalidArgument as i32;
        }
        // SAFETY: checked non-null, validity is the caller's contract.
        let name = match unsafe { CStr::from_ptr(name) }.to_str() {
            Ok(name) => name,
            Err(_) => return EmaStatus::InvalidArgument as i32,
        };
        match global::region_define(name) {
            Ok(region) => {
                let mut table = regions();
                let existing = table.find(|r| r.ptr_eq(&region));
                let handle = existing.unwrap_or_else(|| table.insert(region));
                drop(table);
                // SAFETY: checked non-null, validity is the caller's contract.
                unsafe { handle_out.write(handle) };
                EmaStatus::Ok as i32
            }
            Err(err) => status_of(Err(err), "EMA_region_define"),
        }
    })
}

#[no_mangle]
pub extern "C" fn EMA_region_begin(handle: u64) -> i32 {
    ffi_guard!({
        match lookup(handle) {
            Some(region) => status_of(global::region_begin(&region), "EMA_region_begin"),
            None => EmaStatus::InvalidHandle as i32,
        }
    })
}

#[no_mangle]
pub extern "C" fn EMA_region_end(handle: u64) -> i32 {
    ffi_guard!({
        match lookup(handle) {
            Some(region) => status_of(global::region_end(&region), "EMA_region_end"),
            None => EmaStatus::InvalidHandle as i32,
        }
    })
}

/// Monotonic clock in microseconds.
#[no_mangle]
pub extern "C" fn EMA_get_time_in_us() -> u64 {
    now_us()
}

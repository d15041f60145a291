//! Process-wide session for binding-style callers.
//!
//! Wraps one [`Ema`] behind a mutex so callers that cannot carry a session
//! around (language bindings, the C ABI) can use the plain
//! init/define/begin/end/finalize sequence.

use std::sync::{Mutex, MutexGuard};

use anyhow::Result;

use crate::config::Config;
use crate::error::EmaError;
use crate::region::{CodeLocation, Region};
use crate::session::{Ema, EmaBuilder};

static SESSION: Mutex<Option<Ema>> = Mutex::new(None);

fn lock() -> MutexGuard<'static, Option<Ema>> {
    SESSION
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fails unless `region` was created by the running session.
fn check_session(region: &Region) -> Result<()> {
    match lock().as_ref() {
        None => Err(EmaError::NotInitialized.into()),
        Some(ema) if ema.id() != region.session_id() => Err(EmaError::StaleRegion {
            idf: region.idf(),
        }
        .into()),
        Some(_) => Ok(()),
    }
}

pub fn is_initialized() -> bool {
    lock().is_some()
}

/// Start the global session with the built-in plugins.
pub fn init(config: Config) -> Result<()> {
    init_with(Ema::builder(config))
}

/// Start the global session from a prepared builder, e.g. one carrying user
/// plugins.
pub fn init_with(builder: EmaBuilder) -> Result<()> {
    let mut session = lock();
    if session.is_some() {
        return Err(EmaError::AlreadyInitialized.into());
    }
    *session = Some(builder.init()?);
    Ok(())
}

/// Define a region measuring all devices, without source location.
pub fn region_define(name: &str) -> Result<Region> {
    region_define_at(name, CodeLocation::default())
}

pub fn region_define_at(name: &str, location: CodeLocation) -> Result<Region> {
    match lock().as_ref() {
        Some(ema) => ema.region_define(name, None, location),
        None => Err(EmaError::NotInitialized.into()),
    }
}

pub fn region_begin(region: &Region) -> Result<()> {
    check_session(region)?;
    region.begin()
}

pub fn region_end(region: &Region) -> Result<()> {
    check_session(region)?;
    region.end()
}

/// Run `f` against the global session.
pub fn with_session<T>(f: impl FnOnce(&Ema) -> T) -> Result<T> {
    match lock().as_ref() {
        Some(ema) => Ok(f(ema)),
        None => Err(EmaError::NotInitialized.into()),
    }
}

/// Finalize the global session. `init` may be called again afterwards.
pub fn finalize() -> Result<()> {
    let ema = lock().take().ok_or(EmaError::NotInitialized)?;
    ema.finalize()
}

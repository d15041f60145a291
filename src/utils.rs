use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nix::time::{clock_gettime, ClockId};

/// Convert a `timespec` split into seconds and nanoseconds to microseconds.
///
/// Negative components are clamped to zero.
///
/// # Examples
///
/// ```
/// use ema::utils::timespec_to_us;
/// assert_eq!(timespec_to_us(2, 5_000), 2_000_005);
/// ```
#[inline(always)]
pub const fn timespec_to_us(sec: i64, nsec: i64) -> u64 {
    let sec = if sec < 0 { 0 } else { sec as u64 };
    let nsec = if nsec < 0 { 0 } else { nsec as u64 };
    sec * 1_000_000 + nsec / 1_000
}

/// Current `CLOCK_MONOTONIC` time in microseconds.
pub fn now_us() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => timespec_to_us(ts.tv_sec() as i64, ts.tv_nsec() as i64),
        Err(_) => 0,
    }
}

/// Read a sysfs style attribute and strip the trailing newline.
pub fn read_trimmed(path: &Path) -> Result<String> {
    let buf =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(buf.trim().to_string())
}

/// Read a sysfs style attribute holding a single unsigned integer.
pub fn read_u64(path: &Path) -> Result<u64> {
    let buf = read_trimmed(path)?;
    buf.parse::<u64>()
        .with_context(|| format!("Failed to parse '{}' from {}", buf, path.display()))
}

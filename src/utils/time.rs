//! Timestamp utilities.

use crate::error::{constants, CommError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as milliseconds since the Unix epoch.
///
/// # Errors
/// Returns `CommError::Custom` if the system clock reads before the epoch.
pub fn epoch_millis() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| CommError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn epoch_millis_is_monotonic_enough() {
        let a = epoch_millis().unwrap();
        let b = epoch_millis().unwrap();
        assert!(b >= a);
    }
}

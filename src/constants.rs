use std::time::Duration;

use crate::rate::Bitrate;

// Floor for the post-backoff growth cap, so a collapsed estimate can still
// climb out of the recovery window.
pub const RECOVERY_WINDOW_MIN_BITRATE: Bitrate = Bitrate::from_kbps(5);

// HOLD starts at this duration and grows by the configured factor on each
// re-entry, capped below.
pub const INITIAL_HOLD_DURATION: Duration = Duration::from_millis(300);
pub const MAX_HOLD_DURATION: Duration = Duration::from_secs(60);

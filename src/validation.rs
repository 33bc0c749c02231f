use chrono::{DateTime, Months, Utc};
use thiserror::Error;

use crate::{MAX_VOLUME_ML, MIN_VOLUME_ML};

pub const MAX_DAILY_GOAL_ML: u32 = 20_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Volume must be between {} and {} ml", MIN_VOLUME_ML, MAX_VOLUME_ML)]
    VolumeOutOfRange { volume: i64 },
    #[error("Timestamp cannot be in the future")]
    TimestampInFuture,
    #[error("Timestamp cannot be more than one year ago")]
    TimestampTooOld,
    #[error("Daily goal must be between 1 and {} ml", MAX_DAILY_GOAL_ML)]
    InvalidGoal { goal: u32 },
}

/// Accepts volumes in `[MIN_VOLUME_ML, MAX_VOLUME_ML]` and narrows them to `u32`.
pub fn validate_volume(volume: i64) -> Result<u32, ValidationError> {
    u32::try_from(volume)
        .ok()
        .filter(|v| (MIN_VOLUME_ML..=MAX_VOLUME_ML).contains(v))
        .ok_or(ValidationError::VolumeOutOfRange { volume })
}

pub fn validate_timestamp(
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    if timestamp > now {
        return Err(ValidationError::TimestampInFuture);
    }
    let oldest = now
        .checked_sub_months(Months::new(12))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    if timestamp < oldest {
        return Err(ValidationError::TimestampTooOld);
    }
    Ok(())
}

pub fn validate_daily_goal(goal: u32) -> Result<u32, ValidationError> {
    if goal == 0 || goal > MAX_DAILY_GOAL_ML {
        return Err(ValidationError::InvalidGoal { goal });
    }
    Ok(goal)
}

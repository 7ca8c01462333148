use chrono::{DateTime, Utc};
use mongodb::bson::DateTime as BsonDateTime;

pub fn chrono_to_bson(dt: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(dt.timestamp_millis())
}

/// Current time in seconds since the epoch, the unit portal JWT `exp` uses.
pub fn now_epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServoPhase {
    Disabled,
    Idle,
    Moving,
    Faulted,
}

/// Flat status record exported to telemetry consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoStatus {
    pub position: Option<i32>,
    pub target_position: Option<i32>,
    pub is_moving: bool,
    // Servo telemetry, None until the first successful poll
    pub temperature: Option<f32>,
    pub current: Option<f32>,
    pub voltage: Option<f32>,
    pub enabled: bool,
    pub last_error: Option<String>,
    pub state: ServoPhase,
    pub temperature_warning: bool,
    #[serde(with = "time::serde::timestamp::option")]
    pub last_poll: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_flat() {
        let st = ServoStatus {
            position: Some(2048),
            target_position: Some(3000),
            is_moving: true,
            temperature: Some(41.0),
            current: None,
            voltage: Some(12.0),
            enabled: true,
            last_error: None,
            state: ServoPhase::Moving,
            temperature_warning: false,
            last_poll: Some(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()),
        };
        let v = serde_json::to_value(&st).unwrap();
        assert_eq!(v["position"], 2048);
        assert_eq!(v["state"], "moving");
        assert_eq!(v["last_poll"], 1_700_000_000i64);
        assert!(v["current"].is_null());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::gps_processor::{Confidence, Point, PositionSample};

/// The payload published for every emitted sample. Receivers de-duplicate on
/// `(job_id, captured_at)`, so sending the same update twice is harmless.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub job_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driving_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_moving: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
}

impl LocationUpdate {
    /// Only the tracker calls this, and only for samples that passed the gate.
    pub(crate) fn from_sample(
        job_id: &str,
        sample: &PositionSample,
        driving_score: u8,
        is_moving: bool,
    ) -> Self {
        LocationUpdate {
            job_id: job_id.to_string(),
            latitude: sample.point.latitude,
            longitude: sample.point.longitude,
            accuracy: sample.accuracy,
            speed: Some(sample.speed_or_zero()),
            heading: sample.heading,
            captured_at: sample.captured_at,
            driving_score: Some(driving_score),
            is_moving: Some(is_moving),
            confidence: Some(sample.confidence()),
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.latitude, self.longitude)
    }

    pub fn dedup_key(&self) -> (String, DateTime<Utc>) {
        (self.job_id.clone(), self.captured_at)
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.job_id.trim().is_empty() {
            return Err(WireError::MissingJobId);
        }
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(WireError::LatitudeOutOfRange(self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(WireError::LongitudeOutOfRange(self.longitude));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Malformed(e.to_string()))
    }

    /// Parse and validate in one step, this is the only way a receiver should
    /// turn bytes into a `LocationUpdate`.
    pub fn parse(json: &str) -> Result<Self, WireError> {
        let update: LocationUpdate =
            serde_json::from_str(json).map_err(|e| WireError::Malformed(e.to_string()))?;
        update.validate()?;
        Ok(update)
    }
}

/// Event envelope used on the realtime channel, in both directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMessage {
    LocationUpdate(LocationUpdate),
    JobStatusUpdate {
        #[serde(rename = "jobId")]
        job_id: String,
        status: String,
    },
    JoinTracking(String),
    LeaveTracking(String),
}

impl ChannelMessage {
    pub fn parse(json: &str) -> Result<Self, WireError> {
        let message: ChannelMessage =
            serde_json::from_str(json).map_err(|e| WireError::Malformed(e.to_string()))?;
        if let ChannelMessage::LocationUpdate(update) = &message {
            update.validate()?;
        }
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_may_be_absent() {
        let update = LocationUpdate::parse(
            r#"{"jobId":"job-1","latitude":42.36,"longitude":-71.05,"capturedAt":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(update.job_id, "job-1");
        assert!(update.accuracy.is_none());
        assert!(update.confidence.is_none());
    }

    #[test]
    fn confidence_uses_snake_case() {
        let update = LocationUpdate::parse(
            r#"{"jobId":"job-1","latitude":1,"longitude":2,"capturedAt":"2024-05-01T10:00:00Z","confidence":"very_low"}"#,
        )
        .unwrap();
        assert_eq!(update.confidence, Some(Confidence::VeryLow));
    }

    #[test]
    fn invalid_payloads() {
        assert_eq!(
            LocationUpdate::parse(
                r#"{"jobId":"","latitude":1,"longitude":2,"capturedAt":"2024-05-01T10:00:00Z"}"#
            ),
            Err(WireError::MissingJobId)
        );
        assert_eq!(
            LocationUpdate::parse(
                r#"{"jobId":"a","latitude":91,"longitude":2,"capturedAt":"2024-05-01T10:00:00Z"}"#
            ),
            Err(WireError::LatitudeOutOfRange(91.0))
        );
        assert!(matches!(
            LocationUpdate::parse(r#"{"jobId":"a","latitude":1}"#),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn envelope_shape() {
        let message = ChannelMessage::JobStatusUpdate {
            job_id: "job-9".to_string(),
            status: "en_route".to_string(),
        };
        let json = message.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"event":"job-status-update","payload":{"jobId":"job-9","status":"en_route"}}"#
        );
        assert_eq!(ChannelMessage::parse(&json).unwrap(), message);
        assert!(ChannelMessage::parse(r#"{"event":"unknown","payload":{}}"#).is_err());
    }
}

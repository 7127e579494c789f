use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One immutable location fix
///
/// Optional attributes are only kept when the sensor reported a usable
/// value: accuracy, speed and bearing must be non-negative, altitude finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix timestamp (seconds) of acquisition
    pub capture_time_seconds: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude_meters: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_meters_per_second: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing_degrees: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("Latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("Longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, capture_time_seconds: i64) -> Self {
        Self {
            latitude,
            longitude,
            capture_time_seconds,
            accuracy_meters: None,
            altitude_meters: None,
            speed_meters_per_second: None,
            bearing_degrees: None,
        }
    }

    pub fn with_accuracy(mut self, meters: Option<f64>) -> Self {
        self.accuracy_meters = non_negative(meters);
        self
    }

    pub fn with_altitude(mut self, meters: Option<f64>) -> Self {
        self.altitude_meters = meters.filter(|v| v.is_finite());
        self
    }

    pub fn with_speed(mut self, meters_per_second: Option<f64>) -> Self {
        self.speed_meters_per_second = non_negative(meters_per_second);
        self
    }

    pub fn with_bearing(mut self, degrees: Option<f64>) -> Self {
        self.bearing_degrees = non_negative(degrees);
        self
    }

    pub fn validate(&self) -> Result<(), SampleError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(SampleError::LatitudeOutOfRange(self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(SampleError::LongitudeOutOfRange(self.longitude));
        }
        Ok(())
    }
}

fn non_negative(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_optional_attributes_are_dropped() {
        let sample = LocationSample::new(52.5, 13.4, 1_700_000_000)
            .with_accuracy(Some(-1.0))
            .with_speed(Some(-0.5))
            .with_bearing(Some(f64::NAN))
            .with_altitude(Some(-12.0));

        assert_eq!(sample.accuracy_meters, None);
        assert_eq!(sample.speed_meters_per_second, None);
        assert_eq!(sample.bearing_degrees, None);
        // below sea level is still a real altitude
        assert_eq!(sample.altitude_meters, Some(-12.0));
    }

    #[test]
    fn test_zero_speed_is_kept() {
        let sample = LocationSample::new(0.0, 0.0, 0)
            .with_speed(Some(0.0))
            .with_bearing(Some(0.0));
        assert_eq!(sample.speed_meters_per_second, Some(0.0));
        assert_eq!(sample.bearing_degrees, Some(0.0));
    }

    #[test]
    fn test_coordinate_ranges() {
        assert!(LocationSample::new(90.0, -180.0, 0).validate().is_ok());
        assert!(matches!(
            LocationSample::new(91.0, 0.0, 0).validate(),
            Err(SampleError::LatitudeOutOfRange(_))
        ));
        assert!(matches!(
            LocationSample::new(0.0, 180.5, 0).validate(),
            Err(SampleError::LongitudeOutOfRange(_))
        ));
        assert!(LocationSample::new(f64::NAN, 0.0, 0).validate().is_err());
    }

    #[test]
    fn test_absent_attributes_are_not_serialized() {
        let json = serde_json::to_value(LocationSample::new(1.0, 2.0, 3)).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 3);
        assert_eq!(json["captureTimeSeconds"], 3);
    }
}

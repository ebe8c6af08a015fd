use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::DriverId;
use super::ValidationError;

/// A GPS sample waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub id: Uuid,
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: Option<f64>,
    pub speed_mps: Option<f64>,
    pub heading_deg: Option<f64>,
    pub captured_at: DateTime<Utc>,
    pub synced: bool,
}

impl LocationSample {
    pub fn new(driver_id: DriverId, latitude: f64, longitude: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            driver_id,
            latitude,
            longitude,
            accuracy_meters: None,
            speed_mps: None,
            heading_deg: None,
            captured_at: Utc::now(),
            synced: false,
        }
    }

    pub fn with_accuracy(mut self, meters: f64) -> Self {
        self.accuracy_meters = Some(meters);
        self
    }

    pub fn with_speed(mut self, mps: f64) -> Self {
        self.speed_mps = Some(mps);
        self
    }

    pub fn with_heading(mut self, degrees: f64) -> Self {
        self.heading_deg = Some(degrees);
        self
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ValidationError::InvalidCoordinate {
                field: "latitude",
                value: self.latitude,
            });
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ValidationError::InvalidCoordinate {
                field: "longitude",
                value: self.longitude,
            });
        }
        if let Some(accuracy) = self.accuracy_meters {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(ValidationError::InvalidCoordinate {
                    field: "accuracy",
                    value: accuracy,
                });
            }
        }
        Ok(())
    }
}

/// A raw fix from the platform GPS, before it is attributed to a driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: Option<f64>,
    pub speed_mps: Option<f64>,
    pub heading_deg: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl GpsFix {
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters: None,
            speed_mps: None,
            heading_deg: None,
            captured_at,
        }
    }

    pub fn into_sample(self, driver_id: DriverId) -> LocationSample {
        LocationSample {
            accuracy_meters: self.accuracy_meters,
            speed_mps: self.speed_mps,
            heading_deg: self.heading_deg,
            ..LocationSample::new(driver_id, self.latitude, self.longitude)
                .with_captured_at(self.captured_at)
        }
    }
}

//! Trusted devices that skip the MFA step until their record expires.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr, sync::Mutex};
use tracing::info;
use ulid::Ulid;
use utoipa::ToSchema;

use crate::{crypto::sha256_hex, error::CasError};

pub const HANDLER_NAME: &str = "TrustedDeviceAuthenticationHandler";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

impl TimeUnit {
    /// Months count as 30 days.
    #[must_use]
    pub fn duration(self, amount: i64) -> Duration {
        match self {
            Self::Seconds => Duration::seconds(amount),
            Self::Minutes => Duration::minutes(amount),
            Self::Hours => Duration::hours(amount),
            Self::Days => Duration::days(amount),
            Self::Weeks => Duration::weeks(amount),
            Self::Months => Duration::days(amount.saturating_mul(30)),
        }
    }
}

impl FromStr for TimeUnit {
    type Err = CasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "seconds" => Ok(Self::Seconds),
            "minutes" => Ok(Self::Minutes),
            "hours" => Ok(Self::Hours),
            "days" => Ok(Self::Days),
            "weeks" => Ok(Self::Weeks),
            "months" => Ok(Self::Months),
            _ => Err(CasError::InvalidRequest(format!("unknown time unit {value}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrustedDevice {
    pub id: String,
    pub principal: String,
    pub device_name: String,
    pub fingerprint: String,
    pub recorded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Device fingerprint from what the browser presents on every request.
#[must_use]
pub fn fingerprint(client_ip: &str, user_agent: &str, device_id: &str) -> String {
    sha256_hex(format!("{client_ip}|{user_agent}|{device_id}").as_bytes())
}

#[derive(Default)]
pub struct TrustedDeviceStore {
    devices: Mutex<HashMap<String, TrustedDevice>>,
}

impl TrustedDeviceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, TrustedDevice>>, CasError> {
        self.devices
            .lock()
            .map_err(|_| CasError::Internal("trusted device lock poisoned".to_string()))
    }

    /// # Errors
    /// Returns `InvalidRequest` for a non-positive expiration.
    pub fn register(
        &self,
        principal: &str,
        device_name: &str,
        fingerprint: String,
        expiration: i64,
        unit: TimeUnit,
    ) -> Result<TrustedDevice, CasError> {
        if expiration <= 0 {
            return Err(CasError::InvalidRequest(
                "expiration must be positive".to_string(),
            ));
        }
        let now = Utc::now();
        let device = TrustedDevice {
            id: Ulid::new().to_string(),
            principal: principal.to_string(),
            device_name: device_name.trim().to_string(),
            fingerprint,
            recorded_at: now,
            expires_at: now + unit.duration(expiration),
        };
        self.lock()?.insert(device.id.clone(), device.clone());
        info!(principal, device = %device.device_name, "registered trusted device");
        Ok(device)
    }

    /// # Errors
    /// Returns an error if the store lock is poisoned.
    pub fn is_trusted(&self, principal: &str, fingerprint: &str) -> Result<bool, CasError> {
        let now = Utc::now();
        Ok(self.lock()?.values().any(|device| {
            device.principal == principal
                && device.fingerprint == fingerprint
                && device.expires_at > now
        }))
    }

    /// Unexpired devices, optionally for one principal, oldest first.
    ///
    /// # Errors
    /// Returns an error if the store lock is poisoned.
    pub fn list(&self, principal: Option<&str>) -> Result<Vec<TrustedDevice>, CasError> {
        let now = Utc::now();
        let mut devices: Vec<TrustedDevice> = self
            .lock()?
            .values()
            .filter(|device| device.expires_at > now)
            .filter(|device| principal.map_or(true, |p| device.principal == p))
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(devices)
    }

    /// Remove every device of `principal`; returns how many were removed.
    ///
    /// # Errors
    /// Returns an error if the store lock is poisoned.
    pub fn revoke(&self, principal: &str) -> Result<usize, CasError> {
        let mut devices = self.lock()?;
        let before = devices.len();
        devices.retain(|_, device| device.principal != principal);
        Ok(before - devices.len())
    }
}

impl fmt::Debug for TrustedDeviceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedDeviceStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn time_units() {
        assert_eq!("Days".parse::<TimeUnit>().unwrap(), TimeUnit::Days);
        assert!("fortnights".parse::<TimeUnit>().is_err());
        assert_eq!(TimeUnit::Months.duration(1), Duration::days(30));
        assert_eq!(TimeUnit::Weeks.duration(2), Duration::days(14));
    }

    #[test]
    fn fingerprint_depends_on_every_part() {
        let base = fingerprint("10.0.0.1", "Firefox", "laptop");
        assert_eq!(base, fingerprint("10.0.0.1", "Firefox", "laptop"));
        assert_ne!(base, fingerprint("10.0.0.2", "Firefox", "laptop"));
        assert_ne!(base, fingerprint("10.0.0.1", "Chrome", "laptop"));
        assert_ne!(base, fingerprint("10.0.0.1", "Firefox", "phone"));
    }

    #[test]
    fn registered_devices_are_trusted() {
        let store = TrustedDeviceStore::new();
        let print = fingerprint("10.0.0.1", "Firefox", "laptop");
        store
            .register("casuser", "My Laptop", print.clone(), 1, TimeUnit::Days)
            .unwrap();
        assert!(store.is_trusted("casuser", &print).unwrap());
        assert!(!store.is_trusted("other", &print).unwrap());
        assert_eq!(store.list(Some("casuser")).unwrap().len(), 1);
        assert_eq!(store.list(None).unwrap()[0].device_name, "My Laptop");
    }

    #[test]
    fn revoke_removes_devices() {
        let store = TrustedDeviceStore::new();
        let print = fingerprint("10.0.0.1", "Firefox", "laptop");
        store
            .register("casuser", "laptop", print.clone(), 2, TimeUnit::Hours)
            .unwrap();
        assert_eq!(store.revoke("casuser").unwrap(), 1);
        assert!(!store.is_trusted("casuser", &print).unwrap());
        assert_eq!(store.revoke("casuser").unwrap(), 0);
    }

    #[test]
    fn rejects_non_positive_expiration() {
        let store = TrustedDeviceStore::new();
        assert!(store
            .register("casuser", "laptop", "x".to_string(), 0, TimeUnit::Days)
            .is_err());
    }
}

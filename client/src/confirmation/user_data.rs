// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Opaque user data attached to opted-in confirmations.
//!
//! Dynamic data is time sensitive and rebuilt before every resend; fixed
//! data describes the client and never changes for a confirmation.

use base64ct::{Base64, Encoding};
use chrono::{DateTime, DurationRound, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::ConfirmationInfo;
use crate::config::UserDataSettings;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDataInfo {
    #[serde(default)]
    pub dynamic: Map<String, Value>,
    #[serde(default)]
    pub fixed: Map<String, Value>,
}

pub trait UserDataBuilder: Send + Sync {
    fn build_dynamic(&self, confirmation: &ConfirmationInfo) -> Map<String, Value>;
    fn build_fixed(&self, confirmation: &ConfirmationInfo) -> Map<String, Value>;
}

pub struct DefaultUserDataBuilder {
    settings: UserDataSettings,
}

impl DefaultUserDataBuilder {
    pub fn new(settings: UserDataSettings) -> Self {
        Self { settings }
    }

    fn build_dynamic_at(&self, confirmation: &ConfirmationInfo, now: DateTime<Utc>) -> Map<String, Value> {
        let mut dynamic = Map::new();
        if let Some(diagnostic_id) = &self.settings.diagnostic_id {
            dynamic.insert("diagnosticId".into(), Value::String(diagnostic_id.clone()));
        }

        let hour = now.duration_trunc(chrono::Duration::hours(1)).unwrap_or(now);
        dynamic.insert(
            "systemTimestamp".into(),
            Value::String(hour.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        if let Some(device_id) = &self.settings.device_id {
            let hours_since_epoch = now.timestamp() / 3600;
            let mut h = Sha256::new();
            h.update(device_id.as_bytes());
            h.update(confirmation.creative_instance_id.as_bytes());
            h.update(hours_since_epoch.to_string().as_bytes());
            dynamic.insert("rotatingHash".into(), Value::String(Base64::encode_string(&h.finalize())));
        }
        dynamic
    }
}

impl UserDataBuilder for DefaultUserDataBuilder {
    fn build_dynamic(&self, confirmation: &ConfirmationInfo) -> Map<String, Value> {
        self.build_dynamic_at(confirmation, Utc::now())
    }

    fn build_fixed(&self, _confirmation: &ConfirmationInfo) -> Map<String, Value> {
        let mut fixed = Map::new();
        fixed.insert("buildChannel".into(), Value::String(self.settings.build_channel.clone()));
        fixed.insert("platform".into(), Value::String(self.settings.platform.clone()));
        if let Some(country_code) = &self.settings.country_code {
            fixed.insert("countryCode".into(), Value::String(country_code.clone()));
        }
        fixed
    }
}

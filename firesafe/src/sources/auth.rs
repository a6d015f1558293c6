//! Firebase Authentication: user accounts with claims, providers and MFA.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use super::traits::{Batch, Cursor, RawRecord, SourceExporter};
use super::SourceKind;
use crate::api::DirectoryApi;
use crate::error::SourceError;
use crate::serializer::NativeFormat;

pub struct AuthExporter<A: ?Sized> {
    api: Arc<A>,
    with_mfa: AtomicU64,
    with_custom_claims: AtomicU64,
}

impl<A: DirectoryApi + ?Sized> AuthExporter<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            with_mfa: AtomicU64::new(0),
            with_custom_claims: AtomicU64::new(0),
        }
    }

    fn to_record(&self, user: &Value) -> Result<RawRecord, SourceError> {
        let uid = user
            .get("localId")
            .and_then(Value::as_str)
            .ok_or_else(|| SourceError::Fatal("user record without localId".to_string()))?;

        let mut record = RawRecord::new(uid, Value::Null, NativeFormat::PlainJson);
        let custom_claims = match user.get("customAttributes").and_then(Value::as_str) {
            None => json!({}),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(claims) => claims,
                Err(e) => {
                    warn!(uid, error = %e, "Custom claims are not valid JSON; keeping raw string");
                    record = record.with_meta("custom_claims_raw", json!(raw));
                    json!({})
                }
            },
        };
        if custom_claims.as_object().is_some_and(|c| !c.is_empty()) {
            self.with_custom_claims.fetch_add(1, Ordering::Relaxed);
        }

        let mfa = mfa_factors(user);
        if !mfa.is_empty() {
            self.with_mfa.fetch_add(1, Ordering::Relaxed);
        }

        record.payload = json!({
            "uid": uid,
            "email": user.get("email"),
            "email_verified": user.get("emailVerified").and_then(Value::as_bool).unwrap_or(false),
            "display_name": user.get("displayName"),
            "photo_url": user.get("photoUrl"),
            "phone_number": user.get("phoneNumber"),
            "disabled": user.get("disabled").and_then(Value::as_bool).unwrap_or(false),
            "creation_timestamp": millis(user.get("createdAt")),
            "last_sign_in_timestamp": millis(user.get("lastLoginAt")),
            "custom_claims": custom_claims,
            "provider_data": provider_data(user),
            "mfa_enrolled_factors": mfa,
        });
        Ok(record.with_meta("tenant_id", user.get("tenantId").cloned().unwrap_or(Value::Null)))
    }
}

/// Identity Toolkit sends epoch milliseconds as decimal strings.
fn millis(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => s.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
        Some(Value::Number(n)) => Value::Number(n.clone()),
        _ => Value::Null,
    }
}

fn provider_data(user: &Value) -> Vec<Value> {
    user.get("providerUserInfo")
        .and_then(Value::as_array)
        .map(|providers| {
            providers
                .iter()
                .map(|p| {
                    json!({
                        "provider_id": p.get("providerId"),
                        "uid": p.get("rawId"),
                        "email": p.get("email"),
                        "display_name": p.get("displayName"),
                        "photo_url": p.get("photoUrl"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn mfa_factors(user: &Value) -> Vec<Value> {
    user.get("mfaInfo")
        .and_then(Value::as_array)
        .map(|factors| {
            factors
                .iter()
                .map(|f| {
                    let factor_id = if f.get("phoneInfo").is_some() {
                        "phone"
                    } else if f.get("totpInfo").is_some() {
                        "totp"
                    } else {
                        "unknown"
                    };
                    json!({
                        "uid": f.get("mfaEnrollmentId"),
                        "display_name": f.get("displayName"),
                        "factor_id": factor_id,
                        "enrollment_time": f.get("enrolledAt"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl<A: DirectoryApi + ?Sized + 'static> SourceExporter for AuthExporter<A> {
    fn kind(&self) -> SourceKind {
        SourceKind::Auth
    }

    async fn next_batch(
        &self,
        cursor: Option<&Cursor>,
        batch_size: usize,
    ) -> Result<Batch, SourceError> {
        let page = self
            .api
            .list_users(batch_size, cursor.map(Cursor::as_str))
            .await?;
        let records = page
            .users
            .iter()
            .map(|u| self.to_record(u))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Batch::new(records, page.next_page_token.map(Cursor::new)))
    }

    fn summary_extras(&self) -> Map<String, Value> {
        let mut extras = Map::new();
        extras.insert(
            "users_with_mfa".into(),
            json!(self.with_mfa.load(Ordering::Relaxed)),
        );
        extras.insert(
            "users_with_custom_claims".into(),
            json!(self.with_custom_claims.load(Ordering::Relaxed)),
        );
        extras
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryPlatform;

    fn user(uid: &str) -> Value {
        json!({
            "localId": uid,
            "email": format!("{}@example.com", uid),
            "emailVerified": true,
            "createdAt": "1700000000000",
            "lastLoginAt": "1700000100000",
            "customAttributes": "{\"admin\":true}",
            "providerUserInfo": [
                {"providerId": "google.com", "rawId": "g-1", "email": "x@gmail.com"}
            ],
            "mfaInfo": [
                {"mfaEnrollmentId": "m1", "displayName": "phone", "phoneInfo": "+4700000000", "enrolledAt": "2024-01-01T00:00:00Z"}
            ],
            "passwordHash": "secret"
        })
    }

    #[tokio::test]
    async fn test_user_normalization() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.add_user(user("alice"));
        let exporter = AuthExporter::new(platform);

        let batch = exporter.next_batch(None, 10).await.unwrap();
        assert!(batch.is_last());
        let rec = &batch.records[0];
        assert_eq!(rec.id, "alice");
        assert_eq!(rec.payload["custom_claims"], json!({"admin": true}));
        assert_eq!(rec.payload["creation_timestamp"], json!(1_700_000_000_000i64));
        assert_eq!(rec.payload["provider_data"][0]["provider_id"], "google.com");
        assert_eq!(rec.payload["mfa_enrolled_factors"][0]["factor_id"], "phone");
        assert!(rec.payload.get("passwordHash").is_none());

        let extras = exporter.summary_extras();
        assert_eq!(extras["users_with_mfa"], 1);
    }

    #[tokio::test]
    async fn test_paging_by_token() {
        let platform = Arc::new(MemoryPlatform::new());
        for i in 0..5 {
            platform.add_user(json!({ "localId": format!("u{}", i) }));
        }
        let exporter = AuthExporter::new(platform);

        let first = exporter.next_batch(None, 2).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let second = exporter
            .next_batch(first.next_cursor.as_ref(), 2)
            .await
            .unwrap();
        assert_eq!(second.records[0].id, "u2");
        let third = exporter
            .next_batch(second.next_cursor.as_ref(), 2)
            .await
            .unwrap();
        assert_eq!(third.records.len(), 1);
        assert!(third.is_last());
    }

    #[tokio::test]
    async fn test_invalid_claims_kept_raw() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.add_user(json!({"localId": "bob", "customAttributes": "{broken"}));
        let exporter = AuthExporter::new(platform);

        let batch = exporter.next_batch(None, 10).await.unwrap();
        let rec = &batch.records[0];
        assert_eq!(rec.payload["custom_claims"], json!({}));
        assert_eq!(rec.metadata["custom_claims_raw"], "{broken");
    }
}

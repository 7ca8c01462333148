use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StorageError, StorageResult};

/// Session data obtained after launch, read by both storage backends to stamp
/// identity fields onto every record they write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PortalData {
    Authenticated(AuthenticatedPortalData),
    Anonymous(AnonymousPortalData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub app_name: String,
    pub source_key: String,
    #[serde(
        rename = "rawFirebaseJWT",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub raw_firebase_jwt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offering {
    pub id: u64,
    #[serde(default)]
    pub activity_url: Option<String>,
    #[serde(default)]
    pub rubric_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalJwt {
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl PortalJwt {
    /// Reads the claims of a raw JWT without verifying its signature; the
    /// portal remains the authority on validity, only `exp` is needed here.
    /// Expired tokens still decode so callers can report them as expired.
    pub fn from_raw(raw: &str) -> StorageResult<Self> {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;

        decode::<PortalJwt>(raw, &DecodingKey::from_secret(&[]), &validation)
            .map(|data| data.claims)
            .map_err(|e| StorageError::Portal(format!("portal JWT: {}", e)))
    }

    pub fn is_valid_at(&self, now_seconds: i64) -> bool {
        now_seconds < self.exp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedPortalData {
    pub context_id: String,
    pub database: DatabaseConfig,
    pub offering: Offering,
    pub platform_id: String,
    pub platform_user_id: String,
    pub resource_link_id: String,
    pub resource_url: String,
    pub tool_id: String,
    pub user_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_remote_endpoint: Option<String>,
    #[serde(rename = "portalJWT", default, skip_serializing_if = "Option::is_none")]
    pub portal_jwt: Option<PortalJwt>,
    #[serde(
        rename = "rawPortalJWT",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub raw_portal_jwt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousPortalData {
    pub database: DatabaseConfig,
    pub resource_url: String,
    pub tool_id: String,
    pub tool_user_id: String,
    pub user_type: String,
    pub run_key: String,
}

impl PortalData {
    pub fn database(&self) -> &DatabaseConfig {
        match self {
            PortalData::Authenticated(data) => &data.database,
            PortalData::Anonymous(data) => &data.database,
        }
    }

    pub fn source_key(&self) -> &str {
        &self.database().source_key
    }

    pub fn portal_jwt(&self) -> Option<&PortalJwt> {
        match self {
            PortalData::Authenticated(data) => data.portal_jwt.as_ref(),
            PortalData::Anonymous(_) => None,
        }
    }

    /// Decodes `rawPortalJWT` into `portalJWT` when only the raw token was supplied.
    pub fn decode_portal_jwt(&mut self) -> StorageResult<()> {
        if let PortalData::Authenticated(data) = self {
            if data.portal_jwt.is_none() {
                if let Some(raw) = &data.raw_portal_jwt {
                    data.portal_jwt = Some(PortalJwt::from_raw(raw)?);
                }
            }
        }
        Ok(())
    }

    /// Fields stamped onto every remote answer document.
    pub fn answer_identity(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("source_key".into(), self.source_key().into());
        match self {
            PortalData::Authenticated(data) => {
                fields.insert("resource_url".into(), data.resource_url.clone().into());
                fields.insert("tool_id".into(), data.tool_id.clone().into());
                fields.insert("platform_id".into(), data.platform_id.clone().into());
                fields.insert(
                    "platform_user_id".into(),
                    data.platform_user_id.clone().into(),
                );
                fields.insert("context_id".into(), data.context_id.clone().into());
                fields.insert(
                    "resource_link_id".into(),
                    data.resource_link_id.clone().into(),
                );
                fields.insert("run_key".into(), "".into());
                if let Some(endpoint) = &data.run_remote_endpoint {
                    fields.insert("remote_endpoint".into(), endpoint.clone().into());
                }
            }
            PortalData::Anonymous(data) => {
                fields.insert("resource_url".into(), data.resource_url.clone().into());
                fields.insert("tool_id".into(), data.tool_id.clone().into());
                fields.insert("tool_user_id".into(), data.tool_user_id.clone().into());
                fields.insert("platform_user_id".into(), data.run_key.clone().into());
                fields.insert("run_key".into(), data.run_key.clone().into());
            }
        }
        fields
    }

    /// Equality filters selecting this learner's documents.
    pub fn identity_filters(&self) -> Vec<(&'static str, Value)> {
        match self {
            PortalData::Authenticated(data) => vec![
                ("platform_id", data.platform_id.clone().into()),
                ("platform_user_id", data.platform_user_id.clone().into()),
                ("resource_link_id", data.resource_link_id.clone().into()),
            ],
            PortalData::Anonymous(data) => vec![("run_key", data.run_key.clone().into())],
        }
    }

    /// Per-learner suffix used for documents keyed by something other than a
    /// random id (plugin states).
    pub fn learner_key(&self) -> String {
        match self {
            PortalData::Authenticated(data) => {
                format!("{}-{}", data.platform_user_id, data.resource_link_id)
            }
            PortalData::Anonymous(data) => data.run_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_authenticated_portal_data() {
        let data: PortalData = serde_json::from_value(json!({
            "type": "authenticated",
            "contextId": "ctx-1",
            "database": {
                "appName": "report-service-dev",
                "sourceKey": "authoring.example.org",
                "rawFirebaseJWT": "abc.def.ghi"
            },
            "offering": { "id": 42 },
            "platformId": "https://portal.example.org",
            "platformUserId": "7",
            "resourceLinkId": "99",
            "resourceUrl": "https://authoring.example.org/activities/1",
            "toolId": "activity-player",
            "userType": "learner",
            "portalJWT": { "exp": 2000000000, "uid": 7 }
        }))
        .unwrap();

        assert_eq!(data.source_key(), "authoring.example.org");
        let jwt = data.portal_jwt().unwrap();
        assert_eq!(jwt.exp, 2_000_000_000);
        assert_eq!(jwt.claims["uid"], 7);
        assert_eq!(data.learner_key(), "7-99");
    }

    #[test]
    fn anonymous_identity_uses_run_key() {
        let data: PortalData = serde_json::from_value(json!({
            "type": "anonymous",
            "database": { "appName": "report-service-dev", "sourceKey": "local" },
            "resourceUrl": "https://authoring.example.org/activities/1",
            "toolId": "activity-player",
            "toolUserId": "anonymous",
            "userType": "learner",
            "runKey": "run-123"
        }))
        .unwrap();

        let identity = data.answer_identity();
        assert_eq!(identity["run_key"], "run-123");
        assert_eq!(identity["platform_user_id"], "run-123");
        assert_eq!(data.identity_filters(), vec![("run_key", json!("run-123"))]);
        assert!(data.portal_jwt().is_none());
    }

    fn signed(claims: Value) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"portal-secret"),
        )
        .unwrap()
    }

    #[test]
    fn decodes_raw_portal_jwt_payload() {
        let raw = signed(json!({ "exp": 1700000000, "domain": "portal" }));
        let jwt = PortalJwt::from_raw(&raw).unwrap();
        assert_eq!(jwt.exp, 1_700_000_000);
        assert_eq!(jwt.claims["domain"], "portal");
        assert!(jwt.is_valid_at(1_699_999_999));
        assert!(!jwt.is_valid_at(1_700_000_000));
    }

    #[test]
    fn decodes_token_signed_with_unknown_key_and_audience() {
        let raw = signed(json!({ "exp": 1, "aud": "learn-portal" }));
        let jwt = PortalJwt::from_raw(&raw).unwrap();
        assert_eq!(jwt.exp, 1);
        assert_eq!(jwt.claims["aud"], "learn-portal");
    }

    #[test]
    fn rejects_malformed_jwt() {
        assert!(PortalJwt::from_raw("not-a-jwt").is_err());
        assert!(PortalJwt::from_raw(&signed(json!({ "uid": 7 }))).is_err());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Structure for the FCM message payload
// See: https://firebase.google.com/docs/reference/fcm/rest/v1/projects.messages#Message
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FcmPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<FcmNotification>,
    pub data: Option<HashMap<String, String>>,

    /// Android delivery overrides (priority, notification channel).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub android: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct FcmNotification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// A purchase request as stored in the `orders` collection.
///
/// Every field is optional: orders are written by an external workflow and
/// missing values are defaulted when the notification is built.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(default)]
    pub farmer_id: Option<String>,
    #[serde(default)]
    pub buyer_name: Option<String>,
    #[serde(default)]
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Decodes an order from a document field map, tolerating fields of the
    /// wrong type by treating them as absent.
    pub fn from_fields(fields: &serde_json::Map<String, serde_json::Value>) -> Self {
        Order {
            farmer_id: fields
                .get("farmerId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            buyer_name: fields
                .get("buyerName")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            total_amount: fields.get("totalAmount").and_then(|v| v.as_f64()),
            created_at: fields
                .get("createdAt")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// A farmer's user profile from the `users` collection.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FarmerProfile {
    #[serde(default)]
    pub fcm_token: Option<String>,
}

impl FarmerProfile {
    pub fn from_fields(fields: &serde_json::Map<String, serde_json::Value>) -> Self {
        FarmerProfile {
            fcm_token: fields
                .get("fcmToken")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }

    /// The push token, if present and non-empty.
    pub fn push_token(&self) -> Option<&str> {
        self.fcm_token.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// One entry of a change batch delivered by the order subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub id: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// All changes observed between two consecutive snapshots.
pub type ChangeBatch = Vec<DocumentChange>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_order_from_fields() {
        let order = Order::from_fields(&fields(json!({
            "farmerId": "f1",
            "buyerName": "Asha",
            "totalAmount": 250,
            "createdAt": "2026-10-19T08:30:00Z"
        })));

        assert_eq!(order.farmer_id.as_deref(), Some("f1"));
        assert_eq!(order.buyer_name.as_deref(), Some("Asha"));
        assert_eq!(order.total_amount, Some(250.0));
        assert_eq!(
            order.created_at.map(|t| t.to_rfc3339()),
            Some("2026-10-19T08:30:00+00:00".to_string())
        );
    }

    #[test]
    fn test_order_wrong_types_are_absent() {
        let order = Order::from_fields(&fields(json!({
            "farmerId": 42,
            "totalAmount": "lots"
        })));

        assert_eq!(order, Order::default());
    }

    #[test]
    fn test_empty_token_is_no_token() {
        let profile = FarmerProfile::from_fields(&fields(json!({ "fcmToken": "" })));
        assert_eq!(profile.push_token(), None);

        let profile = FarmerProfile::from_fields(&fields(json!({ "name": "Ravi" })));
        assert_eq!(profile.push_token(), None);

        let profile = FarmerProfile::from_fields(&fields(json!({ "fcmToken": "tok123" })));
        assert_eq!(profile.push_token(), Some("tok123"));
    }
}

//! Stored form of a feature flag definition.
//!
//! The engine never evaluates rules, so conditions are typed only as far as
//! needed to discover segment references; everything else — treatments,
//! partitions, seeds — rides along opaquely and is preserved byte-for-byte
//! through a sync cycle.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a split as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitStatus {
    Active,
    Archived,
    /// Statuses this version does not know about. Treated as active so an
    /// unknown status never deletes a flag from the cache.
    #[serde(other)]
    Unknown,
}

/// A feature flag definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub name: String,
    #[serde(default)]
    pub traffic_type_name: String,
    #[serde(default = "default_status")]
    pub status: SplitStatus,
    #[serde(default)]
    pub killed: bool,
    #[serde(default)]
    pub default_treatment: String,
    #[serde(default = "default_change_number")]
    pub change_number: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Fields the engine does not interpret (seed, algo, treatments, ...).
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

fn default_status() -> SplitStatus {
    SplitStatus::Active
}

fn default_change_number() -> i64 {
    -1
}

impl Split {
    pub fn is_archived(&self) -> bool {
        self.status == SplitStatus::Archived
    }

    /// Names of segments referenced by `IN_SEGMENT` matchers.
    pub fn segment_names(&self) -> Vec<String> {
        self.conditions
            .iter()
            .flat_map(|c| c.matcher_group.matchers.iter())
            .filter(|m| m.matcher_type == "IN_SEGMENT")
            .filter_map(|m| m.user_defined_segment_matcher_data.as_ref())
            .map(|d| d.segment_name.clone())
            .collect()
    }

    pub fn uses_segments(&self) -> bool {
        self.conditions
            .iter()
            .flat_map(|c| c.matcher_group.matchers.iter())
            .any(|m| m.matcher_type == "IN_SEGMENT")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub matcher_group: MatcherGroup,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherGroup {
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    #[serde(default)]
    pub matcher_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_defined_segment_matcher_data: Option<SegmentMatcherData>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMatcherData {
    pub segment_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_json(name: &str, matcher_type: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "trafficTypeName": "user",
            "status": "ACTIVE",
            "killed": false,
            "defaultTreatment": "off",
            "changeNumber": 100,
            "seed": 12345,
            "conditions": [{
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{
                        "matcherType": matcher_type,
                        "userDefinedSegmentMatcherData": { "segmentName": "beta_users" }
                    }]
                },
                "partitions": [{ "treatment": "on", "size": 100 }]
            }]
        })
    }

    #[test]
    fn segment_references_are_discovered() {
        let split: Split = serde_json::from_value(split_json("s1", "IN_SEGMENT")).unwrap();
        assert!(split.uses_segments());
        assert_eq!(split.segment_names(), vec!["beta_users".to_string()]);
    }

    #[test]
    fn non_segment_matchers_do_not_register() {
        let split: Split = serde_json::from_value(split_json("s1", "ALL_KEYS")).unwrap();
        assert!(!split.uses_segments());
        assert!(split.segment_names().is_empty());
    }

    #[test]
    fn unknown_status_is_not_archived() {
        let mut value = split_json("s1", "ALL_KEYS");
        value["status"] = serde_json::json!("SOMETHING_NEW");
        let split: Split = serde_json::from_value(value).unwrap();
        assert_eq!(split.status, SplitStatus::Unknown);
        assert!(!split.is_archived());
    }

    #[test]
    fn opaque_fields_round_trip() {
        let split: Split = serde_json::from_value(split_json("s1", "ALL_KEYS")).unwrap();
        let back = serde_json::to_value(&split).unwrap();
        assert_eq!(back["seed"], serde_json::json!(12345));
        assert_eq!(back["conditions"][0]["partitions"][0]["treatment"], "on");
    }
}

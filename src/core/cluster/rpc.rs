//! Stateless request/response boundary for duplicate detection.
//!
//! Takes the full list of media items plus a distance threshold and returns
//! both group arrays. Transport-agnostic: the CLI reads the request as JSON,
//! any server can do the same.
//!
//! ```json
//! { "mediaItems": [{ "id": "1", "visual_hash": "f0f0..." }], "maxHammingDistance": 10 }
//! ```

use super::{ClusterKind, DuplicateCluster, DuplicateClusterer};
use crate::core::comparator::{
    HashComparator, SimilarityThresholds, SimilarityTier, DEFAULT_MAX_DISTANCE,
};
use crate::core::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_max_distance() -> u32 {
    DEFAULT_MAX_DISTANCE
}

/// One media item as supplied by the caller.
///
/// Fields other than `id` and the hash are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_hash: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDuplicatesRequest {
    pub media_items: Vec<CandidateItem>,
    #[serde(default = "default_max_distance")]
    pub max_hamming_distance: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDto {
    pub hash: String,
    pub items: Vec<CandidateItem>,
    pub similarity: SimilarityTier,
    pub hamming_distance: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDuplicatesResponse {
    pub exact_groups: Vec<GroupDto>,
    pub similar_groups: Vec<GroupDto>,
    /// Items without a usable hash
    pub skipped: usize,
}

/// Cluster the request's items.
///
/// Items with a missing or malformed hash are skipped and counted.
pub fn process_duplicates(
    request: &ProcessDuplicatesRequest,
    thresholds: SimilarityThresholds,
) -> ProcessDuplicatesResponse {
    let mut skipped = 0;
    let candidates: Vec<(usize, Fingerprint)> = request
        .media_items
        .iter()
        .enumerate()
        .filter_map(|(position, item)| {
            let parsed = item.visual_hash.as_deref().map(Fingerprint::parse);
            match parsed {
                Some(Ok(fingerprint)) => Some((position, fingerprint)),
                Some(Err(e)) => {
                    tracing::debug!("Skipping item {} with bad hash: {}", item.id, e);
                    skipped += 1;
                    None
                }
                None => {
                    skipped += 1;
                    None
                }
            }
        })
        .collect();

    let clusterer =
        DuplicateClusterer::new(HashComparator::new(thresholds, request.max_hamming_distance));
    let result = clusterer.cluster(&candidates);

    let to_dto = |group: &DuplicateCluster<usize>| GroupDto {
        hash: group.key.clone(),
        items: group
            .members
            .iter()
            .map(|&position| request.media_items[position].clone())
            .collect(),
        similarity: group.tier,
        hamming_distance: match group.kind {
            ClusterKind::Exact => 0,
            ClusterKind::Near => group.min_distance,
        },
    };

    ProcessDuplicatesResponse {
        exact_groups: result.exact_groups.iter().map(to_dto).collect(),
        similar_groups: result.near_groups.iter().map(to_dto).collect(),
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_keeps_extra_fields_and_defaults_distance() {
        let request: ProcessDuplicatesRequest = serde_json::from_str(
            r#"{ "mediaItems": [{ "id": "1", "visual_hash": "ab", "path": "/a.jpg" }] }"#,
        )
        .unwrap();

        assert_eq!(request.max_hamming_distance, 10);
        assert_eq!(request.media_items[0].visual_hash.as_deref(), Some("ab"));
        assert_eq!(request.media_items[0].extra["path"], "/a.jpg");
    }

    #[test]
    fn returns_both_group_arrays() {
        let request: ProcessDuplicatesRequest = serde_json::from_value(serde_json::json!({
            "mediaItems": [
                { "id": "a", "visual_hash": "0000000000000000" },
                { "id": "b", "visual_hash": "0000000000000000" },
                { "id": "c", "visual_hash": "ffffffffffffffff" },
                { "id": "d", "visual_hash": "fffffffffffffffe" },
                { "id": "e" },
                { "id": "f", "visual_hash": "not-hex" }
            ],
            "maxHammingDistance": 4
        }))
        .unwrap();

        let response = process_duplicates(&request, SimilarityThresholds::default());

        assert_eq!(response.skipped, 2);
        assert_eq!(response.exact_groups.len(), 1);
        assert_eq!(response.exact_groups[0].hash, "0000000000000000");
        assert_eq!(response.exact_groups[0].similarity, SimilarityTier::Exact);
        assert_eq!(response.similar_groups.len(), 1);
        assert_eq!(response.similar_groups[0].hash, "similar_ffffffffffffffff");
        assert_eq!(response.similar_groups[0].hamming_distance, 1);

        let ids: Vec<&str> = response.similar_groups[0]
            .items
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[test]
    fn response_serialises_in_camel_case() {
        let response = ProcessDuplicatesResponse {
            exact_groups: Vec::new(),
            similar_groups: Vec::new(),
            skipped: 0,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("exactGroups").is_some());
        assert!(json.get("similarGroups").is_some());
    }
}

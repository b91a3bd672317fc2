//! Filter builders translating [`ScopeFilter`] into Qdrant's filter JSON.

use crate::index::{ScopeFilter, Visibility};
use serde_json::{Value, json};
use uuid::Uuid;

/// Compose the filter enforcing organization, visibility, kind and the processed flag.
///
/// Every search against the collection goes through this function.
pub fn build_scope_filter(filter: &ScopeFilter) -> Value {
    let mut must = vec![
        match_value("organization_id", json!(filter.scope.organization_id)),
        match_value("processed", json!(true)),
    ];

    if let Some(kind) = filter.kinds.only() {
        must.push(match_value("artifact_kind", json!(kind.as_str())));
    }

    if let Some(artifact_id) = filter.artifact_id {
        must.push(match_value("artifact_id", json!(artifact_id)));
    }

    match filter.scope.visibility {
        Visibility::Organization => {}
        Visibility::Division(Some(division_id)) => must.push(json!({
            "should": [
                match_value("division_id", json!(division_id)),
                { "is_null": { "key": "division_id" } }
            ]
        })),
        Visibility::Division(None) => must.push(json!({
            "is_null": { "key": "division_id" }
        })),
    }

    json!({ "must": must })
}

/// Filter selecting every point of one artifact, regardless of visibility.
pub fn artifact_filter(artifact_id: Uuid) -> Value {
    json!({ "must": [match_value("artifact_id", json!(artifact_id))] })
}

fn match_value(key: &str, value: Value) -> Value {
    json!({ "key": key, "match": { "value": value } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ArtifactKinds, Scope};

    const ORG: Uuid = Uuid::from_u128(1);
    const DIVISION: Uuid = Uuid::from_u128(10);

    #[test]
    fn organization_scope_has_no_division_clause() {
        let filter = ScopeFilter::new(Scope::organization(ORG), ArtifactKinds::All);
        assert_eq!(
            build_scope_filter(&filter),
            json!({
                "must": [
                    { "key": "organization_id", "match": { "value": ORG.to_string() } },
                    { "key": "processed", "match": { "value": true } }
                ]
            })
        );
    }

    #[test]
    fn division_scope_admits_own_division_or_organization_wide() {
        let filter = ScopeFilter::new(
            Scope {
                organization_id: ORG,
                visibility: Visibility::Division(Some(DIVISION)),
            },
            ArtifactKinds::Documents,
        );
        assert_eq!(
            build_scope_filter(&filter),
            json!({
                "must": [
                    { "key": "organization_id", "match": { "value": ORG.to_string() } },
                    { "key": "processed", "match": { "value": true } },
                    { "key": "artifact_kind", "match": { "value": "document" } },
                    {
                        "should": [
                            { "key": "division_id", "match": { "value": DIVISION.to_string() } },
                            { "is_null": { "key": "division_id" } }
                        ]
                    }
                ]
            })
        );
    }

    #[test]
    fn every_kind_variant_carries_the_same_division_clause() {
        let scope = Scope {
            organization_id: ORG,
            visibility: Visibility::Division(Some(DIVISION)),
        };
        let division_clause = |kinds| {
            let value = build_scope_filter(&ScopeFilter::new(scope, kinds));
            value["must"]
                .as_array()
                .and_then(|clauses| clauses.last().cloned())
                .expect("division clause")
        };
        let all = division_clause(ArtifactKinds::All);
        assert_eq!(division_clause(ArtifactKinds::Documents), all);
        assert_eq!(division_clause(ArtifactKinds::Articles), all);
    }
}

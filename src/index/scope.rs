//! Visibility scoping for retrieval.
//!
//! [`Scope::for_caller`] is the only place that decides what a caller may see. Every query
//! variant carries the resulting [`ScopeFilter`], which the index backends translate
//! mechanically: [`ScopeFilter::admits`] for in-process evaluation and
//! [`crate::index::qdrant::build_scope_filter`] for Qdrant.

use crate::catalog::{ArtifactKind, CallerIdentity, OrganizationPolicy, Role};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which divisions of the organization are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Every artifact of the organization.
    Organization,
    /// Artifacts of one division plus organization-wide artifacts. A caller without a division
    /// only sees organization-wide artifacts.
    Division(Option<Uuid>),
}

/// Organization plus visibility resolved for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    /// Tenant being queried.
    pub organization_id: Uuid,
    /// Which divisions are visible.
    pub visibility: Visibility,
}

impl Scope {
    /// Resolve the scope of a caller under their organization's policy.
    ///
    /// Members are always division-scoped. Managers are division-scoped unless the organization
    /// enabled cross-division querying. Admins and owners see the whole organization.
    pub fn for_caller(caller: &CallerIdentity, policy: &OrganizationPolicy) -> Self {
        let division_scoped = match caller.role {
            Role::Member => true,
            Role::Manager => !policy.cross_division_query,
            Role::Admin | Role::Owner => false,
        };
        let visibility = if division_scoped {
            Visibility::Division(caller.division_id)
        } else {
            Visibility::Organization
        };
        Self {
            organization_id: caller.organization_id,
            visibility,
        }
    }

    /// Whole-organization scope, used when the artifact itself is already authorized.
    pub fn organization(organization_id: Uuid) -> Self {
        Self {
            organization_id,
            visibility: Visibility::Organization,
        }
    }

    /// Whether an artifact owned by `organization_id`/`division_id` is visible.
    pub fn admits(&self, organization_id: Uuid, division_id: Option<Uuid>) -> bool {
        if organization_id != self.organization_id {
            return false;
        }
        match (self.visibility, division_id) {
            (Visibility::Organization, _) => true,
            (Visibility::Division(_), None) => true,
            (Visibility::Division(own), Some(division)) => own == Some(division),
        }
    }
}

/// Artifact kinds a query should cover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKinds {
    /// Documents and articles.
    #[default]
    All,
    /// Uploaded documents only.
    Documents,
    /// Published articles only.
    Articles,
}

impl ArtifactKinds {
    /// The single kind to match, or `None` for both.
    pub fn only(self) -> Option<ArtifactKind> {
        match self {
            Self::All => None,
            Self::Documents => Some(ArtifactKind::Document),
            Self::Articles => Some(ArtifactKind::Article),
        }
    }

    /// Whether `kind` is covered.
    pub fn includes(self, kind: ArtifactKind) -> bool {
        self.only().is_none_or(|only| only == kind)
    }
}

/// Complete restriction applied to every index query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeFilter {
    /// Tenant and visibility.
    pub scope: Scope,
    /// Artifact kinds admitted.
    pub kinds: ArtifactKinds,
    /// Restrict to one artifact.
    pub artifact_id: Option<Uuid>,
}

impl ScopeFilter {
    /// Filter for a caller-scoped query over the given kinds.
    pub fn new(scope: Scope, kinds: ArtifactKinds) -> Self {
        Self {
            scope,
            kinds,
            artifact_id: None,
        }
    }

    /// Filter for one artifact of an organization.
    pub fn artifact(organization_id: Uuid, artifact_id: Uuid) -> Self {
        Self {
            scope: Scope::organization(organization_id),
            kinds: ArtifactKinds::All,
            artifact_id: Some(artifact_id),
        }
    }

    /// Evaluate the filter against a chunk's denormalized fields. Unprocessed chunks never match.
    pub fn admits(
        &self,
        organization_id: Uuid,
        division_id: Option<Uuid>,
        kind: ArtifactKind,
        artifact_id: Uuid,
        processed: bool,
    ) -> bool {
        processed
            && self.scope.admits(organization_id, division_id)
            && self.kinds.includes(kind)
            && self.artifact_id.is_none_or(|only| only == artifact_id)
    }
}

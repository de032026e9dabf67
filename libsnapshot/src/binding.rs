//! Request/content binding rules.
//!
//! A request and a content are *bound* when four facts agree:
//!
//! 1. the request's status names the content,
//! 2. the content's reference names the request (namespace and name),
//! 3. the content's reference carries the request's UID,
//! 4. the request's UID is non-empty.
//!
//! Everything here is pure; the controller performs the store writes.

use crate::types::{SnapshotContent, SnapshotRequest};

/// Whether `request` and `content` are mutually and correctly bound.
pub fn is_bound(request: &SnapshotRequest, content: &SnapshotContent) -> bool {
    let uid = &request.metadata.uid;
    if uid.is_empty() || request.bound_content_name() != Some(content.metadata.name.as_str()) {
        return false;
    }
    content.spec.request_ref.as_ref().is_some_and(|r| {
        r.name == request.metadata.name && r.namespace == request.namespace() && r.uid == *uid
    })
}

/// Whether the content's reference points at `request`.  An empty reference
/// UID matches any request with that namespace and name.
pub fn refers_to(content: &SnapshotContent, request: &SnapshotRequest) -> bool {
    content.spec.request_ref.as_ref().is_some_and(|r| {
        r.name == request.metadata.name
            && r.namespace == request.namespace()
            && (r.uid.is_empty() || r.uid == request.metadata.uid)
    })
}

/// Find a content that already belongs to `request`: its reference carries
/// the request's namespace, name and UID, and its class matches unless the
/// request leaves the class unset.
pub fn find_matching_content<'a, I>(
    request: &SnapshotRequest,
    contents: I,
) -> Option<SnapshotContent>
where
    I: IntoIterator<Item = &'a SnapshotContent>,
{
    if request.metadata.uid.is_empty() {
        return None;
    }
    contents
        .into_iter()
        .find(|content| {
            let Some(r) = content.spec.request_ref.as_ref() else {
                return false;
            };
            r.uid == request.metadata.uid
                && r.name == request.metadata.name
                && r.namespace == request.namespace()
                && match request.spec.snapshot_class_name.as_deref() {
                    None => true,
                    Some(class) => content.spec.snapshot_class_name.as_deref() == Some(class),
                }
        })
        .cloned()
}

/// Outcome of checking whether a request may bind a content it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    /// The content's reference already carries the request's UID.
    AlreadyBound,
    /// The content is pre-bound by name only; the controller may write the
    /// request's UID into it.
    Claim,
    /// The content belongs to someone else.
    Mismatch(String),
}

/// Decide whether `request` may bind `content`.
pub fn check_content_claim(
    request: &SnapshotRequest,
    content: &SnapshotContent,
) -> ClaimDecision {
    let Some(r) = content.spec.request_ref.as_ref() else {
        return ClaimDecision::Mismatch(format!(
            "content {} does not reference any snapshot request",
            content.metadata.name
        ));
    };
    if r.name != request.metadata.name || r.namespace != request.namespace() {
        return ClaimDecision::Mismatch(format!(
            "content {} references {}/{}, not {}/{}",
            content.metadata.name,
            r.namespace,
            r.name,
            request.namespace(),
            request.metadata.name
        ));
    }
    if r.uid.is_empty() {
        return ClaimDecision::Claim;
    }
    if r.uid != request.metadata.uid {
        return ClaimDecision::Mismatch(format!(
            "content {} is bound to another snapshot request with uid {}",
            content.metadata.name, r.uid
        ));
    }
    ClaimDecision::AlreadyBound
}

/// Where a request stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Deletion was requested.
    Deleting,
    /// No content is named yet.
    Fresh,
    /// A content is named but does not exist (yet).
    AwaitingContent,
    /// A content is named and exists; binding or readiness pending.
    Binding,
    /// Ready and correctly bound.
    Ready,
    /// Ready but the binding no longer holds.
    Misbound,
    /// Ready but the bound content is gone.
    Lost,
}

/// Classify `request` given the content it points at, if any.
pub fn classify(request: &SnapshotRequest, content: Option<&SnapshotContent>) -> RequestState {
    if request.metadata.is_being_deleted() {
        return RequestState::Deleting;
    }
    if request.target_content_name().is_none() {
        return RequestState::Fresh;
    }
    match (request.is_ready(), content) {
        (true, None) => RequestState::Lost,
        (true, Some(content)) if is_bound(request, content) => RequestState::Ready,
        (true, Some(_)) => RequestState::Misbound,
        (false, None) => RequestState::AwaitingContent,
        (false, Some(_)) => RequestState::Binding,
    }
}

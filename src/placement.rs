//! Deployment placement.
//!
//! A pure decision function over a point-in-time snapshot of the tracked
//! endpoints. Deliberately simple: an explicitly requested host wins,
//! otherwise the choice is uniformly random with no load-awareness or
//! affinity. A pluggable strategy can replace [`choose`] without touching
//! the surrounding contract.

use rand::seq::IndexedRandom;

/// Placement errors. Always surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    /// The explicitly requested host is not a tracked endpoint.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// No endpoint is available to place on.
    #[error("no host available for deployment")]
    NoHostAvailable,
}

/// Choose an endpoint for a new deployment.
///
/// # Errors
///
/// Returns [`PlacementError::UnknownEndpoint`] if `explicit` names an
/// endpoint outside `endpoints`, or [`PlacementError::NoHostAvailable`]
/// when no explicit host is given and `endpoints` is empty.
pub fn choose(endpoints: &[String], explicit: Option<&str>) -> Result<String, PlacementError> {
    if let Some(host) = explicit {
        if !endpoints.iter().any(|e| e == host) {
            return Err(PlacementError::UnknownEndpoint(host.to_string()));
        }
        return Ok(host.to_string());
    }

    endpoints
        .choose(&mut rand::rng())
        .cloned()
        .ok_or(PlacementError::NoHostAvailable)
}

use super::error::ResolveError;
use crate::models::{normalize_plate, Vehicle};
use crate::store::VehicleDirectory;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Upper bound on "contains" candidates considered during fuzzy lookup.
pub const FUZZY_CANDIDATE_LIMIT: usize = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    CaseInsensitive,
    Contains,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    /// Canonical plate of the matched vehicle; also the media channel.
    pub plate: String,
    pub owner_id: String,
    pub matched_by: MatchKind,
    pub vehicle: Vehicle,
}

#[derive(Clone)]
pub struct PlateResolver {
    directory: Arc<dyn VehicleDirectory>,
}

/// Among fuzzy candidates prefer one that is active and owned, then any owned
/// one, then the first. A row without an owner never wins over one with.
pub fn pick_candidate(candidates: Vec<Vehicle>) -> Option<Vehicle> {
    if let Some(i) = candidates.iter().position(|v| v.active && v.has_owner()) {
        return candidates.into_iter().nth(i);
    }
    if let Some(i) = candidates.iter().position(|v| v.has_owner()) {
        return candidates.into_iter().nth(i);
    }
    candidates.into_iter().next()
}

impl PlateResolver {
    pub fn new(directory: Arc<dyn VehicleDirectory>) -> Self {
        Self { directory }
    }

    /// Read-only: exact, then case-insensitive, then bounded "contains", all
    /// restricted to active vehicles. First hit wins.
    pub async fn resolve(&self, raw: &str) -> Result<Resolution, ResolveError> {
        let plate = normalize_plate(raw);
        if plate.is_empty() {
            return Err(ResolveError::EmptyPlate);
        }

        let found = match self
            .directory
            .find_exact(&plate, true)
            .await
            .map_err(ResolveError::Lookup)?
        {
            Some(v) => Some((v, MatchKind::Exact)),
            None => match self
                .directory
                .find_case_insensitive(&plate, true)
                .await
                .map_err(ResolveError::Lookup)?
            {
                Some(v) => Some((v, MatchKind::CaseInsensitive)),
                None => pick_candidate(
                    self.directory
                        .find_containing(&plate, true, FUZZY_CANDIDATE_LIMIT)
                        .await
                        .map_err(ResolveError::Lookup)?,
                )
                .map(|v| (v, MatchKind::Contains)),
            },
        };

        let Some((vehicle, matched_by)) = found else {
            return Err(self.explain_miss(raw, plate).await);
        };

        let canonical = normalize_plate(&vehicle.plate);
        if !vehicle.active {
            return Err(ResolveError::Disabled { plate: canonical });
        }
        let owner_id = match vehicle.owner_id.as_deref().map(str::trim) {
            Some(owner) if !owner.is_empty() => owner.to_string(),
            _ => return Err(ResolveError::NoOwner { plate: canonical }),
        };
        debug!(plate = canonical, owner_id, ?matched_by, "plate resolved");
        Ok(Resolution {
            plate: canonical,
            owner_id,
            matched_by,
            vehicle,
        })
    }

    /// No active match. An inactive row for the same plate means the vehicle
    /// exists but is switched off, which callers must see as "disabled".
    async fn explain_miss(&self, raw: &str, plate: String) -> ResolveError {
        let inactive = match self.directory.find_exact(&plate, false).await {
            Ok(Some(v)) => Some(v),
            Ok(None) => match self.directory.find_case_insensitive(&plate, false).await {
                Ok(found) => found,
                Err(e) => return ResolveError::Lookup(e),
            },
            Err(e) => return ResolveError::Lookup(e),
        };
        match inactive {
            Some(v) if !v.active => ResolveError::Disabled {
                plate: normalize_plate(&v.plate),
            },
            _ => ResolveError::NotFound {
                raw: raw.to_string(),
                plate,
            },
        }
    }
}

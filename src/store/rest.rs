use super::{CallStore, StoreError, TransitionOutcome, VehicleDirectory};
use crate::models::{CallSession, CallStatus, NewCallSession, Vehicle};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::debug;

const VEHICLES: &str = "vehicles";
const CALL_SESSIONS: &str = "call_sessions";
const VEHICLE_COLUMNS: &str = "plate,owner_id,active";

/// Hosted relational backend spoken over its PostgREST-style HTTP API.
pub struct RestStore {
    base_url: String,
    key: String,
    client: Client,
}

impl RestStore {
    pub fn new(base_url: &str, key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            client: Client::new(),
        }
    }

    fn table_url(&self, table: &str, filters: &[(&str, String)]) -> String {
        let mut url = format!("{}/{}", self.base_url, table);
        for (i, (name, value)) in filters.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(name);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
    }

    async fn rows<T: DeserializeOwned>(response: Response) -> Result<Vec<T>, StoreError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!("{}: {}", status, body)));
        }
        Ok(response.json::<Vec<T>>().await?)
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let url = self.table_url(table, filters);
        debug!(url, "rest select");
        let response = self.authorize(self.client.get(&url)).send().await?;
        Self::rows(response).await
    }

    async fn select_vehicles(
        &self,
        plate_filter: String,
        active_only: bool,
        limit: usize,
    ) -> Result<Vec<Vehicle>, StoreError> {
        let mut filters = vec![
            ("select", VEHICLE_COLUMNS.to_string()),
            ("plate", plate_filter),
        ];
        if active_only {
            filters.push(("active", "eq.true".to_string()));
        }
        filters.push(("limit", limit.to_string()));
        self.select(VEHICLES, &filters).await
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `*`, `%` and `_` are wildcards inside `ilike`; plates never legitimately
/// contain them.
fn ilike_literal(value: &str) -> String {
    value.replace(['*', '%', '_'], "")
}

#[async_trait]
impl VehicleDirectory for RestStore {
    async fn find_exact(
        &self,
        plate: &str,
        active_only: bool,
    ) -> Result<Option<Vehicle>, StoreError> {
        Ok(self
            .select_vehicles(format!("eq.{}", plate), active_only, 1)
            .await?
            .into_iter()
            .next())
    }

    async fn find_case_insensitive(
        &self,
        plate: &str,
        active_only: bool,
    ) -> Result<Option<Vehicle>, StoreError> {
        Ok(self
            .select_vehicles(format!("ilike.{}", ilike_literal(plate)), active_only, 1)
            .await?
            .into_iter()
            .next())
    }

    async fn find_containing(
        &self,
        fragment: &str,
        active_only: bool,
        limit: usize,
    ) -> Result<Vec<Vehicle>, StoreError> {
        self.select_vehicles(
            format!("ilike.*{}*", ilike_literal(fragment)),
            active_only,
            limit,
        )
        .await
    }
}

#[async_trait]
impl CallStore for RestStore {
    async fn insert(&self, new: NewCallSession) -> Result<CallSession, StoreError> {
        let row = new.into_session(Utc::now());
        let url = self.table_url(CALL_SESSIONS, &[("select", "*".to_string())]);
        let response = self
            .authorize(self.client.post(&url))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        Self::rows::<CallSession>(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend("insert returned no row".to_string()))
    }

    async fn get(&self, id: &str) -> Result<Option<CallSession>, StoreError> {
        Ok(self
            .select::<CallSession>(
                CALL_SESSIONS,
                &[
                    ("select", "*".to_string()),
                    ("id", format!("eq.{}", id)),
                    ("limit", "1".to_string()),
                ],
            )
            .await?
            .into_iter()
            .next())
    }

    async fn transition(
        &self,
        id: &str,
        next: CallStatus,
    ) -> Result<TransitionOutcome, StoreError> {
        let sources = CallStatus::sources_for(next)
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let now = timestamp(Utc::now());
        let mut patch = Map::new();
        patch.insert("status".to_string(), json!(next));
        match next {
            CallStatus::Accepted => {
                patch.insert("accepted_at".to_string(), json!(now));
            }
            CallStatus::Ended => {
                patch.insert("ended_at".to_string(), json!(now));
            }
            _ => {}
        }

        // the status guard in the filter makes this a first-write-wins update
        let url = self.table_url(
            CALL_SESSIONS,
            &[
                ("id", format!("eq.{}", id)),
                ("status", format!("in.({})", sources)),
                ("select", "*".to_string()),
            ],
        );
        let response = self
            .authorize(self.client.patch(&url))
            .header("Prefer", "return=representation")
            .json(&Value::Object(patch))
            .send()
            .await?;
        if let Some(row) = Self::rows::<CallSession>(response).await?.into_iter().next() {
            return Ok(TransitionOutcome::Applied(row));
        }
        match self.get(id).await? {
            Some(row) => Ok(TransitionOutcome::Unchanged(row)),
            None => Err(StoreError::SessionNotFound(id.to_string())),
        }
    }

    async fn latest_ringing(
        &self,
        owner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CallSession>, StoreError> {
        Ok(self
            .select::<CallSession>(
                CALL_SESSIONS,
                &[
                    ("select", "*".to_string()),
                    ("owner_id", format!("eq.{}", owner_id)),
                    ("status", "eq.ringing".to_string()),
                    ("created_at", format!("gt.{}", timestamp(since))),
                    ("order", "created_at.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?
            .into_iter()
            .next())
    }

    async fn ringing_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallSession>, StoreError> {
        self.select(
            CALL_SESSIONS,
            &[
                ("select", "*".to_string()),
                ("status", "eq.ringing".to_string()),
                ("created_at", format!("lt.{}", timestamp(cutoff))),
                ("order", "created_at.asc".to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_url_encodes_filters() {
        let store = RestStore::new("https://db.example.com/rest/v1/", "k");
        let url = store.table_url(
            "vehicles",
            &[
                ("select", VEHICLE_COLUMNS.to_string()),
                ("plate", "ilike.*UP 14*".to_string()),
            ],
        );
        assert_eq!(
            url,
            "https://db.example.com/rest/v1/vehicles?select=plate%2Cowner_id%2Cactive&plate=ilike.%2AUP%2014%2A"
        );
    }

    #[test]
    fn test_ilike_literal_strips_wildcards() {
        assert_eq!(ilike_literal("UP*14%"), "UP14");
        assert_eq!(ilike_literal("UP_14_AB"), "UP14AB");
    }
}

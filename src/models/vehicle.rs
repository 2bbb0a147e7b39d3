use serde::{Deserialize, Deserializer, Serialize};

/// A registered vehicle as seen by the signaling core. Rows are owned by the
/// directory service; the core only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub plate: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Absent in a config file means active; an explicit `null` column from
    /// the directory means inactive.
    #[serde(default = "default_active", deserialize_with = "null_as_inactive")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

fn null_as_inactive<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

impl Vehicle {
    pub fn new(plate: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            plate: plate.into(),
            owner_id: Some(owner_id.into()),
            active: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn has_owner(&self) -> bool {
        self.owner_id
            .as_deref()
            .map(|id| !id.trim().is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_column_variants() {
        let rows: Vec<Vehicle> = serde_json::from_str(
            r#"[
                {"plate":"A","owner_id":"U1","active":true},
                {"plate":"B","owner_id":null,"active":null},
                {"plate":"C","owner_id":"U3"}
            ]"#,
        )
        .unwrap();
        assert!(rows[0].active);
        assert!(!rows[1].active);
        assert!(!rows[1].has_owner());
        assert!(rows[2].active);
    }
}

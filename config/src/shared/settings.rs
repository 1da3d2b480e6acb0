use serde::Deserialize;

use crate::load::Config;
use crate::shared::{IngestConfig, ValidationError, WarehouseConfig};

/// Root of the layered ingestion configuration.
///
/// ```yaml
/// warehouse:
///   project_id: analytics
///   dataset_id: tickets
/// ingest:
///   streaming_chunk_size: 250
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct IngestSettings {
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl Config for IngestSettings {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["ingest.force_nullable_columns"];

    fn validate(&self) -> Result<(), ValidationError> {
        self.warehouse.validate()?;
        self.ingest.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_section_defaults_when_omitted() {
        let settings: IngestSettings = serde_json::from_str(
            r#"{"warehouse": {"project_id": "p", "dataset_id": "d"}}"#,
        )
        .unwrap();

        assert_eq!(settings.ingest, IngestConfig::default());
        assert!(Config::validate(&settings).is_ok());
    }

    #[test]
    fn validation_covers_both_sections() {
        let settings: IngestSettings = serde_json::from_str(
            r#"{
                "warehouse": {"project_id": "p", "dataset_id": " "},
                "ingest": {"streaming_chunk_size": 10}
            }"#,
        )
        .unwrap();

        assert_eq!(
            Config::validate(&settings),
            Err(ValidationError::EmptyIdentifier("dataset_id"))
        );
    }
}

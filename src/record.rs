use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed record payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("record {0} has not been enriched")]
    NotEnriched(String),
}

/// The unit flowing through the partitioned log.
///
/// `score` and `enriched_at` are absent until the enrichment stage attaches
/// them; once present they are never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Create a fresh, unenriched record with a random id.
    pub fn new(text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            created_at,
            score: None,
            enriched_at: None,
        }
    }

    /// Attach a score and processing timestamp.
    ///
    /// Returns the record unchanged if it already carries a score, so a
    /// redelivered record keeps its first enrichment.
    pub fn enrich(mut self, score: f64, enriched_at: DateTime<Utc>) -> Self {
        if self.score.is_none() {
            self.score = Some(score);
            self.enriched_at = Some(enriched_at);
        }
        self
    }

    pub fn is_enriched(&self) -> bool {
        self.score.is_some() && self.enriched_at.is_some()
    }

    /// Event time and score of an enriched record.
    pub fn scored_event(&self) -> Result<(DateTime<Utc>, f64), RecordError> {
        match (self.enriched_at, self.score) {
            (Some(at), Some(score)) => Ok((at, score)),
            _ => Err(RecordError::NotEnriched(self.id.clone())),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RecordError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Finalized output for one window, as written to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowAggregate {
    #[serde(with = "iso8601")]
    pub window_start: DateTime<Utc>,
    #[serde(with = "iso8601")]
    pub window_end: DateTime<Utc>,
    pub avg_score: f64,
    pub date: NaiveDate,
}

impl WindowAggregate {
    pub fn new(window_start: DateTime<Utc>, window_end: DateTime<Utc>, avg_score: f64) -> Self {
        Self {
            window_start,
            window_end,
            avg_score,
            date: window_start.date_naive(),
        }
    }

    /// Value of a partition column for this aggregate, if the column exists.
    pub fn partition_value(&self, column: &str) -> Option<String> {
        match column {
            "date" => Some(self.date.format("%Y-%m-%d").to_string()),
            _ => None,
        }
    }
}

mod iso8601 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unenriched_record_omits_optional_fields() {
        let created = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let record = Record {
            id: "abc".to_string(),
            text: "bitcoin to the moon".to_string(),
            created_at: created,
            score: None,
            enriched_at: None,
        };

        let json: serde_json::Value = serde_json::from_slice(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["createdAt"], "2025-03-01T12:00:00Z");
        assert!(json.get("score").is_none());
        assert!(json.get("enrichedAt").is_none());
    }

    #[test]
    fn test_enrich_is_write_once() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let later = now + chrono::Duration::seconds(30);

        let record = Record::new("hello", now).enrich(4.5, now);
        let again = record.clone().enrich(-2.0, later);

        assert_eq!(again.score, Some(4.5));
        assert_eq!(again.enriched_at, Some(now));
        assert!(again.is_enriched());
    }

    #[test]
    fn test_decode_enriched_wire_format() {
        let payload = br#"{"id":"r1","text":"meh","createdAt":"2025-03-01T12:00:00Z","score":-1.5,"enrichedAt":"2025-03-01T12:00:05Z"}"#;
        let record = Record::from_bytes(payload).unwrap();

        let (at, score) = record.scored_event().unwrap();
        assert_eq!(score, -1.5);
        assert_eq!(at, Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 5).unwrap());
    }

    #[test]
    fn test_scored_event_requires_enrichment() {
        let record = Record::new("plain", Utc::now());
        assert!(matches!(
            record.scored_event(),
            Err(RecordError::NotEnriched(_))
        ));
    }

    #[test]
    fn test_malformed_payload() {
        assert!(Record::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_aggregate_output_format() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 23, 59, 0).unwrap();
        let end = start + chrono::Duration::seconds(60);
        let aggregate = WindowAggregate::new(start, end, 1.5);

        let json = serde_json::to_value(&aggregate).unwrap();
        assert_eq!(json["windowStart"], "2025-03-01T23:59:00Z");
        assert_eq!(json["windowEnd"], "2025-03-02T00:00:00Z");
        assert_eq!(json["avgScore"], 1.5);
        assert_eq!(json["date"], "2025-03-01");
        assert_eq!(aggregate.partition_value("date").as_deref(), Some("2025-03-01"));
        assert_eq!(aggregate.partition_value("hour"), None);
    }
}

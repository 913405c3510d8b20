use std::collections::BTreeMap;

use intake_core::{Record, RecordKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, Time};

use crate::reader::ReadSource;

/// Dashboard counters for pickup requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PickupStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub today: usize,
    pub this_week: usize,
    pub materials: BTreeMap<String, usize>,
    pub source: ReadSource,
}

impl PickupStats {
    /// `today` counts pickups created since UTC midnight, `this_week` the last seven days.
    #[must_use]
    pub fn from_records(records: &[Record], now: OffsetDateTime, source: ReadSource) -> Self {
        let midnight = now.replace_time(Time::MIDNIGHT);
        let week_ago = now - Duration::days(7);

        let mut by_status = RecordKind::Pickup
            .statuses()
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect::<BTreeMap<_, _>>();
        let mut materials = BTreeMap::new();
        let mut stats = Self {
            total: 0,
            by_status: BTreeMap::new(),
            today: 0,
            this_week: 0,
            materials: BTreeMap::new(),
            source,
        };

        for record in records.iter().filter(|record| record.kind == RecordKind::Pickup) {
            stats.total += 1;
            *by_status.entry(record.status.as_str().to_string()).or_insert(0) += 1;
            if record.created_at >= midnight {
                stats.today += 1;
            }
            if record.created_at >= week_ago {
                stats.this_week += 1;
            }
            if let Some(Value::Array(items)) = record.payload.get("materials") {
                for material in items.iter().filter_map(Value::as_str) {
                    *materials.entry(material.to_string()).or_insert(0) += 1;
                }
            }
        }

        stats.by_status = by_status;
        stats.materials = materials;
        stats
    }
}

#[cfg(test)]
mod tests {
    use intake_core::{RecordId, RecordStatus};
    use serde_json::json;

    use super::*;

    fn pickup(id: &str, status: RecordStatus, age: Duration, now: OffsetDateTime) -> Record {
        let Value::Object(payload) = json!({"materials": ["Plastic", "Paper"]}) else {
            panic!("fixture payload must be an object");
        };
        let id = match RecordId::parse(id) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture id: {err}"),
        };
        let mut record = Record::new(id, RecordKind::Pickup, payload, now - age);
        record.status = status;
        record
    }

    // Test IDs: TSTAT-001
    #[test]
    fn counts_statuses_windows_and_materials() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(19_700) + Duration::hours(15);
        let records = vec![
            pickup("PICKUP100001", RecordStatus::Pending, Duration::hours(1), now),
            pickup("PICKUP100002", RecordStatus::Confirmed, Duration::days(2), now),
            pickup("PICKUP100003", RecordStatus::Completed, Duration::days(30), now),
        ];

        let stats = PickupStats::from_records(&records, now, ReadSource::Primary);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.today, 1);
        assert_eq!(stats.this_week, 2);
        assert_eq!(stats.by_status.get("Pending"), Some(&1));
        assert_eq!(stats.by_status.get("In Progress"), Some(&0));
        assert_eq!(stats.materials.get("Plastic"), Some(&3));
    }
}

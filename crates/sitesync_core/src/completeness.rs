use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::CmsApi;
use crate::config::Endpoints;
use crate::record::{ContentRecord, RecordStatus};

#[derive(Debug, Clone, Copy, Default)]
pub struct CompletenessOptions {
    /// Refetch every record, even ones whose content already looks complete.
    pub force_full_data: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CompletenessReport {
    pub already_complete: usize,
    pub completed: usize,
    pub unresolved: Vec<u64>,
}

/// Fill in records whose content is missing or too short by probing per-item endpoints.
pub fn ensure_complete_content<A: CmsApi>(
    api: &mut A,
    endpoints: &Endpoints,
    records: Vec<ContentRecord>,
    options: CompletenessOptions,
) -> (Vec<ContentRecord>, CompletenessReport) {
    let mut report = CompletenessReport::default();
    let mut output = Vec::with_capacity(records.len());

    for mut record in records {
        if record.is_complete() && !options.force_full_data {
            record.refresh_status();
            report.already_complete += 1;
            output.push(record);
            continue;
        }

        match fetch_full_record(api, endpoints, &record) {
            Some(merged) => {
                debug!(id = record.id, "content completed from item endpoint");
                report.completed += 1;
                output.push(merged);
            }
            None => {
                record.refresh_status();
                if record.status != RecordStatus::Complete {
                    warn!(
                        id = record.id,
                        status = record.status.as_str(),
                        "could not fetch complete content"
                    );
                    report.unresolved.push(record.id);
                } else {
                    report.already_complete += 1;
                }
                output.push(record);
            }
        }
    }

    if report.completed > 0 || !report.unresolved.is_empty() {
        info!(
            completed = report.completed,
            unresolved = report.unresolved.len(),
            "completeness pass finished"
        );
    }
    (output, report)
}

fn fetch_full_record<A: CmsApi>(
    api: &mut A,
    endpoints: &Endpoints,
    record: &ContentRecord,
) -> Option<ContentRecord> {
    for url in endpoints.item_candidates(record.id) {
        let payload = match api.get_item(&url) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(error) => {
                debug!(id = record.id, %error, "item endpoint failed");
                continue;
            }
        };
        if !payload_is_complete(&payload) {
            continue;
        }
        match record.merged_with(&payload) {
            Ok(merged) => return Some(merged),
            Err(error) => warn!(id = record.id, error = %format!("{error:#}"), "failed to merge fetched record"),
        }
    }
    None
}

fn payload_is_complete(payload: &Value) -> bool {
    let content = match payload.get("content") {
        Some(Value::String(text)) => text.as_str(),
        Some(Value::Object(fields)) => fields
            .get("rendered")
            .and_then(Value::as_str)
            .unwrap_or_default(),
        _ => "",
    };
    RecordStatus::from_content(content) == RecordStatus::Complete
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::tests::{MockCms, item};
    use crate::config::{ConfigFile, SiteConfig};

    fn endpoints() -> Endpoints {
        let mut config = SiteConfig::from_file_with_lookup(&ConfigFile::default(), |_| None);
        config.endpoints.base_url = "https://cms".to_string();
        config.endpoints
    }

    #[test]
    fn short_content_triggers_supplemental_fetches() {
        let mut api = MockCms::default();
        let record = ContentRecord::new(42, "Short", &"s".repeat(150));

        let (records, report) = ensure_complete_content(
            &mut api,
            &endpoints(),
            vec![record],
            CompletenessOptions::default(),
        );

        assert_eq!(api.item_requests.len(), 3);
        assert_eq!(api.item_requests[0], "https://cms/wp/v2/posts/42");
        assert_eq!(report.unresolved, vec![42]);
        assert_eq!(records[0].content.len(), 150);
        assert_eq!(records[0].status, RecordStatus::Partial);
    }

    #[test]
    fn long_content_is_left_alone() {
        let mut api = MockCms::default();
        let record = ContentRecord::new(42, "Long", &"l".repeat(250));

        let (records, report) = ensure_complete_content(
            &mut api,
            &endpoints(),
            vec![record],
            CompletenessOptions::default(),
        );

        assert!(api.item_requests.is_empty());
        assert_eq!(report.already_complete, 1);
        assert_eq!(records[0].status, RecordStatus::Complete);
    }

    #[test]
    fn first_complete_candidate_wins() {
        let mut api = MockCms::default();
        api.items.insert(
            "https://cms/wp/v2/posts/7".to_string(),
            item(7, "still too short"),
        );
        api.items.insert(
            "https://cms/custom/v1/news/7".to_string(),
            json!({"id": 7, "content": {"rendered": "n".repeat(300)}, "importance": "important"}),
        );
        let record = ContentRecord {
            region: Some("europe".to_string()),
            ..ContentRecord::new(7, "Original title", "")
        };

        let (records, report) = ensure_complete_content(
            &mut api,
            &endpoints(),
            vec![record],
            CompletenessOptions::default(),
        );

        assert_eq!(report.completed, 1);
        assert_eq!(api.item_requests.len(), 2);
        let merged = &records[0];
        assert_eq!(merged.content.len(), 300);
        assert_eq!(merged.title, "Original title");
        assert_eq!(merged.region.as_deref(), Some("europe"));
        assert_eq!(merged.importance, crate::record::Importance::Important);
        assert_eq!(merged.status, RecordStatus::Complete);
    }

    #[test]
    fn force_full_data_refetches_complete_records() {
        let mut api = MockCms::default();
        api.items.insert(
            "https://cms/wp/v2/posts/1".to_string(),
            item(1, &"fresh ".repeat(60)),
        );
        let record = ContentRecord::new(1, "Stale", &"old ".repeat(60));

        let (records, report) = ensure_complete_content(
            &mut api,
            &endpoints(),
            vec![record],
            CompletenessOptions {
                force_full_data: true,
            },
        );
        assert_eq!(report.completed, 1);
        assert!(records[0].content.starts_with("fresh"));
    }
}

// src/processor.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};
use tracing::{debug, info};

/// A validated record from a `/process` request body.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub phone: String,
    pub number: i64,
}

/// Snapshot of processing statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorStats {
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
}

/// Parses, validates, and transforms `/process` records, keeping a running
/// sum of the submitted numbers: one lock-free global total plus a
/// per-client map keyed `user_<id>` behind a single lock.
pub struct RequestProcessor {
    total_sum: AtomicI64,
    client_sums: Mutex<HashMap<String, i64>>,
    requests_processed: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl RequestProcessor {
    pub fn new() -> Self {
        Self {
            total_sum: AtomicI64::new(0),
            client_sums: Mutex::new(HashMap::new()),
            requests_processed: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }

    /// Presence and type checks only; each rejection names the offending
    /// field. Value constraints are checked separately by `validate_record`.
    fn parse_record(body: &[u8]) -> Result<UserRecord, String> {
        let doc: Value =
            serde_json::from_slice(body).map_err(|_| "Invalid JSON format".to_string())?;
        let obj = doc
            .as_object()
            .ok_or_else(|| "Expected JSON object".to_string())?;

        let id = obj
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| "Missing or invalid 'id' field".to_string())?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| "Missing or invalid 'name' field".to_string())?
            .to_string();

        let phone = obj
            .get("phone")
            .and_then(Value::as_str)
            .ok_or_else(|| "Missing or invalid 'phone' field".to_string())?
            .to_string();

        let number = obj
            .get("number")
            .and_then(Value::as_i64)
            .ok_or_else(|| "Missing or invalid 'number' field".to_string())?;

        Ok(UserRecord {
            id,
            name,
            phone,
            number,
        })
    }

    fn validate_record(record: &UserRecord) -> bool {
        !record.name.is_empty() && !record.phone.is_empty() && record.id >= 0
    }

    /// Process one request body. On success the returned JSON carries the
    /// record with `number` incremented; the *original* number is tallied
    /// into the global and per-client sums. On failure nothing is tallied:
    /// a missing or wrong-typed field is reported by name, a value that
    /// fails validation as `Invalid user data`.
    pub fn process(&self, body: &[u8]) -> Result<String, String> {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);

        let record = match Self::parse_record(body) {
            Ok(r) => r,
            Err(msg) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                debug!("rejected record: {}", msg);
                return Err(msg);
            }
        };

        if !Self::validate_record(&record) {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            debug!("rejected record id={}: invalid user data", record.id);
            return Err("Invalid user data".to_string());
        }

        let original_number = record.number;
        let client_id = format!("user_{}", record.id);

        self.total_sum.fetch_add(original_number, Ordering::Relaxed);
        {
            let mut sums = self.client_sums.lock().unwrap();
            *sums.entry(client_id).or_insert(0) += original_number;
        }

        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        debug!(
            "processed record id={} number {} -> {}",
            record.id,
            original_number,
            original_number + 1
        );

        Ok(json!({
            "id": record.id,
            "name": record.name,
            "phone": record.phone,
            "number": original_number + 1,
            "success": true,
        })
        .to_string())
    }

    /// JSON error body for a failed request.
    pub fn error_body(message: &str) -> String {
        json!({ "error": message, "success": false }).to_string()
    }

    pub fn total_sum(&self) -> i64 {
        self.total_sum.load(Ordering::Relaxed)
    }

    /// Sum for one client id key (e.g. `user_123`); 0 when unknown.
    pub fn client_sum(&self, client_id: &str) -> i64 {
        self.client_sums
            .lock()
            .unwrap()
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of all per-client sums.
    pub fn all_client_sums(&self) -> HashMap<String, i64> {
        self.client_sums.lock().unwrap().clone()
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.requests_processed.load(Ordering::Relaxed),
            successful: self.successful_requests.load(Ordering::Relaxed),
            failed: self.failed_requests.load(Ordering::Relaxed),
        }
    }

    pub fn reset_statistics(&self) {
        self.requests_processed.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        info!("processor statistics reset");
    }
}

impl Default for RequestProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestProcessor {
    fn drop(&mut self) {
        let stats = self.stats();
        info!(
            "processor shutting down: {} total, {} successful, {} failed",
            stats.processed, stats.successful, stats.failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &[u8] = br#"{"id":123,"name":"Test User","phone":"+1234567890","number":42}"#;

    #[test]
    fn test_process_valid_record() {
        let p = RequestProcessor::new();
        let out = p.process(VALID).unwrap();
        let doc: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["number"], 43);
        assert_eq!(doc["id"], 123);
        assert_eq!(doc["name"], "Test User");
        assert_eq!(doc["phone"], "+1234567890");
        assert_eq!(doc["success"], true);
        assert_eq!(p.total_sum(), 42);
        assert_eq!(p.client_sum("user_123"), 42);
        assert_eq!(p.stats().successful, 1);
    }

    #[test]
    fn test_sums_accumulate_per_client() {
        let p = RequestProcessor::new();
        p.process(br#"{"id":1,"name":"a","phone":"1","number":10}"#).unwrap();
        p.process(br#"{"id":1,"name":"a","phone":"1","number":5}"#).unwrap();
        p.process(br#"{"id":2,"name":"b","phone":"2","number":7}"#).unwrap();
        assert_eq!(p.total_sum(), 22);
        assert_eq!(p.client_sum("user_1"), 15);
        assert_eq!(p.client_sum("user_2"), 7);
        assert_eq!(p.client_sum("user_3"), 0);
        let all = p.all_client_sums();
        assert_eq!(all.len(), 2);
        assert_eq!(all["user_1"], 15);
    }

    #[test]
    fn test_negative_numbers_tally() {
        let p = RequestProcessor::new();
        let out = p
            .process(br#"{"id":9,"name":"n","phone":"p","number":-3}"#)
            .unwrap();
        let doc: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["number"], -2);
        assert_eq!(p.total_sum(), -3);
    }

    #[test]
    fn test_missing_fields_name_the_field() {
        let p = RequestProcessor::new();
        let cases: [(&[u8], &str); 4] = [
            (br#"{"name":"x","phone":"y","number":1}"#, "id"),
            (br#"{"id":1,"phone":"y","number":1}"#, "name"),
            (br#"{"id":1,"name":"x","number":1}"#, "phone"),
            (br#"{"id":1,"name":"x","phone":"y"}"#, "number"),
        ];
        for (body, field) in cases {
            let err = p.process(body).unwrap_err();
            assert!(err.contains(field), "{} should mention {}", err, field);
        }
        assert_eq!(p.total_sum(), 0);
        assert_eq!(p.stats().failed, 4);
    }

    #[test]
    fn test_wrong_types_are_rejected_by_field_name() {
        let p = RequestProcessor::new();
        assert_eq!(
            p.process(br#"{"id":"1","name":"x","phone":"y","number":1}"#)
                .unwrap_err(),
            "Missing or invalid 'id' field"
        );
        assert_eq!(
            p.process(br#"{"id":1,"name":"x","phone":"y","number":1.5}"#)
                .unwrap_err(),
            "Missing or invalid 'number' field"
        );
        assert_eq!(p.total_sum(), 0);
    }

    #[test]
    fn test_out_of_range_values_are_invalid_user_data() {
        let p = RequestProcessor::new();
        // Present and well-typed, but failing the value checks
        assert_eq!(
            p.process(br#"{"id":-1,"name":"x","phone":"y","number":1}"#)
                .unwrap_err(),
            "Invalid user data"
        );
        assert_eq!(
            p.process(br#"{"id":1,"name":"","phone":"y","number":1}"#)
                .unwrap_err(),
            "Invalid user data"
        );
        assert_eq!(
            p.process(br#"{"id":1,"name":"x","phone":"","number":1}"#)
                .unwrap_err(),
            "Invalid user data"
        );
        assert_eq!(p.total_sum(), 0);
        assert_eq!(p.stats().failed, 3);
    }

    #[test]
    fn test_invalid_json_rejected() {
        let p = RequestProcessor::new();
        assert_eq!(p.process(b"not json").unwrap_err(), "Invalid JSON format");
        assert_eq!(p.process(b"[1,2,3]").unwrap_err(), "Expected JSON object");
    }

    #[test]
    fn test_error_body_shape() {
        let body = RequestProcessor::error_body("boom");
        let doc: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["error"], "boom");
        assert_eq!(doc["success"], false);
    }
}

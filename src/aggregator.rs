use crate::error::MonitorError;

/// Concatenate one tick's labels: OpenSea first, then Rarible. No sorting, no dedup.
pub fn merge(opensea: Vec<String>, rarible: Vec<String>) -> Vec<String> {
    let mut merged = opensea;
    merged.extend(rarible);
    merged
}

/// Serialize merged labels into the payload carried by a `report` call.
pub fn encode_payload(events: &[String]) -> Result<String, MonitorError> {
    serde_json::to_string(events).map_err(|e| MonitorError::Payload(e.to_string()))
}

/// Parse a received `report` payload back into labels.
pub fn decode_payload(payload: &str) -> Result<Vec<String>, MonitorError> {
    serde_json::from_str(payload).map_err(|e| MonitorError::Payload(e.to_string()))
}

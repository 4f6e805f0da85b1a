use sha2::{Digest, Sha256};

/// Integrity envelope for values stored in the distributed cache tier.
///
/// The distributed tier is shared across processes and survives deploys, so
/// a payload read back from it is not trusted blindly:
/// 1. A SHA-256 checksum is computed when the value is written
/// 2. The checksum is verified on every read
/// 3. A mismatch or undecodable envelope is treated as a cache miss and the
///    caller refetches from origin
///
/// The in-process tier holds typed values directly and does not pay this
/// cost; only serialized payloads crossing the network are enveloped.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckedPayload {
    /// Serialized payload (JSON string).
    pub data: String,
    /// SHA-256 checksum of the payload (hex encoded).
    pub checksum: String,
}

impl CheckedPayload {
    /// Seals a serialized payload with its checksum.
    pub fn seal(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the payload still matches its checksum.
    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    /// Encodes the envelope for storage in the distributed tier.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decodes an envelope read from the distributed tier and verifies it.
    ///
    /// Returns the inner payload only when the checksum matches; corrupt or
    /// foreign data yields None so the read degrades to a miss.
    pub fn decode_verified(raw: &str) -> Option<String> {
        let envelope: CheckedPayload = serde_json::from_str(raw).ok()?;

        if envelope.is_valid() {
            Some(envelope.data)
        } else {
            tracing::warn!(
                expected = %envelope.checksum,
                payload_len = envelope.data.len(),
                "distributed cache checksum mismatch, treating as miss"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sealed_payload_verifies() {
        let data = r#"{"plans":[{"id":"plan-1","name":"Texas Saver 12"}]}"#.to_string();
        let envelope = CheckedPayload::seal(data.clone());

        assert!(envelope.is_valid());
        assert_eq!(envelope.data, data);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let data = r#"{"dunsId":"1039940674000","name":"Oncor Electric Delivery"}"#.to_string();
        let envelope = CheckedPayload::seal(data.clone());

        let decoded = CheckedPayload::decode_verified(&envelope.encode());
        assert_eq!(decoded, Some(data));
    }

    #[test]
    fn test_modified_payload_rejected() {
        let mut envelope = CheckedPayload::seal(r#"{"rate1000":11.9}"#.to_string());
        envelope.data = r#"{"rate1000":0.1}"#.to_string();

        assert!(!envelope.is_valid());
    }

    #[test]
    fn test_corrupted_envelope_is_a_miss() {
        let envelope = CheckedPayload::seal(r#"{"zip":"75201"}"#.to_string());
        let tampered = envelope.encode().replace("75201", "75034");

        assert_eq!(CheckedPayload::decode_verified(&tampered), None);
    }

    #[test]
    fn test_undecodable_envelope_is_a_miss() {
        assert_eq!(CheckedPayload::decode_verified("not json at all"), None);
    }

    #[test]
    fn test_checksum_deterministic() {
        let a = CheckedPayload::seal("plans:1039940674000:1000".to_string());
        let b = CheckedPayload::seal("plans:1039940674000:1000".to_string());
        assert_eq!(a.checksum, b.checksum);
    }
}

use chrono::Utc;

/// Wire format for every timestamp the orchestrator writes: UTC,
/// microsecond precision, explicit `Z` suffix.
pub const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn utc_now() -> String {
    Utc::now().format(ISO_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::utc_now;

    #[test]
    fn utc_now_carries_explicit_zulu_suffix() {
        let stamp = utc_now();
        assert!(stamp.ends_with('Z'));
        assert_eq!(stamp.len(), "2025-01-01T00:00:00.000000Z".len());
    }
}

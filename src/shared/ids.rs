/// Mint the short random identifier that names a run on disk.
///
/// Eight lowercase hex characters, the same value the report contract
/// echoes back in `run_id`.
pub fn new_run_id() -> String {
    let mut bytes = [0u8; 4];
    if getrandom::getrandom(&mut bytes).is_err() {
        // Clock-derived fallback; uniqueness per host is enough.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        bytes = nanos.to_be_bytes();
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

use uuid::Uuid;

/// Generate a unique session identifier
/// Format: `sess_` followed by a UUID v4
pub fn generate_session_id() -> String {
    format!("sess_{}", Uuid::new_v4())
}

//! Unique ID generator.

use uuid::Uuid;

/// Prefix of every connection id.
pub const CONNECTION_ID_PREFIX: &str = "conn_";

/// Generates unique identifiers.
pub struct IdGenerator;

impl IdGenerator {
    /// Generates a connection ID of the form `conn_<32 hex digits>`.
    pub fn connection_id() -> String {
        format!("{CONNECTION_ID_PREFIX}{}", Uuid::new_v4().simple())
    }

    /// Generates a request ID.
    pub fn request_id() -> String {
        Uuid::new_v4().to_string()
    }
}

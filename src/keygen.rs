//! Document key generation

use uuid::Uuid;

/// Fresh key for a document submitted without one
///
/// Random v4 UUIDs need no coordination between workers or hosts.
pub fn generate_key() -> String {
    Uuid::new_v4().to_string()
}

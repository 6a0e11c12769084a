//! Address Binding Types
//!
//! A binding maps a watched Bitcoin deposit address to the user who owns it.

use serde::{Deserialize, Serialize};

/// Watched deposit address owned by a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBinding {
    pub user_address: String,
    pub deposit_address: String,
    pub active: bool,
    /// Unix seconds
    pub created_at: i64,
}

impl AddressBinding {
    pub fn new(user_address: impl Into<String>, deposit_address: impl Into<String>) -> Self {
        Self {
            user_address: user_address.into(),
            deposit_address: deposit_address.into(),
            active: true,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

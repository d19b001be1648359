//! Client (patient) model.

use serde::{Deserialize, Serialize};

/// Client row in the local store.
///
/// Unique on `(external_id, practitioner_id)`: the same patient may appear
/// once per practitioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub external_id: String,
    pub practitioner_id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Date of birth (`YYYY-MM-DD`)
    pub birth_date: Option<String>,
}

/// Incoming client data.
///
/// `None` fields never overwrite values already stored locally.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub external_id: String,
    pub practitioner_id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub birth_date: Option<String>,
}

//! Payload schemas.
//!
//! A queue is bound to one payload type. The type's serde shape and its
//! `validator` rules together form the schema, checked once when a job is
//! enqueued and again when a worker picks it up.

use crate::error::QueueError;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use validator::Validate;

/// Marker for types usable as job payloads.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone, Serialize, Deserialize, Validate)]
/// struct WelcomeEmail {
///     #[validate(email)]
///     to: String,
/// }
///
/// let queue: Queue<WelcomeEmail> = Queue::new("emails", connection, settings);
/// ```
pub trait JobData: Serialize + DeserializeOwned + Validate + Clone + Send + Sync + 'static {}

impl<T> JobData for T where
    T: Serialize + DeserializeOwned + Validate + Clone + Send + Sync + 'static
{
}

/// Deserialize `value` into `D` and run its validation rules.
pub fn validate_value<D: JobData>(value: &Value) -> Result<D, QueueError> {
    let data: D = serde_json::from_value(value.clone())
        .map_err(|e| QueueError::Validation(format!("payload does not match schema: {e}")))?;
    data.validate()?;
    Ok(data)
}

/// Validate a typed payload and convert it to its stored JSON form.
pub fn to_validated_value<D: JobData>(data: &D) -> Result<Value, QueueError> {
    data.validate()?;
    Ok(serde_json::to_value(data)?)
}

//! Registered command types and their payload validators.
//!
//! The registry is populated by the embedding application; the command
//! service only consults it on `submit`.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use cmdlease_core::CommandError;

/// Payload validator for one command type. `Err` carries a human-readable
/// reason that ends up in `InvalidPayload`.
pub type PayloadValidator = Box<dyn Fn(&JsonValue) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
pub struct TypeRegistry {
    validators: HashMap<String, PayloadValidator>,
}

impl core::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a type with a shape validator.
    pub fn register<F>(&mut self, command_type: impl Into<String>, validator: F) -> &mut Self
    where
        F: Fn(&JsonValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators
            .insert(command_type.into(), Box::new(validator));
        self
    }

    /// Register a type that accepts any non-empty payload.
    pub fn register_any(&mut self, command_type: impl Into<String>) -> &mut Self {
        self.register(command_type, |_| Ok(()))
    }

    pub fn with<F>(mut self, command_type: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&JsonValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register(command_type, validator);
        self
    }

    pub fn with_any(mut self, command_type: impl Into<String>) -> Self {
        self.register_any(command_type);
        self
    }

    pub fn contains(&self, command_type: &str) -> bool {
        self.validators.contains_key(command_type)
    }

    /// Sorted for stable output.
    pub fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.validators.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Check the type is known, the payload is non-empty, then run the
    /// type's validator.
    pub fn validate(&self, command_type: &str, payload: &JsonValue) -> Result<(), CommandError> {
        let validator =
            self.validators
                .get(command_type)
                .ok_or_else(|| CommandError::InvalidCommandType {
                    command_type: command_type.to_string(),
                })?;

        let invalid = |reason: String| CommandError::InvalidPayload {
            command_type: command_type.to_string(),
            reason,
        };

        if is_empty_payload(payload) {
            return Err(invalid("payload is empty".to_string()));
        }
        validator(payload).map_err(invalid)
    }
}

/// `null`, `""`, `[]` and `{}` carry nothing to act on.
pub fn is_empty_payload(payload: &JsonValue) -> bool {
    match payload {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(a) => a.is_empty(),
        JsonValue::Object(o) => o.is_empty(),
        JsonValue::Bool(_) | JsonValue::Number(_) => false,
    }
}

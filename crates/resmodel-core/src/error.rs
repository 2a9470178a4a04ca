//! Error types for ResModel operations.

use std::fmt;

/// The primary error type for all ResModel operations.
///
/// Local invariant violations (`DuplicateIdentity`, `UnknownField`,
/// `NotEditable`, ...) are programmer errors. `Invalid` and `Server` are
/// reported by the adapter and leave the record in a recoverable state.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Two keys would exist for one `(type, id)` identity
    DuplicateIdentity(IdentityError),
    /// Resource type or key is not registered
    UnknownResource(ResourceError),
    /// Field name is not declared on the resource schema
    UnknownField(FieldError),
    /// A transformation, derivation or hash function is not registered
    UnregisteredTransform(RegistryError),
    /// Mutation attempted through an immutable projection
    NotEditable(FieldError),
    /// Links-mode relationship payload is incomplete
    LinksModeAssertion(LinksModeError),
    /// Server-reported per-field validation failures
    Invalid(InvalidRecordError),
    /// Non-validation failure reported by the adapter
    Server(ServerError),
    /// Lifecycle transition not allowed from the current state
    InvalidState(StateError),
    /// Schema registration errors
    Schema(SchemaError),
    /// The adapter returned no resource for a requested id
    NotFound(ResourceError),
    /// The store backing a record projection has been dropped
    StoreDropped,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityError {
    pub type_name: String,
    pub id: String,
    /// Lid of the key already holding the identity.
    pub existing_lid: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceError {
    pub type_name: String,
    pub id: Option<String>,
    pub lid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub type_name: String,
    pub field: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Transformation,
    Derivation,
    HashFn,
}

impl RegistryKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RegistryKind::Transformation => "transformation",
            RegistryKind::Derivation => "derivation",
            RegistryKind::HashFn => "hash function",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryError {
    pub kind: RegistryKind,
    pub name: String,
    /// `type.field` that referenced the missing entry, when known.
    pub referenced_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinksModeErrorKind {
    /// Payload has no `links.related`
    MissingRelatedLink,
    /// `data` member is absent (as opposed to explicit null)
    UndefinedData,
    /// A related resource was not included/loaded
    MissingIncluded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinksModeError {
    pub kind: LinksModeErrorKind,
    pub type_name: String,
    pub field: String,
    /// Offending related identifier for `MissingIncluded`.
    pub related: Option<String>,
}

/// Validation errors grouped by field, as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidRecordError {
    pub errors: Vec<FieldValidationError>,
}

/// A single server-reported validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValidationError {
    pub field: String,
    pub message: String,
}

impl InvalidRecordError {
    /// Create an empty error bag.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Add a field error.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Builder-style `add`.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.add(field, message);
        self
    }

    /// Messages recorded for `field`.
    pub fn for_field(&self, field: &str) -> Vec<&str> {
        self.errors
            .iter()
            .filter(|e| e.field == field)
            .map(|e| e.message.as_str())
            .collect()
    }

    /// Drop every error recorded for `field`. Returns true if any were removed.
    pub fn remove_field(&mut self, field: &str) -> bool {
        let before = self.errors.len();
        self.errors.retain(|e| e.field != field);
        before != self.errors.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateError {
    pub lid: String,
    pub state: String,
    pub event: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Two fields share a name within one resource schema
    DuplicateField,
    /// Field declaration is inconsistent (missing alias target, bad kind/type pair)
    InvalidField,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub type_name: String,
    pub message: String,
}

impl Error {
    /// Shorthand for an `UnknownField` error.
    pub fn unknown_field(type_name: impl Into<String>, field: impl Into<String>) -> Self {
        Error::UnknownField(FieldError {
            type_name: type_name.into(),
            field: field.into(),
        })
    }

    /// Shorthand for a `NotEditable` error.
    pub fn not_editable(type_name: impl Into<String>, field: impl Into<String>) -> Self {
        Error::NotEditable(FieldError {
            type_name: type_name.into(),
            field: field.into(),
        })
    }

    /// Shorthand for an `UnknownResource` error on a type name.
    pub fn unknown_type(type_name: impl Into<String>) -> Self {
        Error::UnknownResource(ResourceError {
            type_name: type_name.into(),
            id: None,
            lid: None,
        })
    }

    /// Shorthand for a `Server` error.
    pub fn server(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Server(ServerError {
            status,
            message: message.into(),
        })
    }

    /// Recoverable errors leave the record usable for retry or rollback.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Invalid(_) | Error::Server(_) | Error::NotFound(_))
    }

    /// Programmer errors signal a broken local invariant.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateIdentity(_)
                | Error::UnknownResource(_)
                | Error::UnknownField(_)
                | Error::UnregisteredTransform(_)
                | Error::NotEditable(_)
                | Error::LinksModeAssertion(_)
                | Error::InvalidState(_)
                | Error::Schema(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateIdentity(e) => write!(f, "Duplicate identity: {}", e),
            Error::UnknownResource(e) => write!(f, "Unknown resource: {}", e),
            Error::UnknownField(e) => {
                write!(f, "Unknown field '{}' on type '{}'", e.field, e.type_name)
            }
            Error::UnregisteredTransform(e) => write!(f, "Unregistered {}", e),
            Error::NotEditable(e) => write!(
                f,
                "Cannot set '{}' on an immutable '{}' record; checkout the record first",
                e.field, e.type_name
            ),
            Error::LinksModeAssertion(e) => write!(f, "Links mode assertion failed: {}", e),
            Error::Invalid(e) => write!(f, "Invalid record: {}", e),
            Error::Server(e) => write!(f, "Server error: {}", e),
            Error::InvalidState(e) => write!(f, "Invalid state transition: {}", e),
            Error::Schema(e) => write!(f, "Schema error: {}", e),
            Error::NotFound(e) => write!(f, "Not found: {}", e),
            Error::StoreDropped => write!(f, "The store backing this record has been dropped"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ('{}:{}' is already held by {})",
            self.message, self.type_name, self.id, self.existing_lid
        )
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, &self.lid) {
            (Some(id), _) => write!(f, "{}:{}", self.type_name, id),
            (None, Some(lid)) => write!(f, "{} ({})", self.type_name, lid),
            (None, None) => write!(f, "type '{}'", self.type_name),
        }
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.referenced_by {
            Some(field) => write!(
                f,
                "{} '{}' (referenced by {})",
                self.kind.as_str(),
                self.name,
                field
            ),
            None => write!(f, "{} '{}'", self.kind.as_str(), self.name),
        }
    }
}

impl fmt::Display for LinksModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = format!("{}.{}", self.type_name, self.field);
        match self.kind {
            LinksModeErrorKind::MissingRelatedLink => write!(
                f,
                "'{}' is in linksMode but its payload has no links.related",
                path
            ),
            LinksModeErrorKind::UndefinedData => write!(
                f,
                "'{}' is in linksMode but its payload has no data member; use null for an empty relationship",
                path
            ),
            LinksModeErrorKind::MissingIncluded => write!(
                f,
                "'{}' is in linksMode but related resource {} was not included",
                path,
                self.related.as_deref().unwrap_or("<unknown>")
            ),
        }
    }
}

impl fmt::Display for InvalidRecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "no validation errors")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "'{}' {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: cannot apply '{}' in state '{}' ({})",
            self.lid, self.event, self.state, self.message
        )
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        Error::DuplicateIdentity(err)
    }
}

impl From<InvalidRecordError> for Error {
    fn from(err: InvalidRecordError) -> Self {
        Error::Invalid(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::InvalidState(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<LinksModeError> for Error {
    fn from(err: LinksModeError) -> Self {
        Error::LinksModeAssertion(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for ResModel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_editable_names_field_and_type() {
        let err = Error::not_editable("user", "name");
        let msg = err.to_string();
        assert!(msg.contains("'name'"));
        assert!(msg.contains("'user'"));
        assert!(err.is_programmer_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn links_mode_message_names_path() {
        let err = Error::from(LinksModeError {
            kind: LinksModeErrorKind::UndefinedData,
            type_name: "user".to_string(),
            field: "friends".to_string(),
            related: None,
        });
        assert!(err.to_string().contains("user.friends"));
    }

    #[test]
    fn invalid_record_bag_field_ops() {
        let mut bag = InvalidRecordError::new()
            .with("name", "is too short")
            .with("name", "must be capitalized")
            .with("email", "is taken");
        assert_eq!(bag.len(), 3);
        assert_eq!(bag.for_field("name").len(), 2);
        assert!(bag.remove_field("name"));
        assert!(!bag.remove_field("name"));
        assert_eq!(bag.to_string(), "'email' is taken");

        let err = Error::from(bag);
        assert!(err.is_recoverable());
    }

    #[test]
    fn server_error_display_includes_status() {
        let err = Error::server(Some(503), "unavailable");
        assert_eq!(err.to_string(), "Server error: unavailable (status 503)");
    }
}

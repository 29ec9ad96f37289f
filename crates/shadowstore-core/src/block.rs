//! The transfer object handed across the store boundary

/// One logical record: identity plus an opaque serialized payload.
///
/// Built by the caller for every insert/update and returned by reads. Not
/// persisted as such; its fields are decomposed into the heap record format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    /// Unique string key addressing this record
    pub identity: String,
    /// Opaque payload bytes; the store is format-agnostic
    pub payload: Vec<u8>,
    /// Caller-managed version of this record instance
    pub instance_version: u64,
    /// Caller-managed schema version of the payload encoding
    pub schema_version: u32,
}

impl DataBlock {
    pub fn new(identity: impl Into<String>, payload: Vec<u8>, instance_version: u64, schema_version: u32) -> Self {
        Self {
            identity: identity.into(),
            payload,
            instance_version,
            schema_version,
        }
    }
}

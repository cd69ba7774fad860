use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("entity `{entity}` is not configured")]
    UnknownEntity { entity: String },
    #[error("schema validation failed: {message}")]
    Schema { message: String },
    #[error("identifier codec misconfigured: {message}")]
    Codec { message: String },
}

impl DomainError {
    pub fn unknown_entity(entity: impl Into<String>) -> Self {
        Self::UnknownEntity {
            entity: entity.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }
}

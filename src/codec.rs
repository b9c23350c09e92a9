pub mod decode;
pub mod schema;

pub use decode::{attach_topic, decode, DecodeError, DecodedContent, TOPIC_KEY};
pub use schema::{load_schema, DynSchemaValidator, SchemaError, SchemaValidator, SchemaViolation};

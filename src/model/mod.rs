//! Model engine.
//!
//! A `ModelDefinition` describes a table or collection: schema, hooks,
//! scopes, virtual fields, soft delete, timestamps and timezone. Binding it
//! to an `Adapter` yields a `Model`, which runs validated, hook-driven CRUD
//! on any backend.

pub mod association;
pub mod definition;
pub mod engine;
pub mod hooks;
pub mod instance;
pub mod query;
pub mod schema;
pub mod validation;

pub use association::RelationOptions;
pub use definition::{ModelDefinition, ModelDefinitionBuilder, Timestamps};
pub use engine::{Model, TrashScope};
pub use hooks::{HookEvent, HookRegistry};
pub use instance::ModelInstance;
pub use query::{ModelQuery, Page, RecordQuery};
pub use schema::{ArrayRule, FieldDef, FieldType, Format, ModelSchema};
pub use validation::{FieldError, Rule, ValidationContext, ValidationErrors};

//! Core logic for the tally aggregation engine.
//!
//! This crate contains the storage-independent pieces:
//! - Inference: typing raw uploaded records and deriving calendar fields
//! - Filtering: evaluating condition trees against typed records
//! - Registry: tenant-scoped models over registered schemas
//! - Aggregation: grouping records and reducing them, including formulas

pub mod aggregation;
pub mod filter;
pub mod formula;
pub mod inference;
pub mod registry;
pub mod temporal;
pub mod types;
pub mod value;

pub use aggregation::{
    AggregationPolicy, AggregationResult, AggregationSpec, AggregationType, Bucket, BucketOrder,
    GroupBySpec, GroupField, MinPolicy, UnknownAggregationType, aggregate, aggregate_with,
    calculate_aggregation, group_key,
};
pub use filter::{Condition, DataType, FilterExpression, Operator};
pub use formula::FormulaError;
pub use inference::{InferableRecord, process_dataset};
pub use registry::{
    CompiledModel, FieldDefinition, ModelRegistry, RecordQuery, RecordSource, RegistryError,
    SchemaDefinition,
};
pub use temporal::{Granularity, UnknownGranularity};
pub use types::{SchemaName, TenantId, ValidationError};
pub use value::{RawRecord, Record, Value};

//! Arrow/Parquet encoding of typed columns shared by canonical tables and
//! feature datasets.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::{DateTime, Utc};
use incur_core::{FieldType, FieldValue};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::{io_err, StoreError};

const UTC_TZ: &str = "UTC";

/// One typed column of row values.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub values: Vec<FieldValue>,
}

impl Column {
    pub fn new(name: impl Into<String>, field_type: FieldType, values: Vec<FieldValue>) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            values,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

pub fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Text => DataType::Utf8,
        FieldType::Integer => DataType::Int64,
        FieldType::Float => DataType::Float64,
        FieldType::Boolean => DataType::Boolean,
        FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC_TZ.into())),
    }
}

fn collect_typed<'a, T>(
    column: &'a Column,
    pick: impl Fn(&'a FieldValue) -> Option<T>,
) -> Result<Vec<Option<T>>, StoreError> {
    column
        .values
        .iter()
        .map(|value| {
            if value.is_null() {
                return Ok(None);
            }
            pick(value)
                .map(Some)
                .ok_or_else(|| StoreError::ColumnTypeConflict {
                    column: column.name.clone(),
                    expected: column.field_type,
                    found: value.field_type().unwrap_or(column.field_type),
                })
        })
        .collect()
}

fn column_array(column: &Column) -> Result<ArrayRef, StoreError> {
    let array: ArrayRef = match column.field_type {
        FieldType::Text => Arc::new(StringArray::from(collect_typed(column, |v| match v {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        })?)),
        FieldType::Integer => Arc::new(Int64Array::from(collect_typed(column, |v| match v {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        })?)),
        FieldType::Float => Arc::new(Float64Array::from(collect_typed(column, |v| match v {
            FieldValue::Float(n) => Some(*n),
            _ => None,
        })?)),
        FieldType::Boolean => Arc::new(BooleanArray::from(collect_typed(column, |v| match v {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        })?)),
        FieldType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(collect_typed(column, |v| match v {
                FieldValue::Timestamp(ts) => Some(ts.timestamp_micros()),
                _ => None,
            })?)
            .with_timezone(UTC_TZ),
        ),
    };
    Ok(array)
}

pub fn build_record_batch(columns: &[Column]) -> Result<RecordBatch, StoreError> {
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|c| ArrowField::new(&c.name, arrow_type(c.field_type), c.nullable))
            .collect::<Vec<_>>(),
    ));
    if columns.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    let arrays = columns
        .iter()
        .map(column_array)
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(schema, arrays).map_err(|source| StoreError::Arrow {
        context: "building record batch".to_string(),
        source,
    })
}

/// Encode one batch as an in-memory Parquet file.
pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>, StoreError> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None).map_err(|source| {
        StoreError::Parquet {
            context: "opening parquet writer".to_string(),
            source,
        }
    })?;
    writer.write(batch).map_err(|source| StoreError::Parquet {
        context: "writing record batch".to_string(),
        source,
    })?;
    writer.close().map_err(|source| StoreError::Parquet {
        context: "closing parquet writer".to_string(),
        source,
    })?;
    Ok(buffer)
}

pub fn read_parquet_file(path: &Path) -> Result<Vec<RecordBatch>, StoreError> {
    let file = File::open(path).map_err(io_err(path))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .map_err(|source| StoreError::Parquet {
            context: format!("opening parquet reader {}", path.display()),
            source,
        })?;
    reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| StoreError::Arrow {
            context: format!("reading record batches from {}", path.display()),
            source,
        })
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, column: &str) -> Result<&'a T, StoreError> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| StoreError::Decode {
            column: column.to_string(),
            reason: format!("unexpected array for {:?}", array.data_type()),
        })
}

fn timestamp_from_micros(micros: i64, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| StoreError::Decode {
        column: column.to_string(),
        reason: format!("timestamp {micros}us out of range"),
    })
}

/// Typed values of column `name`, or `None` when the batch lacks it.
pub fn batch_column_values(
    batch: &RecordBatch,
    name: &str,
) -> Result<Option<Vec<FieldValue>>, StoreError> {
    let Some(array) = batch.column_by_name(name) else {
        return Ok(None);
    };
    let mut values = Vec::with_capacity(array.len());
    match array.data_type() {
        DataType::Utf8 => {
            let typed = downcast::<StringArray>(array, name)?;
            for i in 0..typed.len() {
                values.push(if typed.is_null(i) {
                    FieldValue::Null
                } else {
                    FieldValue::Text(typed.value(i).to_string())
                });
            }
        }
        DataType::Int64 => {
            let typed = downcast::<Int64Array>(array, name)?;
            for i in 0..typed.len() {
                values.push(if typed.is_null(i) {
                    FieldValue::Null
                } else {
                    FieldValue::Integer(typed.value(i))
                });
            }
        }
        DataType::Float64 => {
            let typed = downcast::<Float64Array>(array, name)?;
            for i in 0..typed.len() {
                values.push(if typed.is_null(i) {
                    FieldValue::Null
                } else {
                    FieldValue::Float(typed.value(i))
                });
            }
        }
        DataType::Boolean => {
            let typed = downcast::<BooleanArray>(array, name)?;
            for i in 0..typed.len() {
                values.push(if typed.is_null(i) {
                    FieldValue::Null
                } else {
                    FieldValue::Boolean(typed.value(i))
                });
            }
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let typed = downcast::<TimestampMicrosecondArray>(array, name)?;
            for i in 0..typed.len() {
                values.push(if typed.is_null(i) {
                    FieldValue::Null
                } else {
                    FieldValue::Timestamp(timestamp_from_micros(typed.value(i), name)?)
                });
            }
        }
        other => {
            return Err(StoreError::Decode {
                column: name.to_string(),
                reason: format!("unsupported arrow type {other:?}"),
            })
        }
    }
    Ok(Some(values))
}

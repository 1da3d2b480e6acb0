//! Columnar encoding of normalized rows into Arrow record batches.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, LargeBinaryArray,
    LargeStringArray, ListArray, StructArray, Time64MicrosecondArray, TimestampMicrosecondArray,
};
use arrow::buffer::{NullBuffer, OffsetBuffer};
use arrow::datatypes::{DataType, Field, Fields, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::Datelike;
use tracing::debug;

use crate::error::{RowError, WriteError};
use crate::types::{
    Cell, FieldDescriptor, FieldMode, NormalizedRow, PhysicalType, TableSchema,
    UNIX_EPOCH_DAYS_FROM_CE, time_to_micros,
};

/// Timezone attached to `TIMESTAMP` columns.
pub const UTC_TIMEZONE: &str = "UTC";

/// Name of the element field of list columns.
const LIST_ITEM_NAME: &str = "item";

/// A cell together with the index of the row it belongs to.
type Slot<'a> = (usize, &'a Cell);

static NULL_CELL: Cell = Cell::Null;

/// Maps the physical type of `field` to its Arrow type, wrapping repeated columns in a list.
pub fn build_column_type(field: &FieldDescriptor) -> DataType {
    let element_type = match field.physical_type {
        PhysicalType::String | PhysicalType::Json => DataType::LargeUtf8,
        PhysicalType::Int64 => DataType::Int64,
        PhysicalType::Float64 => DataType::Float64,
        PhysicalType::Bool => DataType::Boolean,
        PhysicalType::Bytes => DataType::LargeBinary,
        PhysicalType::Timestamp => {
            DataType::Timestamp(TimeUnit::Microsecond, Some(UTC_TIMEZONE.into()))
        }
        PhysicalType::DateTime => DataType::Timestamp(TimeUnit::Microsecond, None),
        PhysicalType::Date => DataType::Date32,
        PhysicalType::Time => DataType::Time64(TimeUnit::Microsecond),
        PhysicalType::Record => DataType::Struct(struct_fields(&field.children)),
    };

    if field.is_repeated() {
        return DataType::List(Arc::new(Field::new(LIST_ITEM_NAME, element_type, true)));
    }

    element_type
}

fn struct_fields(children: &[FieldDescriptor]) -> Fields {
    children
        .iter()
        .map(|child| Field::new(&child.name, build_column_type(child), true))
        .collect()
}

/// Builds the Arrow schema of a table. Only top-level `REQUIRED` columns are non-nullable.
pub fn build_arrow_schema(schema: &TableSchema) -> ArrowSchema {
    ArrowSchema::new(
        schema
            .fields
            .iter()
            .map(|field| {
                Field::new(
                    &field.name,
                    build_column_type(field),
                    field.mode != FieldMode::Required,
                )
            })
            .collect::<Vec<_>>(),
    )
}

/// Pivots normalized rows into a column-major record batch matching `schema`.
///
/// Cells that do not fit their column, including [`Cell::Unconverted`] values and nulls in
/// required columns, are reported together as row errors of one [`WriteError`].
pub fn encode_batch(rows: &[NormalizedRow], schema: &TableSchema) -> Result<RecordBatch, WriteError> {
    let arrow_schema = Arc::new(build_arrow_schema(schema));
    let mut errors = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.len());

    for (column_index, field) in schema.fields.iter().enumerate() {
        let slots: Vec<Slot<'_>> = rows
            .iter()
            .enumerate()
            .map(|(row_index, row)| (row_index, row.values.get(column_index).unwrap_or(&NULL_CELL)))
            .collect();

        if field.mode == FieldMode::Required {
            for (row_index, cell) in &slots {
                if cell.is_null() {
                    errors.push(RowError {
                        index: *row_index,
                        message: format!("column `{}`: required value is null", field.name),
                    });
                }
            }
        }

        arrays.push(build_array(field, &field.name, &slots, &mut errors)?);
    }

    if !errors.is_empty() {
        errors.sort_by_key(|error| error.index);
        return Err(WriteError::with_row_errors(
            format!("{} values could not be encoded", errors.len()),
            errors,
        ));
    }

    let batch = RecordBatch::try_new(arrow_schema, arrays)?;

    debug!(
        rows = batch.num_rows(),
        columns = batch.num_columns(),
        "encoded record batch"
    );

    Ok(batch)
}

fn build_array(
    field: &FieldDescriptor,
    path: &str,
    slots: &[Slot<'_>],
    errors: &mut Vec<RowError>,
) -> Result<ArrayRef, WriteError> {
    if field.is_repeated() {
        return build_list_array(field, path, slots, errors);
    }

    let array: ArrayRef = match field.physical_type {
        PhysicalType::String => Arc::new(LargeStringArray::from_iter(collect(
            field, path, slots, errors,
            |cell| match cell {
                Cell::String(value) => Some(value.clone()),
                _ => None,
            },
        ))),
        PhysicalType::Json => Arc::new(LargeStringArray::from_iter(collect(
            field, path, slots, errors,
            |cell| match cell {
                Cell::Json(value) => Some(value.clone()),
                _ => None,
            },
        ))),
        PhysicalType::Int64 => Arc::new(Int64Array::from(collect(
            field, path, slots, errors,
            |cell| match cell {
                Cell::I64(value) => Some(*value),
                _ => None,
            },
        ))),
        PhysicalType::Float64 => Arc::new(Float64Array::from(collect(
            field, path, slots, errors,
            |cell| match cell {
                Cell::F64(value) => Some(*value),
                _ => None,
            },
        ))),
        PhysicalType::Bool => Arc::new(BooleanArray::from(collect(
            field, path, slots, errors,
            |cell| match cell {
                Cell::Bool(value) => Some(*value),
                _ => None,
            },
        ))),
        PhysicalType::Bytes => Arc::new(LargeBinaryArray::from_iter(collect(
            field, path, slots, errors,
            |cell| match cell {
                Cell::Bytes(value) => Some(value.clone()),
                _ => None,
            },
        ))),
        PhysicalType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(collect(field, path, slots, errors, |cell| {
                match cell {
                    Cell::Timestamp(value) => Some(value.timestamp_micros()),
                    _ => None,
                }
            }))
            .with_timezone(UTC_TIMEZONE),
        ),
        PhysicalType::DateTime => Arc::new(TimestampMicrosecondArray::from(collect(
            field, path, slots, errors,
            |cell| match cell {
                Cell::DateTime(value) => Some(value.and_utc().timestamp_micros()),
                _ => None,
            },
        ))),
        PhysicalType::Date => Arc::new(Date32Array::from(collect(
            field, path, slots, errors,
            |cell| match cell {
                Cell::Date(value) => Some(value.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
                _ => None,
            },
        ))),
        PhysicalType::Time => Arc::new(Time64MicrosecondArray::from(collect(
            field, path, slots, errors,
            |cell| match cell {
                Cell::Time(value) => Some(time_to_micros(value)),
                _ => None,
            },
        ))),
        PhysicalType::Record => build_struct_array(field, path, slots, errors)?,
    };

    Ok(array)
}

/// Extracts one scalar per slot, recording a row error for every cell of the wrong kind.
fn collect<T>(
    field: &FieldDescriptor,
    path: &str,
    slots: &[Slot<'_>],
    errors: &mut Vec<RowError>,
    extract: impl Fn(&Cell) -> Option<T>,
) -> Vec<Option<T>> {
    slots
        .iter()
        .map(|(row_index, cell)| {
            if cell.is_null() {
                return None;
            }

            let value = extract(cell);
            if value.is_none() {
                errors.push(mismatch(field, path, *row_index, cell));
            }
            value
        })
        .collect()
}

fn build_struct_array(
    field: &FieldDescriptor,
    path: &str,
    slots: &[Slot<'_>],
    errors: &mut Vec<RowError>,
) -> Result<ArrayRef, WriteError> {
    let mut validity = Vec::with_capacity(slots.len());
    let mut records: Vec<(usize, Option<&[Cell]>)> = Vec::with_capacity(slots.len());

    for (row_index, cell) in slots {
        match cell {
            Cell::Record(values) => {
                validity.push(true);
                records.push((*row_index, Some(values.as_slice())));
            }
            Cell::Null => {
                validity.push(false);
                records.push((*row_index, None));
            }
            other => {
                errors.push(mismatch(field, path, *row_index, other));
                validity.push(false);
                records.push((*row_index, None));
            }
        }
    }

    let mut children: Vec<ArrayRef> = Vec::with_capacity(field.children.len());
    for (child_index, child) in field.children.iter().enumerate() {
        let child_path = format!("{path}.{}", child.name);
        let child_slots: Vec<Slot<'_>> = records
            .iter()
            .map(|(row_index, values)| {
                let cell = values
                    .and_then(|values| values.get(child_index))
                    .unwrap_or(&NULL_CELL);
                (*row_index, cell)
            })
            .collect();

        children.push(build_array(child, &child_path, &child_slots, errors)?);
    }

    let nulls = validity
        .iter()
        .any(|valid| !valid)
        .then(|| NullBuffer::from(validity));
    let array = StructArray::try_new(struct_fields(&field.children), children, nulls)?;

    Ok(Arc::new(array))
}

fn build_list_array(
    field: &FieldDescriptor,
    path: &str,
    slots: &[Slot<'_>],
    errors: &mut Vec<RowError>,
) -> Result<ArrayRef, WriteError> {
    let element = field.element();
    let mut lengths = Vec::with_capacity(slots.len());
    let mut validity = Vec::with_capacity(slots.len());
    let mut element_slots: Vec<Slot<'_>> = Vec::new();

    for (row_index, cell) in slots {
        match cell {
            Cell::Array(values) => {
                lengths.push(values.len());
                validity.push(true);
                element_slots.extend(values.iter().map(|value| (*row_index, value)));
            }
            Cell::Null => {
                lengths.push(0);
                validity.push(false);
            }
            other => {
                errors.push(mismatch(field, path, *row_index, other));
                lengths.push(0);
                validity.push(false);
            }
        }
    }

    let values = build_array(&element, path, &element_slots, errors)?;
    let item = Arc::new(Field::new(LIST_ITEM_NAME, build_column_type(&element), true));
    let nulls = validity
        .iter()
        .any(|valid| !valid)
        .then(|| NullBuffer::from(validity));

    let array = ListArray::try_new(item, OffsetBuffer::from_lengths(lengths), values, nulls)?;

    Ok(Arc::new(array))
}

fn mismatch(field: &FieldDescriptor, path: &str, row_index: usize, cell: &Cell) -> RowError {
    let message = match cell {
        Cell::Unconverted(value) => format!(
            "column `{path}`: {} value {} cannot be stored as {}",
            value.type_name(),
            value.to_json(),
            field.physical_type
        ),
        other => format!(
            "column `{path}`: {} cell does not match type {}",
            cell_kind(other),
            field.physical_type
        ),
    };

    RowError {
        index: row_index,
        message,
    }
}

fn cell_kind(cell: &Cell) -> &'static str {
    match cell {
        Cell::Null => "null",
        Cell::Bool(_) => "bool",
        Cell::String(_) => "string",
        Cell::I64(_) => "int64",
        Cell::F64(_) => "float64",
        Cell::Bytes(_) => "bytes",
        Cell::Timestamp(_) => "timestamp",
        Cell::DateTime(_) => "datetime",
        Cell::Date(_) => "date",
        Cell::Time(_) => "time",
        Cell::Json(_) => "json",
        Cell::Record(_) => "record",
        Cell::Array(_) => "array",
        Cell::Unconverted(_) => "unconverted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DynamicValue;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::Int64Type;
    use chrono::{DateTime, NaiveDate};

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            FieldDescriptor::new("id", PhysicalType::Int64).required(),
            FieldDescriptor::new("tags", PhysicalType::String).repeated(),
            FieldDescriptor::record(
                "customer",
                vec![
                    FieldDescriptor::new("name", PhysicalType::String),
                    FieldDescriptor::new("joined", PhysicalType::Date),
                ],
            ),
            FieldDescriptor::new("seen_at", PhysicalType::Timestamp),
        ])
    }

    #[test]
    fn column_types_follow_physical_types() {
        assert_eq!(
            build_column_type(&FieldDescriptor::new("t", PhysicalType::Timestamp)),
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
        assert_eq!(
            build_column_type(&FieldDescriptor::new("d", PhysicalType::DateTime)),
            DataType::Timestamp(TimeUnit::Microsecond, None)
        );
        assert_eq!(
            build_column_type(&FieldDescriptor::new("s", PhysicalType::String).repeated()),
            DataType::List(Arc::new(Field::new("item", DataType::LargeUtf8, true)))
        );

        let arrow_schema = build_arrow_schema(&schema());
        assert!(!arrow_schema.field(0).is_nullable());
        assert!(arrow_schema.field(1).is_nullable());
    }

    #[test]
    fn encodes_nested_and_repeated_columns() {
        let seen_at = DateTime::parse_from_rfc3339("2024-01-01T00:00:01Z")
            .unwrap()
            .to_utc();
        let rows = vec![
            NormalizedRow::new(vec![
                Cell::I64(1),
                Cell::Array(vec![
                    Cell::String("a".to_string()),
                    Cell::String("b".to_string()),
                ]),
                Cell::Record(vec![
                    Cell::String("Ana".to_string()),
                    Cell::Date(NaiveDate::from_ymd_opt(1970, 1, 11).unwrap()),
                ]),
                Cell::Timestamp(seen_at),
            ]),
            NormalizedRow::new(vec![Cell::I64(2), Cell::Array(vec![]), Cell::Null, Cell::Null]),
        ];

        let batch = encode_batch(&rows, &schema()).unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.column(0).as_primitive::<Int64Type>().value(1), 2);

        let tags = batch.column(1).as_list::<i32>();
        assert_eq!(tags.value_length(0), 2);
        assert_eq!(tags.value_length(1), 0);

        let customer = batch.column(2).as_struct();
        assert!(customer.is_valid(0));
        assert!(customer.is_null(1));
        assert_eq!(
            customer
                .column(1)
                .as_primitive::<arrow::datatypes::Date32Type>()
                .value(0),
            10
        );

        let seen = batch
            .column(3)
            .as_primitive::<arrow::datatypes::TimestampMicrosecondType>();
        assert_eq!(seen.value(0), seen_at.timestamp_micros());
    }

    #[test]
    fn single_row_batches_encode() {
        let rows = vec![NormalizedRow::new(vec![
            Cell::I64(7),
            Cell::Array(vec![]),
            Cell::Null,
            Cell::Null,
        ])];

        assert_eq!(encode_batch(&rows, &schema()).unwrap().num_rows(), 1);
    }

    #[test]
    fn mismatches_become_row_errors() {
        let rows = vec![
            NormalizedRow::new(vec![Cell::I64(1), Cell::Array(vec![]), Cell::Null, Cell::Null]),
            NormalizedRow::new(vec![
                Cell::Unconverted(DynamicValue::from("abc")),
                Cell::Array(vec![]),
                Cell::Null,
                Cell::Null,
            ]),
            NormalizedRow::new(vec![Cell::Null, Cell::Array(vec![]), Cell::Null, Cell::Null]),
        ];

        let err = encode_batch(&rows, &schema()).unwrap_err();

        assert_eq!(
            err.row_errors.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(err.row_errors[0].message.contains("column `id`"));
        assert!(err.row_errors[1].message.contains("required value is null"));
    }
}

//! Conversion of record batches back into JSON rows for warehouses storing JSON objects.

use arrow::array::{Array, ArrayRef, AsArray, RecordBatch};
use arrow::datatypes::{
    DataType, Date32Type, Float64Type, Int64Type, Time64MicrosecondType, TimeUnit,
    TimestampMicrosecondType,
};
use arrow::error::ArrowError;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};

use crate::types::{
    UNIX_EPOCH_DAYS_FROM_CE, float_to_json, format_date, format_datetime, format_time,
    format_timestamp, time_from_micros,
};

/// Converts a record batch into one JSON object per row, keyed by column name.
///
/// Values render exactly as [`crate::types::Cell::to_json`] renders them.
pub fn record_batch_to_json_rows(batch: &RecordBatch) -> Result<Vec<Map<String, Value>>, ArrowError> {
    let schema = batch.schema();
    let columns = batch
        .columns()
        .iter()
        .map(array_to_json)
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for row_idx in 0..batch.num_rows() {
        let mut row = Map::with_capacity(columns.len());
        for (field, values) in schema.fields().iter().zip(&columns) {
            row.insert(field.name().clone(), values[row_idx].clone());
        }
        rows.push(row);
    }

    Ok(rows)
}

/// Converts every slot of `array` into a JSON value.
fn array_to_json(array: &ArrayRef) -> Result<Vec<Value>, ArrowError> {
    let len = array.len();
    let mut values = Vec::with_capacity(len);

    match array.data_type() {
        DataType::Null => values.resize(len, Value::Null),
        DataType::Boolean => {
            let array = array.as_boolean();
            for row_idx in 0..len {
                values.push(valid(array, row_idx, || Value::Bool(array.value(row_idx))));
            }
        }
        DataType::Int64 => {
            let array = array.as_primitive::<Int64Type>();
            for row_idx in 0..len {
                values.push(valid(array, row_idx, || Value::from(array.value(row_idx))));
            }
        }
        DataType::Float64 => {
            let array = array.as_primitive::<Float64Type>();
            for row_idx in 0..len {
                values.push(valid(array, row_idx, || float_to_json(array.value(row_idx))));
            }
        }
        DataType::LargeUtf8 => {
            let array = array.as_string::<i64>();
            for row_idx in 0..len {
                values.push(valid(array, row_idx, || {
                    Value::String(array.value(row_idx).to_string())
                }));
            }
        }
        DataType::Utf8 => {
            let array = array.as_string::<i32>();
            for row_idx in 0..len {
                values.push(valid(array, row_idx, || {
                    Value::String(array.value(row_idx).to_string())
                }));
            }
        }
        DataType::LargeBinary => {
            let array = array.as_binary::<i64>();
            for row_idx in 0..len {
                values.push(valid(array, row_idx, || {
                    Value::String(BASE64_STANDARD.encode(array.value(row_idx)))
                }));
            }
        }
        DataType::Timestamp(TimeUnit::Microsecond, timezone) => {
            let array = array.as_primitive::<TimestampMicrosecondType>();
            for row_idx in 0..len {
                if array.is_null(row_idx) {
                    values.push(Value::Null);
                    continue;
                }

                let micros = array.value(row_idx);
                let instant = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
                    ArrowError::ComputeError(format!("timestamp {micros} is out of range"))
                })?;
                let rendered = match timezone {
                    Some(_) => format_timestamp(&instant),
                    None => format_datetime(&instant.naive_utc()),
                };
                values.push(Value::String(rendered));
            }
        }
        DataType::Date32 => {
            let array = array.as_primitive::<Date32Type>();
            for row_idx in 0..len {
                if array.is_null(row_idx) {
                    values.push(Value::Null);
                    continue;
                }

                let days = array.value(row_idx);
                let date = days
                    .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
                    .and_then(NaiveDate::from_num_days_from_ce_opt)
                    .ok_or_else(|| ArrowError::ComputeError(format!("date {days} is out of range")))?;
                values.push(Value::String(format_date(&date)));
            }
        }
        DataType::Time64(TimeUnit::Microsecond) => {
            let array = array.as_primitive::<Time64MicrosecondType>();
            for row_idx in 0..len {
                if array.is_null(row_idx) {
                    values.push(Value::Null);
                    continue;
                }

                let micros = array.value(row_idx);
                let time = time_from_micros(micros).ok_or_else(|| {
                    ArrowError::ComputeError(format!("time {micros} is out of range"))
                })?;
                values.push(Value::String(format_time(&time)));
            }
        }
        DataType::Struct(fields) => {
            let array = array.as_struct();
            let children = array
                .columns()
                .iter()
                .map(array_to_json)
                .collect::<Result<Vec<_>, _>>()?;

            for row_idx in 0..len {
                if array.is_null(row_idx) {
                    values.push(Value::Null);
                    continue;
                }

                let object = fields
                    .iter()
                    .zip(&children)
                    .map(|(field, child)| (field.name().clone(), child[row_idx].clone()))
                    .collect();
                values.push(Value::Object(object));
            }
        }
        DataType::List(_) => {
            let array = array.as_list::<i32>();
            let elements = array_to_json(array.values())?;
            let offsets = array.value_offsets();

            for row_idx in 0..len {
                if array.is_null(row_idx) {
                    values.push(Value::Null);
                    continue;
                }

                let start = offsets[row_idx] as usize;
                let end = offsets[row_idx + 1] as usize;
                values.push(Value::Array(elements[start..end].to_vec()));
            }
        }
        other => {
            return Err(ArrowError::NotYetImplemented(format!(
                "JSON rendering of {other} columns"
            )));
        }
    }

    Ok(values)
}

fn valid(array: &dyn Array, row_idx: usize, value: impl FnOnce() -> Value) -> Value {
    if array.is_null(row_idx) {
        Value::Null
    } else {
        value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_batch;
    use crate::types::{Cell, FieldDescriptor, NormalizedRow, PhysicalType, TableSchema};
    use chrono::{NaiveDateTime, NaiveTime};
    use serde_json::json;

    #[test]
    fn decoded_rows_match_cell_json() {
        let schema = TableSchema::new(vec![
            FieldDescriptor::new("id", PhysicalType::Int64),
            FieldDescriptor::new("payload", PhysicalType::Bytes),
            FieldDescriptor::new("local", PhysicalType::DateTime),
            FieldDescriptor::new("at", PhysicalType::Time),
            FieldDescriptor::record(
                "items",
                vec![
                    FieldDescriptor::new("sku", PhysicalType::String),
                    FieldDescriptor::new("qty", PhysicalType::Int64),
                ],
            )
            .repeated(),
        ]);
        let local = NaiveDateTime::parse_from_str("2024-02-03 04:05:06", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        let row = NormalizedRow::new(vec![
            Cell::I64(5),
            Cell::Bytes(b"hi".to_vec()),
            Cell::DateTime(local),
            Cell::Time(NaiveTime::from_hms_opt(7, 8, 9).unwrap()),
            Cell::Array(vec![
                Cell::Record(vec![Cell::String("A".to_string()), Cell::I64(1)]),
                Cell::Record(vec![Cell::String("B".to_string()), Cell::Null]),
            ]),
        ]);

        let batch = encode_batch(std::slice::from_ref(&row), &schema).unwrap();
        let decoded = record_batch_to_json_rows(&batch).unwrap();

        assert_eq!(decoded, vec![row.to_json(&schema)]);
        assert_eq!(
            Value::Object(decoded[0].clone()),
            json!({
                "id": 5,
                "payload": "aGk=",
                "local": "2024-02-03T04:05:06.000000",
                "at": "07:08:09.000000",
                "items": [{"sku": "A", "qty": 1}, {"sku": "B", "qty": null}]
            })
        );
    }
}

//! Storage Write API encoding of record batches.
//!
//! Every top-level column becomes one protobuf field numbered from 1 in schema order. Scalar
//! values use the wire encodings the Storage Write API expects for their BigQuery type, and
//! temporal values are sent as canonical strings.

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::datatypes::{
    DataType, Date32Type, Float64Type, Int64Type, Schema as ArrowSchema, Time64MicrosecondType,
    TimeUnit, TimestampMicrosecondType,
};
use chrono::{DateTime, NaiveDate};
use gcp_bigquery_client::storage::{ColumnMode, ColumnType, FieldDescriptor, TableDescriptor};
use prost::bytes;
use prost::encoding::{self, DecodeContext, WireType};

use crate::error::{RowError, WriteError};
use crate::types::{UNIX_EPOCH_DAYS_FROM_CE, format_date, time_from_micros};

/// Single row already serialized against a [`TableDescriptor`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StorageRow(Vec<u8>);

impl StorageRow {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl prost::Message for StorageRow {
    fn encode_raw(&self, buf: &mut impl bytes::BufMut)
    where
        Self: Sized,
    {
        buf.put_slice(&self.0);
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl bytes::Buf,
        ctx: DecodeContext,
    ) -> Result<(), prost::DecodeError>
    where
        Self: Sized,
    {
        encoding::skip_field(wire_type, tag, buf, ctx)
    }

    fn encoded_len(&self) -> usize {
        self.0.len()
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// Builds the flat protobuf descriptor of a record batch schema.
///
/// Record columns need nested message types the default stream descriptor cannot express, so
/// they are rejected and the caller falls back to a load job.
pub fn table_descriptor(schema: &ArrowSchema) -> Result<TableDescriptor, WriteError> {
    let mut field_descriptors = Vec::with_capacity(schema.fields().len());

    for (number, field) in (1..).zip(schema.fields().iter()) {
        let (data_type, mode) = match field.data_type() {
            DataType::List(element) => (element.data_type(), ColumnMode::Repeated),
            data_type if field.is_nullable() => (data_type, ColumnMode::Nullable),
            data_type => (data_type, ColumnMode::Required),
        };
        let typ = column_type(field.name(), data_type)?;

        field_descriptors.push(FieldDescriptor {
            number,
            name: field.name().clone(),
            typ,
            mode,
        });
    }

    Ok(TableDescriptor { field_descriptors })
}

fn column_type(name: &str, data_type: &DataType) -> Result<ColumnType, WriteError> {
    let typ = match data_type {
        DataType::Boolean => ColumnType::Bool,
        DataType::Int64 => ColumnType::Int64,
        DataType::Float64 => ColumnType::Double,
        DataType::LargeBinary => ColumnType::Bytes,
        DataType::LargeUtf8
        | DataType::Timestamp(TimeUnit::Microsecond, _)
        | DataType::Date32
        | DataType::Time64(TimeUnit::Microsecond) => ColumnType::String,
        DataType::Struct(_) => {
            return Err(WriteError::new(format!(
                "record column `{name}` cannot be streamed through the default stream"
            )));
        }
        other => {
            return Err(WriteError::new(format!(
                "column `{name}` of type {other} cannot be streamed"
            )));
        }
    };

    Ok(typ)
}

/// Serializes every row of `batch`, field numbers following column order.
///
/// `NULL` values are omitted. A `NULL` element inside a repeated column is reported as a row
/// error since the warehouse does not store them.
pub fn record_batch_to_storage_rows(batch: &RecordBatch) -> Result<Vec<StorageRow>, WriteError> {
    let mut rows = vec![StorageRow::default(); batch.num_rows()];
    let mut row_errors = Vec::new();
    let schema = batch.schema();

    for ((tag, field), column) in (1..).zip(schema.fields().iter()).zip(batch.columns()) {
        if let DataType::List(_) = column.data_type() {
            let list = column.as_list::<i32>();
            for (row_idx, row) in rows.iter_mut().enumerate() {
                if list.is_null(row_idx) {
                    continue;
                }

                let elements = list.value(row_idx);
                if elements.null_count() > 0 {
                    row_errors.push(RowError {
                        index: row_idx,
                        message: format!(
                            "repeated column `{}` contains a NULL element",
                            field.name()
                        ),
                    });
                    continue;
                }

                for element_idx in 0..elements.len() {
                    encode_value(tag, elements.as_ref(), element_idx, &mut row.0)?;
                }
            }
            continue;
        }

        for (row_idx, row) in rows.iter_mut().enumerate() {
            if column.is_valid(row_idx) {
                encode_value(tag, column.as_ref(), row_idx, &mut row.0)?;
            }
        }
    }

    if !row_errors.is_empty() {
        return Err(WriteError::with_row_errors(
            format!("{} rows cannot be streamed", row_errors.len()),
            row_errors,
        ));
    }

    Ok(rows)
}

fn encode_value(
    tag: u32,
    array: &dyn Array,
    idx: usize,
    buf: &mut Vec<u8>,
) -> Result<(), WriteError> {
    match array.data_type() {
        DataType::Boolean => encoding::bool::encode(tag, &array.as_boolean().value(idx), buf),
        DataType::Int64 => {
            encoding::int64::encode(tag, &array.as_primitive::<Int64Type>().value(idx), buf)
        }
        DataType::Float64 => {
            encoding::double::encode(tag, &array.as_primitive::<Float64Type>().value(idx), buf)
        }
        DataType::LargeUtf8 => {
            encode_length_delimited(tag, array.as_string::<i64>().value(idx).as_bytes(), buf)
        }
        DataType::LargeBinary => {
            encode_length_delimited(tag, array.as_binary::<i64>().value(idx), buf)
        }
        DataType::Timestamp(TimeUnit::Microsecond, timezone) => {
            let micros = array.as_primitive::<TimestampMicrosecondType>().value(idx);
            let instant = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| WriteError::new(format!("timestamp {micros} is out of range")))?;
            let rendered = match timezone {
                Some(_) => instant.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string(),
                None => instant.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            };
            encode_length_delimited(tag, rendered.as_bytes(), buf);
        }
        DataType::Date32 => {
            let days = array.as_primitive::<Date32Type>().value(idx);
            let date = days
                .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
                .and_then(NaiveDate::from_num_days_from_ce_opt)
                .ok_or_else(|| WriteError::new(format!("date {days} is out of range")))?;
            encode_length_delimited(tag, format_date(&date).as_bytes(), buf);
        }
        DataType::Time64(TimeUnit::Microsecond) => {
            let micros = array.as_primitive::<Time64MicrosecondType>().value(idx);
            let time = time_from_micros(micros)
                .ok_or_else(|| WriteError::new(format!("time {micros} is out of range")))?;
            encode_length_delimited(tag, time.format("%H:%M:%S%.f").to_string().as_bytes(), buf);
        }
        other => {
            return Err(WriteError::new(format!("{other} values cannot be streamed")));
        }
    }

    Ok(())
}

fn encode_length_delimited(tag: u32, value: &[u8], buf: &mut Vec<u8>) {
    encoding::encode_key(tag, WireType::LengthDelimited, buf);
    encoding::encode_varint(value.len() as u64, buf);
    buf.extend_from_slice(value);
}

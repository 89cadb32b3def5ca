//! Canonical records to parquet and back.
//!
//! Every batch has the two envelope columns first, `natural_key` and `received_at`, followed
//! by the schema fields in declaration order.
use anyhow::{anyhow, bail, Result};
use arrow::array::{
    Array, ArrayRef, AsArray, BooleanBuilder, Float64Builder, Int64Builder, ListBuilder,
    StringBuilder, TimestampMillisecondBuilder,
};
use arrow::datatypes::{
    DataType, Field, Float64Type, Int64Type, Schema as ArrowSchema, SchemaRef, TimeUnit,
    TimestampMillisecondType,
};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use feedsink_core::normalizer::CanonicalRecord;
use feedsink_core::record::RecordType;
use feedsink_core::schema::{
    schema_for, ColumnType, FieldValue, Schema, NATURAL_KEY_COLUMN, RECEIVED_AT_COLUMN,
};

const TIMEZONE: &str = "UTC";

/// Number of envelope columns before the schema fields.
const ENVELOPE_COLUMNS: usize = 2;

fn data_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Text => DataType::Utf8,
        ColumnType::Float => DataType::Float64,
        ColumnType::Int => DataType::Int64,
        ColumnType::Bool => DataType::Boolean,
        ColumnType::Timestamp => {
            DataType::Timestamp(TimeUnit::Millisecond, Some(TIMEZONE.into()))
        }
        ColumnType::TextList => {
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true)))
        }
    }
}

/// Arrow schema of the batches of `schema`.
pub fn arrow_schema(schema: &Schema) -> SchemaRef {
    let mut fields = Vec::with_capacity(schema.fields.len() + ENVELOPE_COLUMNS);

    fields.push(Field::new(NATURAL_KEY_COLUMN, DataType::Utf8, false));
    fields.push(Field::new(
        RECEIVED_AT_COLUMN,
        data_type(ColumnType::Timestamp),
        false,
    ));

    for field in schema.fields {
        fields.push(Field::new(
            field.name,
            data_type(field.kind.column_type()),
            field.nullable(),
        ));
    }

    Arc::new(ArrowSchema::new(fields))
}

enum ColumnBuilder {
    Text(StringBuilder),
    Float(Float64Builder),
    Int(Int64Builder),
    Bool(BooleanBuilder),
    Timestamp(TimestampMillisecondBuilder),
    TextList(ListBuilder<StringBuilder>),
}

impl ColumnBuilder {
    fn new(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Text => ColumnBuilder::Text(StringBuilder::new()),
            ColumnType::Float => ColumnBuilder::Float(Float64Builder::new()),
            ColumnType::Int => ColumnBuilder::Int(Int64Builder::new()),
            ColumnType::Bool => ColumnBuilder::Bool(BooleanBuilder::new()),
            ColumnType::Timestamp => ColumnBuilder::Timestamp(
                TimestampMillisecondBuilder::new().with_timezone(TIMEZONE),
            ),
            ColumnType::TextList => ColumnBuilder::TextList(ListBuilder::new(StringBuilder::new())),
        }
    }

    fn append(&mut self, name: &str, value: &FieldValue) -> Result<()> {
        match (self, value) {
            (ColumnBuilder::Text(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Text(b), FieldValue::Text(s)) => b.append_value(s),
            (ColumnBuilder::Float(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Float(b), FieldValue::Float(v)) => b.append_value(*v),
            (ColumnBuilder::Int(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Int(b), FieldValue::Int(v)) => b.append_value(*v),
            (ColumnBuilder::Bool(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Bool(b), FieldValue::Bool(v)) => b.append_value(*v),
            (ColumnBuilder::Timestamp(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Timestamp(b), FieldValue::Timestamp(ts)) => {
                b.append_value(ts.timestamp_millis())
            }
            (ColumnBuilder::TextList(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::TextList(b), FieldValue::TextList(items)) => {
                for item in items {
                    b.values().append_value(item);
                }
                b.append(true);
            }
            (_, value) => bail!("value {:?} does not fit column {}", value, name),
        }

        Ok(())
    }

    fn finish(self) -> ArrayRef {
        match self {
            ColumnBuilder::Text(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Float(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Int(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Bool(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Timestamp(mut b) => Arc::new(b.finish()),
            ColumnBuilder::TextList(mut b) => Arc::new(b.finish()),
        }
    }
}

/// Build one arrow batch from records that all have type `record_type`.
pub fn to_record_batch(record_type: RecordType, records: &[CanonicalRecord]) -> Result<RecordBatch> {
    let schema = schema_for(record_type);

    let mut keys = StringBuilder::new();
    let mut received = TimestampMillisecondBuilder::new().with_timezone(TIMEZONE);
    let mut columns = schema
        .fields
        .iter()
        .map(|f| ColumnBuilder::new(f.kind.column_type()))
        .collect::<Vec<_>>();

    for record in records {
        if record.record_type != record_type || record.values.len() != schema.fields.len() {
            bail!(
                "record {} of type {} does not belong in a {} batch",
                record.natural_key,
                record.record_type,
                record_type
            );
        }

        keys.append_value(&record.natural_key);
        received.append_value(record.received_at.timestamp_millis());

        for ((builder, field), value) in columns.iter_mut().zip(schema.fields).zip(&record.values) {
            builder.append(field.name, value)?;
        }
    }

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len() + ENVELOPE_COLUMNS);
    arrays.push(Arc::new(keys.finish()));
    arrays.push(Arc::new(received.finish()));
    arrays.extend(columns.into_iter().map(|c| c.finish()));

    Ok(RecordBatch::try_new(arrow_schema(schema), arrays)?)
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

/// Encode `batch` as a complete parquet file.
pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(writer_properties()))?;
    writer.write(batch)?;
    writer.close()?;

    Ok(buffer)
}

/// Read every canonical record of a batch file of `record_type`, in row order.
pub fn read_records(path: &Path, record_type: RecordType) -> Result<Vec<CanonicalRecord>> {
    let schema = schema_for(record_type);
    let expected = arrow_schema(schema);

    let file = File::open(path)
        .map_err(|e| anyhow!("open batch failed, path: {}, error: {}", path.display(), e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut records = Vec::new();

    for batch in reader {
        let batch = batch?;

        let names = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect::<Vec<_>>();
        let expected_names = expected
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect::<Vec<_>>();

        if names != expected_names {
            bail!(
                "batch {} does not match the {} schema, columns: {:?}",
                path.display(),
                record_type,
                names
            );
        }

        for row in 0..batch.num_rows() {
            let natural_key = match read_value(batch.column(0), ColumnType::Text, row)? {
                FieldValue::Text(key) => key,
                _ => bail!("null natural key in {}, row: {}", path.display(), row),
            };
            let received_at = match read_value(batch.column(1), ColumnType::Timestamp, row)? {
                FieldValue::Timestamp(ts) => ts,
                _ => bail!("null received_at in {}, row: {}", path.display(), row),
            };

            let mut values = Vec::with_capacity(schema.fields.len());
            for (i, field) in schema.fields.iter().enumerate() {
                values.push(read_value(
                    batch.column(i + ENVELOPE_COLUMNS),
                    field.kind.column_type(),
                    row,
                )?);
            }

            records.push(CanonicalRecord {
                record_type,
                natural_key,
                received_at,
                values,
            });
        }
    }

    Ok(records)
}

fn read_value(array: &ArrayRef, column_type: ColumnType, row: usize) -> Result<FieldValue> {
    if array.is_null(row) {
        return Ok(FieldValue::Null);
    }

    let value = match column_type {
        ColumnType::Text => array
            .as_string_opt::<i32>()
            .map(|a| FieldValue::Text(a.value(row).to_string())),
        ColumnType::Float => array
            .as_primitive_opt::<Float64Type>()
            .map(|a| FieldValue::Float(a.value(row))),
        ColumnType::Int => array
            .as_primitive_opt::<Int64Type>()
            .map(|a| FieldValue::Int(a.value(row))),
        ColumnType::Bool => array
            .as_boolean_opt()
            .map(|a| FieldValue::Bool(a.value(row))),
        ColumnType::Timestamp => array
            .as_primitive_opt::<TimestampMillisecondType>()
            .and_then(|a| millis_to_datetime(a.value(row)))
            .map(FieldValue::Timestamp),
        ColumnType::TextList => array.as_list_opt::<i32>().and_then(|a| {
            let items = a.value(row);
            let items = items.as_string_opt::<i32>()?;
            Some(FieldValue::TextList(
                items
                    .iter()
                    .map(|s| s.unwrap_or_default().to_string())
                    .collect(),
            ))
        }),
    };

    value.ok_or_else(|| {
        anyhow!(
            "column of type {:?} can not be read as {:?}",
            array.data_type(),
            column_type
        )
    })
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

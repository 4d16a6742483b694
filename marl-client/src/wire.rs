//! The binary command stream spoken between clients and tablet cells.
//!
//! This format is an RPC contract shared with clients in other languages
//! and is preserved bit-exact: every integer is little-endian, every
//! command is a 32-bit tag followed by a length-prefixed message and then
//! length-prefixed rows.
//!
//! Row layout: `u16 value_count`, then per value `u16 column_id`,
//! `u8 type_tag`, and a payload whose shape depends on the tag (fixed
//! eight bytes for integers and doubles, one byte for booleans, a
//! `u32`-length-prefixed byte string for strings, nothing for sentinels
//! and nulls).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use marl_data::{Key, UnversionedRow, UnversionedValue, Value, ValueType};
use marl_errors::{MarlError, MarlResult};
use smallvec::SmallVec;

/// Command tags. Part of the wire contract; never renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum WireCommand {
    /// Write one row.
    WriteRow = 1,
    /// Delete the row with the given key.
    DeleteRow = 2,
    /// Look up a batch of keys.
    LookupRows = 3,
    /// Write one row with an explicit commit timestamp (non-atomic path).
    VersionedWriteRow = 4,
}

impl WireCommand {
    fn from_tag(tag: u32) -> MarlResult<WireCommand> {
        match tag {
            1 => Ok(WireCommand::WriteRow),
            2 => Ok(WireCommand::DeleteRow),
            3 => Ok(WireCommand::LookupRows),
            4 => Ok(WireCommand::VersionedWriteRow),
            other => Err(MarlError::InvalidWireCommand(format!(
                "unknown command tag {other}"
            ))),
        }
    }
}

/// Options carried in the `LookupRows` message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LookupRowsRequest {
    /// Indexes of the columns to return; empty means all columns.
    pub column_filter: Vec<u16>,
    /// When false, keys with no matching row are dropped from the
    /// response instead of producing an empty row.
    pub keep_missing_rows: bool,
}

/// Writes a command stream.
#[derive(Debug, Default)]
pub struct WireWriter {
    buffer: BytesMut,
}

impl WireWriter {
    /// Creates an empty writer.
    pub fn new() -> WireWriter {
        WireWriter::default()
    }

    /// Finishes the stream and returns the bytes.
    pub fn finish(self) -> Bytes {
        self.buffer.freeze()
    }

    /// Appends a `WriteRow` command.
    pub fn write_row(&mut self, row: &UnversionedRow) {
        self.command(WireCommand::WriteRow, &[]);
        self.row(row);
    }

    /// Appends a `DeleteRow` command.
    pub fn delete_row(&mut self, key: &Key) {
        self.command(WireCommand::DeleteRow, &[]);
        let row = UnversionedRow::from_pairs(
            key.iter()
                .enumerate()
                .map(|(index, value)| (index as u16, value.clone())),
        );
        self.row(&row);
    }

    /// Appends a `VersionedWriteRow` command with its commit timestamp.
    pub fn versioned_write_row(&mut self, row: &UnversionedRow, commit_timestamp: u64) {
        let mut message = BytesMut::with_capacity(8);
        message.put_u64_le(commit_timestamp);
        self.command(WireCommand::VersionedWriteRow, &message);
        self.row(row);
    }

    /// Appends a `LookupRows` command with its keys.
    pub fn lookup_rows(&mut self, request: &LookupRowsRequest, keys: &[Key]) {
        let mut message = BytesMut::new();
        message.put_u8(u8::from(request.keep_missing_rows));
        message.put_u16_le(request.column_filter.len() as u16);
        for index in &request.column_filter {
            message.put_u16_le(*index);
        }
        self.command(WireCommand::LookupRows, &message);
        self.buffer.put_u32_le(keys.len() as u32);
        for key in keys {
            let row = UnversionedRow::from_pairs(
                key.iter()
                    .enumerate()
                    .map(|(index, value)| (index as u16, value.clone())),
            );
            self.row(&row);
        }
    }

    /// Appends a rowset (used for lookup responses).
    pub fn rowset(&mut self, rows: &[UnversionedRow]) {
        self.buffer.put_u32_le(rows.len() as u32);
        for row in rows {
            self.row(row);
        }
    }

    fn command(&mut self, command: WireCommand, message: &[u8]) {
        self.buffer.put_u32_le(command as u32);
        self.buffer.put_u32_le(message.len() as u32);
        self.buffer.put_slice(message);
    }

    fn row(&mut self, row: &UnversionedRow) {
        let mut body = BytesMut::new();
        body.put_u16_le(row.values.len() as u16);
        for value in &row.values {
            body.put_u16_le(value.id);
            body.put_u8(value.value.value_type() as u8);
            match &value.value {
                Value::Min | Value::Null | Value::Max => {}
                Value::Int64(v) => body.put_i64_le(*v),
                Value::Uint64(v) => body.put_u64_le(*v),
                Value::Double(v) => body.put_f64_le(*v),
                Value::Boolean(v) => body.put_u8(u8::from(*v)),
                Value::String(v) => {
                    body.put_u32_le(v.len() as u32);
                    body.put_slice(v);
                }
            }
        }
        self.buffer.put_u32_le(body.len() as u32);
        self.buffer.put_slice(&body);
    }
}

/// Reads a command stream.
#[derive(Debug)]
pub struct WireReader {
    buffer: Bytes,
}

impl WireReader {
    /// Wraps the raw request bytes.
    pub fn new(buffer: Bytes) -> WireReader {
        WireReader { buffer }
    }

    /// Returns true once the stream is exhausted.
    pub fn is_finished(&self) -> bool {
        !self.buffer.has_remaining()
    }

    /// Reads the next command tag.
    pub fn read_command(&mut self) -> MarlResult<WireCommand> {
        let tag = self.read_u32()?;
        WireCommand::from_tag(tag)
    }

    /// Reads the raw message bytes following a command tag.
    pub fn read_message(&mut self) -> MarlResult<Bytes> {
        let len = self.read_u32()? as usize;
        if self.buffer.remaining() < len {
            return Err(truncated());
        }
        Ok(self.buffer.split_to(len))
    }

    /// Reads the commit timestamp from a `VersionedWriteRow` message.
    pub fn read_versioned_write_message(&mut self) -> MarlResult<u64> {
        let mut message = self.read_message()?;
        if message.remaining() < 8 {
            return Err(truncated());
        }
        Ok(message.get_u64_le())
    }

    /// Reads a `LookupRows` message.
    pub fn read_lookup_message(&mut self) -> MarlResult<LookupRowsRequest> {
        let mut message = self.read_message()?;
        if message.remaining() < 3 {
            return Err(truncated());
        }
        let keep_missing_rows = message.get_u8() != 0;
        let count = message.get_u16_le() as usize;
        let mut column_filter = Vec::with_capacity(count);
        for _ in 0..count {
            if message.remaining() < 2 {
                return Err(truncated());
            }
            column_filter.push(message.get_u16_le());
        }
        Ok(LookupRowsRequest {
            column_filter,
            keep_missing_rows,
        })
    }

    /// Reads one length-prefixed row.
    pub fn read_row(&mut self) -> MarlResult<UnversionedRow> {
        let len = self.read_u32()? as usize;
        if self.buffer.remaining() < len {
            return Err(truncated());
        }
        let mut body = self.buffer.split_to(len);
        let count = get_u16(&mut body)? as usize;
        let mut values = SmallVec::with_capacity(count);
        for _ in 0..count {
            let id = get_u16(&mut body)?;
            let tag = get_u8(&mut body)?;
            let value_type = ValueType::from_tag(tag).ok_or_else(|| {
                MarlError::InvalidWireCommand(format!("unknown value type tag {tag:#x}"))
            })?;
            let value = match value_type {
                ValueType::Min => Value::Min,
                ValueType::Null => Value::Null,
                ValueType::Max => Value::Max,
                ValueType::Int64 => Value::Int64(get_u64(&mut body)? as i64),
                ValueType::Uint64 => Value::Uint64(get_u64(&mut body)?),
                ValueType::Double => Value::Double(f64::from_bits(get_u64(&mut body)?)),
                ValueType::Boolean => Value::Boolean(get_u8(&mut body)? != 0),
                ValueType::String => {
                    let len = get_u32(&mut body)? as usize;
                    if body.remaining() < len {
                        return Err(truncated());
                    }
                    Value::String(body.split_to(len).as_ref().into())
                }
            };
            values.push(UnversionedValue { id, value });
        }
        if body.has_remaining() {
            return Err(MarlError::InvalidWireCommand(
                "trailing bytes after row values".into(),
            ));
        }
        Ok(UnversionedRow { values })
    }

    /// Reads a rowset: a `u32` count followed by that many rows.
    pub fn read_rowset(&mut self) -> MarlResult<Vec<UnversionedRow>> {
        let count = self.read_u32()? as usize;
        let mut rows = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            rows.push(self.read_row()?);
        }
        Ok(rows)
    }

    fn read_u32(&mut self) -> MarlResult<u32> {
        if self.buffer.remaining() < 4 {
            return Err(truncated());
        }
        Ok(self.buffer.get_u32_le())
    }
}

fn truncated() -> MarlError {
    MarlError::InvalidWireCommand("truncated command stream".into())
}

fn get_u8(buf: &mut Bytes) -> MarlResult<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> MarlResult<u16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut Bytes) -> MarlResult<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut Bytes) -> MarlResult<u64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64_le())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_row() -> UnversionedRow {
        UnversionedRow::from_pairs([
            (0, Value::Int64(-7)),
            (1, Value::Uint64(42)),
            (2, Value::from("payload")),
            (3, Value::Null),
            (4, Value::Boolean(true)),
            (5, Value::Double(1.5)),
        ])
    }

    #[test]
    fn write_then_read_commands() {
        let mut writer = WireWriter::new();
        writer.write_row(&sample_row());
        writer.delete_row(&Key::from([Value::Int64(3)]));

        let mut reader = WireReader::new(writer.finish());

        assert_eq!(reader.read_command().unwrap(), WireCommand::WriteRow);
        reader.read_message().unwrap();
        assert_eq!(reader.read_row().unwrap(), sample_row());

        assert_eq!(reader.read_command().unwrap(), WireCommand::DeleteRow);
        reader.read_message().unwrap();
        let key_row = reader.read_row().unwrap();
        assert_eq!(key_row.get(0), Some(&Value::Int64(3)));
        assert!(reader.is_finished());
    }

    #[test]
    fn lookup_round_trip() {
        let request = LookupRowsRequest {
            column_filter: vec![0, 2],
            keep_missing_rows: true,
        };
        let keys = vec![Key::from([Value::Int64(1)]), Key::from([Value::Int64(2)])];

        let mut writer = WireWriter::new();
        writer.lookup_rows(&request, &keys);

        let mut reader = WireReader::new(writer.finish());
        assert_eq!(reader.read_command().unwrap(), WireCommand::LookupRows);
        assert_eq!(reader.read_lookup_message().unwrap(), request);
        let rows = reader.read_rowset().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get(0), Some(&Value::Int64(2)));
    }

    #[test]
    fn byte_layout_is_stable() {
        // The first bytes of a WriteRow command: tag 1, empty message,
        // then the row length prefix. Pinned so accidental layout changes
        // fail loudly.
        let mut writer = WireWriter::new();
        writer.write_row(&UnversionedRow::from_pairs([(0, Value::Int64(1))]));
        let bytes = writer.finish();
        assert_eq!(&bytes[..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
        // row body: count=1, id=0, tag=0x03, payload 8 bytes
        assert_eq!(&bytes[8..12], &[13, 0, 0, 0]);
        assert_eq!(&bytes[12..17], &[1, 0, 0, 0, 0x03]);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buffer = BytesMut::new();
        buffer.put_u32_le(99);
        let mut reader = WireReader::new(buffer.freeze());
        assert!(matches!(
            reader.read_command(),
            Err(MarlError::InvalidWireCommand(_))
        ));
    }
}

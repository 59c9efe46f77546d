use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::Path;

use crate::types::*;

// Markers delimiting the textual settings block at the top of every Trodes
// sidecar file.
const SETTINGS_START: &str = "<Start settings>";
const SETTINGS_END: &str = "<End settings>";

/// Reads a Trodes sidecar file (`.cameraHWSync`, `.videoPositionTracking`,
/// `.videoTimeStamps`, ...) into settings plus typed columns.
///
/// The file begins with a textual settings block. The `fields` setting
/// describes the packed little-endian record layout of the remainder of the
/// file, which is read in full. A trailing partial record is ignored.
///
/// # Arguments
///
/// * `file_path` - Path to the sidecar file to read
///
/// # Returns
///
/// A `Result` containing either the parsed `TrodesFile` or an error.
pub fn load_file<P: AsRef<Path>>(file_path: P) -> Result<TrodesFile, TrodesError> {
    let file = File::open(file_path.as_ref())?;
    let mut reader = BufReader::with_capacity(65536, file); // 64KB buffer

    let settings = read_settings_block(&mut reader)?;

    let fields_str = settings
        .get("fields")
        .ok_or_else(|| TrodesError::FieldNotFound("fields".to_string()))?;
    let fields = parse_fields(fields_str)?;

    let (columns, num_records) = read_records(&mut reader, &fields)?;

    Ok(TrodesFile {
        settings,
        fields,
        columns,
        num_records,
    })
}

/// Reads the settings block into a lowercased-key map.
///
/// The first line must be `<Start settings>`; lines up to `<End settings>`
/// are `key: value` pairs.
fn read_settings_block<R: BufRead>(
    reader: &mut R,
) -> Result<HashMap<String, String>, TrodesError> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim() != SETTINGS_START {
        return Err(TrodesError::UnsupportedSettingsFormat);
    }

    let mut settings = HashMap::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            // EOF before the end marker
            return Err(TrodesError::UnsupportedSettingsFormat);
        }
        let trimmed = line.trim();
        if trimmed == SETTINGS_END {
            break;
        }
        let (key, value) = trimmed
            .split_once(": ")
            .ok_or_else(|| TrodesError::MalformedSettingsLine(trimmed.to_string()))?;
        settings.insert(key.to_lowercase(), value.to_string());
    }

    Ok(settings)
}

/// Parses a Trodes `fields` string into an ordered record layout.
///
/// The string is a sequence of `<name type>` groups, e.g.
/// `<time uint32><xloc uint16><yloc uint16>`. The type token may carry a
/// repeat count written either `3*float32` or `float32*3`.
pub fn parse_fields(fields_str: &str) -> Result<Vec<FieldSpec>, TrodesError> {
    let flattened = fields_str
        .replace("><", " ")
        .replace('>', " ")
        .replace('<', " ");
    let tokens: Vec<&str> = flattened.split_whitespace().collect();

    let mut fields = Vec::with_capacity(tokens.len() / 2);

    // Tokens alternate between field name and type
    for pair in tokens.chunks(2) {
        if pair.len() != 2 {
            return Err(TrodesError::MalformedSettingsLine(fields_str.to_string()));
        }
        let name = pair[0];
        let type_token = pair[1];

        let (ty, repeats) = match type_token.split_once('*') {
            Some((a, b)) => {
                // Either num*dtype or dtype*num
                if let Ok(count) = a.parse::<usize>() {
                    (FieldType::from_name(b)?, count)
                } else if let Ok(count) = b.parse::<usize>() {
                    (FieldType::from_name(a)?, count)
                } else {
                    return Err(TrodesError::InvalidFieldType(type_token.to_string()));
                }
            }
            None => (FieldType::from_name(type_token)?, 1),
        };

        fields.push(FieldSpec {
            name: name.to_string(),
            ty,
            repeats,
        });
    }

    Ok(fields)
}

/// Reads all packed records following the settings block into per-field
/// columns.
fn read_records<R: Read>(
    reader: &mut R,
    fields: &[FieldSpec],
) -> Result<(HashMap<String, Column>, usize), TrodesError> {
    let record_size: usize = fields.iter().map(|f| f.byte_size()).sum();

    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    // Trailing bytes that do not form a complete record are dropped
    let num_records = if record_size > 0 {
        bytes.len() / record_size
    } else {
        0
    };

    let mut columns: Vec<Column> = fields
        .iter()
        .map(|f| empty_column(f.ty, num_records * f.repeats))
        .collect();

    let mut cursor = Cursor::new(&bytes[..num_records * record_size]);
    for _ in 0..num_records {
        for (field, column) in fields.iter().zip(columns.iter_mut()) {
            for _ in 0..field.repeats {
                read_value(&mut cursor, column)?;
            }
        }
    }

    let columns = fields
        .iter()
        .map(|f| f.name.clone())
        .zip(columns)
        .collect();

    Ok((columns, num_records))
}

/// Creates an empty column of the given type with preallocated capacity.
fn empty_column(ty: FieldType, capacity: usize) -> Column {
    match ty {
        FieldType::U8 => Column::U8(Vec::with_capacity(capacity)),
        FieldType::I8 => Column::I8(Vec::with_capacity(capacity)),
        FieldType::U16 => Column::U16(Vec::with_capacity(capacity)),
        FieldType::I16 => Column::I16(Vec::with_capacity(capacity)),
        FieldType::U32 => Column::U32(Vec::with_capacity(capacity)),
        FieldType::I32 => Column::I32(Vec::with_capacity(capacity)),
        FieldType::U64 => Column::U64(Vec::with_capacity(capacity)),
        FieldType::I64 => Column::I64(Vec::with_capacity(capacity)),
        FieldType::F32 => Column::F32(Vec::with_capacity(capacity)),
        FieldType::F64 => Column::F64(Vec::with_capacity(capacity)),
    }
}

/// Reads one little-endian value of the column's type and appends it.
fn read_value<R: Read>(reader: &mut R, column: &mut Column) -> Result<(), TrodesError> {
    match column {
        Column::U8(v) => v.push(reader.read_u8()?),
        Column::I8(v) => v.push(reader.read_i8()?),
        Column::U16(v) => v.push(reader.read_u16::<LittleEndian>()?),
        Column::I16(v) => v.push(reader.read_i16::<LittleEndian>()?),
        Column::U32(v) => v.push(reader.read_u32::<LittleEndian>()?),
        Column::I32(v) => v.push(reader.read_i32::<LittleEndian>()?),
        Column::U64(v) => v.push(reader.read_u64::<LittleEndian>()?),
        Column::I64(v) => v.push(reader.read_i64::<LittleEndian>()?),
        Column::F32(v) => v.push(reader.read_f32::<LittleEndian>()?),
        Column::F64(v) => v.push(reader.read_f64::<LittleEndian>()?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_sidecar(fields: &str, body: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "<Start settings>\nClock rate: 30000\nFields: {}\n<End settings>\n",
            fields
        )
        .unwrap();
        file.write_all(body).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn parses_simple_field_string() {
        let fields =
            parse_fields("<time uint32><x float32><y float32><z float32>").unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].name, "time");
        assert_eq!(fields[0].ty, FieldType::U32);
        assert_eq!(fields[1].ty, FieldType::F32);
        assert_eq!(fields[3].name, "z");
        assert!(fields.iter().all(|f| f.repeats == 1));
    }

    #[test]
    fn parses_repeat_counts_in_both_orders() {
        let fields = parse_fields("<a 3*float32><b uint16*2>").unwrap();
        assert_eq!(fields[0].repeats, 3);
        assert_eq!(fields[0].ty, FieldType::F32);
        assert_eq!(fields[1].repeats, 2);
        assert_eq!(fields[1].ty, FieldType::U16);
        assert_eq!(fields[0].byte_size(), 12);
    }

    #[test]
    fn rejects_unknown_field_type() {
        let err = parse_fields("<time uint24>").unwrap_err();
        assert!(matches!(err, TrodesError::InvalidFieldType(ref t) if t == "uint24"));
    }

    #[test]
    fn rejects_missing_settings_marker() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a settings block").unwrap();
        let err = load_file(file.path()).unwrap_err();
        assert!(matches!(err, TrodesError::UnsupportedSettingsFormat));
    }

    #[test]
    fn reads_records_and_settings() {
        let mut body = Vec::new();
        for (t, x) in [(10u32, 1.5f32), (11, 2.5), (12, 3.5)] {
            body.extend_from_slice(&t.to_le_bytes());
            body.extend_from_slice(&x.to_le_bytes());
        }
        let file = write_sidecar("<time uint32><xloc float32>", &body);

        let parsed = load_file(file.path()).unwrap();
        assert_eq!(parsed.num_records, 3);
        assert_eq!(parsed.settings.get("clock rate").unwrap(), "30000");
        assert_eq!(
            parsed.column("time").unwrap().as_i64().to_vec(),
            vec![10, 11, 12]
        );
        assert_eq!(
            parsed.column("xloc").unwrap().as_f64().to_vec(),
            vec![1.5, 2.5, 3.5]
        );
    }

    #[test]
    fn drops_trailing_partial_record() {
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&1.0f32.to_le_bytes());
        body.extend_from_slice(&[0xde, 0xad]); // incomplete second record
        let file = write_sidecar("<time uint32><xloc float32>", &body);

        let parsed = load_file(file.path()).unwrap();
        assert_eq!(parsed.num_records, 1);
    }

    #[test]
    fn missing_column_lookup_fails() {
        let file = write_sidecar("<time uint32>", &5u32.to_le_bytes());
        let parsed = load_file(file.path()).unwrap();
        let err = parsed.column("yloc").unwrap_err();
        assert!(matches!(err, TrodesError::FieldNotFound(ref n) if n == "yloc"));
    }
}

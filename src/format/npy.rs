//! NumPy `.npy` writer with in-place header updates
//!
//! File structure (format version 1.0):
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  0x93 "NUMPY" 0x01 0x00                      │
//! │  header length (u16 LE)                      │
//! │  {'descr': ..., 'fortran_order': False,      │
//! │   'shape': (N, ...), }   <spaces> \n         │  padded to 64 bytes
//! ├──────────────────────────────────────────────┤
//! │  N records, little endian, C order           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The record count `N` is unknown while recording. The writer remembers
//! the byte offset of the shape tuple and rewrites it every time the count
//! crosses a multiple of `RECORD_BUFFER_SIZE`, and once more on close, so
//! a file cut short by a crash is still readable up to the last update.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use super::FormatError;

/// NPY magic prefix
pub const NPY_MAGIC: [u8; 6] = *b"\x93NUMPY";

/// Header alignment in bytes
const HEADER_ALIGN: usize = 64;

/// Magic (6) + version (2) + header length field (2)
const PREAMBLE_LEN: usize = 10;

/// The header is rewritten whenever the record count crosses a multiple
/// of this many records
pub const RECORD_BUFFER_SIZE: u64 = 1024;

/// Element type of an NPY field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

/// One field of an NPY record: a name, a base type and a length
///
/// For `Char` the length is the string length and the field is a single
/// null-terminated byte string; for numeric types it is an array length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyType {
    pub name: String,
    pub base: BaseType,
    pub length: usize,
}

impl NpyType {
    pub fn new(base: BaseType, length: usize) -> Self {
        Self {
            name: String::new(),
            base,
            length,
        }
    }

    pub fn named(name: impl Into<String>, base: BaseType, length: usize) -> Self {
        Self {
            name: name.into(),
            base,
            length,
        }
    }

    /// NumPy dtype string, e.g. `<i8` or `|S33`
    pub fn descr(&self) -> String {
        match self.base {
            BaseType::Char => format!("|S{}", self.length + 1),
            BaseType::I8 => "|i1".into(),
            BaseType::U8 => "|u1".into(),
            BaseType::I16 => "<i2".into(),
            BaseType::U16 => "<u2".into(),
            BaseType::I32 => "<i4".into(),
            BaseType::U32 => "<u4".into(),
            BaseType::I64 => "<i8".into(),
            BaseType::U64 => "<u8".into(),
            BaseType::F32 => "<f4".into(),
            BaseType::F64 => "<f8".into(),
        }
    }

    /// Array length contributed to the shape; strings count as one element
    pub fn type_length(&self) -> usize {
        match self.base {
            BaseType::Char => 1,
            _ => self.length,
        }
    }
}

/// Values that can be written as NPY elements
pub trait NpyElement: Copy {
    const SIZE: usize;

    fn put_le(self, buf: &mut Vec<u8>);

    fn from_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_npy_element {
    ($($t:ty),*) => {
        $(
            impl NpyElement for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn put_le(self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn from_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_npy_element!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// Writer for one `.npy` file
pub struct NpyFile {
    path: PathBuf,
    writer: BufWriter<File>,
    shape_pos: u64,
    header_len: u64,
    dim1: usize,
    dim2: usize,
    record_count: u64,
    scratch: Vec<u8>,
    closed: bool,
}

impl NpyFile {
    /// Create a file whose records consist of `fields`.
    ///
    /// A single numeric field of length `n > 1` produces a 2-D array of
    /// shape `(N, n)`; several fields produce a structured array.
    pub fn create(path: impl AsRef<Path>, fields: &[NpyType]) -> Result<Self, FormatError> {
        let dim1 = match fields {
            [only] if only.base != BaseType::Char => only.length,
            _ => 1,
        };
        Self::open(path.as_ref(), fields, dim1, 1)
    }

    /// Create a file of shape `(N, dim, type_length)` for a single field
    pub fn create_with_dim(
        path: impl AsRef<Path>,
        field: NpyType,
        dim: usize,
    ) -> Result<Self, FormatError> {
        let dim2 = field.type_length();
        Self::open(path.as_ref(), std::slice::from_ref(&field), dim, dim2)
    }

    fn open(path: &Path, fields: &[NpyType], dim1: usize, dim2: usize) -> Result<Self, FormatError> {
        let file = File::create(path)?;
        let mut npy = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            shape_pos: 0,
            header_len: 0,
            dim1,
            dim2,
            record_count: 0,
            scratch: Vec::new(),
            closed: false,
        };
        npy.write_header(fields)?;
        Ok(npy)
    }

    fn write_header(&mut self, fields: &[NpyType]) -> Result<(), FormatError> {
        let mut header = String::from("{'descr': ");
        header.push_str(&descr_for(fields));
        header.push_str(", 'fortran_order': False, 'shape': ");

        self.shape_pos = (PREAMBLE_LEN + header.len()) as u64;
        header.push_str(&self.shape_string());

        let base_len = PREAMBLE_LEN + header.len() + 1;
        let pad = HEADER_ALIGN - (base_len % HEADER_ALIGN);
        header.extend(std::iter::repeat(' ').take(pad));
        header.push('\n');

        let header_len = u16::try_from(header.len())
            .map_err(|_| FormatError::MalformedHeader("header exceeds 65535 bytes".into()))?;

        self.writer.write_all(&NPY_MAGIC)?;
        self.writer.write_all(&[1, 0])?;
        self.writer.write_all(&header_len.to_le_bytes())?;
        self.writer.write_all(header.as_bytes())?;
        self.writer.flush()?;
        self.header_len = (PREAMBLE_LEN + header.len()) as u64;
        Ok(())
    }

    fn shape_string(&self) -> String {
        let mut shape = format!("({},", self.record_count);
        if self.dim1 > 1 {
            shape.push_str(&format!(" {},", self.dim1));
        }
        if self.dim2 > 1 {
            shape.push_str(&format!(" {}", self.dim2));
        }
        shape.push_str("), }");
        shape
    }

    /// Rewrite the shape tuple in place, then return to the end of file
    pub fn update_header(&mut self) -> Result<(), FormatError> {
        let shape = self.shape_string();
        if self.shape_pos + shape.len() as u64 + 1 > self.header_len {
            error!(
                path = %self.path.display(),
                records = self.record_count,
                "NPY header has grown too big to update in place"
            );
            return Ok(());
        }

        self.writer.flush()?;
        let file = self.writer.get_mut();
        let end = file.stream_position()?;
        file.seek(SeekFrom::Start(self.shape_pos))?;
        file.write_all(shape.as_bytes())?;
        file.flush()?;
        file.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Append raw record bytes; the caller accounts for the records with
    /// `increase_record_count`
    pub fn write_data(&mut self, bytes: &[u8]) -> Result<(), FormatError> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    /// Append typed values as little-endian bytes
    pub fn write_values<V: NpyElement>(&mut self, values: &[V]) -> Result<(), FormatError> {
        self.scratch.clear();
        self.scratch.reserve(values.len() * V::SIZE);
        for &v in values {
            v.put_le(&mut self.scratch);
        }
        self.writer.write_all(&self.scratch)?;
        Ok(())
    }

    /// Account for `count` appended records, updating the header whenever
    /// a `RECORD_BUFFER_SIZE` boundary is crossed
    pub fn increase_record_count(&mut self, count: u64) -> Result<(), FormatError> {
        let old = self.record_count;
        self.record_count += count;
        if old / RECORD_BUFFER_SIZE != self.record_count / RECORD_BUFFER_SIZE {
            self.update_header()?;
        }
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush data and write the final record count
    pub fn close(mut self) -> Result<(), FormatError> {
        self.closed = true;
        self.writer.flush()?;
        self.update_header()
    }
}

impl Drop for NpyFile {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.writer.flush().map_err(FormatError::from).and_then(|_| self.update_header()) {
            warn!(path = %self.path.display(), error = %e, "Failed to finalize NPY file");
        }
    }
}

impl std::fmt::Debug for NpyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NpyFile")
            .field("path", &self.path)
            .field("record_count", &self.record_count)
            .finish()
    }
}

fn descr_for(fields: &[NpyType]) -> String {
    match fields {
        [only] => format!("'{}'", only.descr()),
        _ => {
            let parts: Vec<String> = fields
                .iter()
                .map(|f| format!("('{}', '{}', ({},))", f.name, f.descr(), f.type_length()))
                .collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

/// Parsed `.npy` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub descr: String,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
    /// Byte offset of the first record
    pub data_offset: usize,
}

impl NpyHeader {
    /// Parse the header at the start of `reader`
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FormatError> {
        let mut preamble = [0u8; PREAMBLE_LEN];
        reader.read_exact(&mut preamble)?;
        if preamble[..6] != NPY_MAGIC {
            return Err(FormatError::InvalidMagic);
        }
        if preamble[6] != 1 {
            return Err(FormatError::UnsupportedVersion {
                major: preamble[6],
                minor: preamble[7],
            });
        }
        let len = u16::from_le_bytes([preamble[8], preamble[9]]) as usize;
        let mut raw = vec![0u8; len];
        reader.read_exact(&mut raw)?;
        let text = String::from_utf8(raw)
            .map_err(|_| FormatError::MalformedHeader("header is not UTF-8".into()))?;

        let descr = between(&text, "'descr': ", ", 'fortran_order'")?.trim().to_string();
        let descr = descr
            .strip_prefix('\'')
            .and_then(|d| d.strip_suffix('\''))
            .map(str::to_string)
            .unwrap_or(descr);
        let fortran_order = between(&text, "'fortran_order': ", ",")?.trim() == "True";
        let shape = between(&text, "'shape': (", ")")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|_| FormatError::MalformedHeader(format!("bad shape entry '{s}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            descr,
            fortran_order,
            shape,
            data_offset: PREAMBLE_LEN + len,
        })
    }

    /// Number of records (first shape dimension)
    pub fn record_count(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Elements per record (product of the remaining dimensions)
    pub fn record_width(&self) -> usize {
        self.shape.iter().skip(1).product()
    }
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> Result<&'a str, FormatError> {
    let from = text
        .find(start)
        .map(|i| i + start.len())
        .ok_or_else(|| FormatError::MalformedHeader(format!("missing {start}")))?;
    let len = text[from..]
        .find(end)
        .ok_or_else(|| FormatError::MalformedHeader(format!("unterminated {start}")))?;
    Ok(&text[from..from + len])
}

/// Read a whole single-dtype `.npy` file
pub fn read_npy<V: NpyElement>(
    path: impl AsRef<Path>,
    expected_descr: &str,
) -> Result<(NpyHeader, Vec<V>), FormatError> {
    let mut file = File::open(path)?;
    let header = NpyHeader::read_from(&mut file)?;
    if header.descr != expected_descr {
        return Err(FormatError::DtypeMismatch {
            expected: expected_descr.to_string(),
            actual: header.descr,
        });
    }
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    let values = raw.chunks_exact(V::SIZE).map(V::from_le).collect();
    Ok((header, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_descr_strings() {
        assert_eq!(NpyType::new(BaseType::I64, 1).descr(), "<i8");
        assert_eq!(NpyType::new(BaseType::U8, 1).descr(), "|u1");
        assert_eq!(NpyType::new(BaseType::Char, 32).descr(), "|S33");
        assert_eq!(NpyType::new(BaseType::Char, 32).type_length(), 1);
    }

    #[test]
    fn test_header_is_aligned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ts.npy");
        let npy = NpyFile::create(&path, &[NpyType::new(BaseType::I64, 1)]).unwrap();
        npy.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() % HEADER_ALIGN, 0);
        assert_eq!(&bytes[..6], &NPY_MAGIC);
        assert_eq!(*bytes.last().unwrap(), b'\n');
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ts.npy");
        let mut npy = NpyFile::create(&path, &[NpyType::new(BaseType::I64, 1)]).unwrap();

        let values: Vec<i64> = (0..3000).collect();
        npy.write_values(&values).unwrap();
        npy.increase_record_count(values.len() as u64).unwrap();
        npy.close().unwrap();

        let (header, read) = read_npy::<i64>(&path, "<i8").unwrap();
        assert_eq!(header.shape, vec![3000]);
        assert!(!header.fortran_order);
        assert_eq!(read, values);
    }

    #[test]
    fn test_header_updated_at_buffer_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.npy");
        let mut npy = NpyFile::create(&path, &[NpyType::new(BaseType::I16, 1)]).unwrap();

        npy.write_values(&vec![0i16; 1500]).unwrap();
        npy.increase_record_count(1500).unwrap();

        // Not closed: the on-disk header reflects the last boundary update.
        let mut file = File::open(&path).unwrap();
        let header = NpyHeader::read_from(&mut file).unwrap();
        assert_eq!(header.shape, vec![1500]);
        drop(npy);

        let mut file = File::open(&path).unwrap();
        assert_eq!(NpyHeader::read_from(&mut file).unwrap().shape, vec![1500]);
    }

    #[test]
    fn test_header_updated_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.npy");
        {
            let mut npy = NpyFile::create(&path, &[NpyType::new(BaseType::F64, 1)]).unwrap();
            npy.write_values(&[1.0f64, 2.0, 3.0]).unwrap();
            npy.increase_record_count(3).unwrap();
        }
        let (header, values) = read_npy::<f64>(&path, "<f8").unwrap();
        assert_eq!(header.record_count(), 3);
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_multidimensional_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("words.npy");
        let mut npy = NpyFile::create(&path, &[NpyType::new(BaseType::U8, 8)]).unwrap();
        npy.write_values(&[0u8; 16]).unwrap();
        npy.increase_record_count(2).unwrap();
        npy.close().unwrap();

        let mut file = File::open(&path).unwrap();
        let header = NpyHeader::read_from(&mut file).unwrap();
        assert_eq!(header.descr, "|u1");
        assert_eq!(header.shape, vec![2, 8]);
        assert_eq!(header.record_width(), 8);
    }

    #[test]
    fn test_create_with_dim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("waveforms.npy");
        let npy =
            NpyFile::create_with_dim(&path, NpyType::new(BaseType::I16, 40), 4).unwrap();
        npy.close().unwrap();

        let mut file = File::open(&path).unwrap();
        let header = NpyHeader::read_from(&mut file).unwrap();
        assert_eq!(header.shape, vec![0, 4, 40]);
    }

    #[test]
    fn test_structured_descr() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.npy");
        let fields = [
            NpyType::named("gain", BaseType::F32, 1),
            NpyType::named("ids", BaseType::U16, 2),
        ];
        NpyFile::create(&path, &fields).unwrap().close().unwrap();

        let mut file = File::open(&path).unwrap();
        let header = NpyHeader::read_from(&mut file).unwrap();
        assert_eq!(header.descr, "[('gain', '<f4', (1,)), ('ids', '<u2', (2,))]");
        assert_eq!(header.shape, vec![0]);
    }

    #[test]
    fn test_shape_too_long_for_header_keeps_file_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("impedance.npy");
        // This descr leaves two bytes of padding, so a four-digit count
        // no longer fits in the header.
        let fields = [
            NpyType::named("electrode_impedance_kohm", BaseType::I16, 1),
            NpyType::named("b", BaseType::I16, 1),
        ];
        let mut npy = NpyFile::create(&path, &fields).unwrap();
        let records: Vec<i16> = (0..4000).map(|i| i as i16).collect();
        npy.write_values(&records).unwrap();
        npy.increase_record_count(2000).unwrap();
        assert_eq!(npy.record_count(), 2000);
        npy.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header = NpyHeader::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(header.data_offset % HEADER_ALIGN, 0);
        assert_eq!(header.shape, vec![0]);
        assert_eq!(
            header.descr,
            "[('electrode_impedance_kohm', '<i2', (1,)), ('b', '<i2', (1,))]"
        );
        assert_eq!(bytes.len(), header.data_offset + 4000 * 2);
        let first = &bytes[header.data_offset..header.data_offset + 4];
        assert_eq!(first, &[0, 0, 1, 0]);
    }

    #[test]
    fn test_invalid_magic() {
        let data = b"NOTNPY\x01\x00\x00\x00".to_vec();
        let result = NpyHeader::read_from(&mut data.as_slice());
        assert!(matches!(result, Err(FormatError::InvalidMagic)));
    }
}

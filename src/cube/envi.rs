//! ENVI header and raster I/O.
//!
//! Headers are plain text: a leading `ENVI` line followed by `key = value`
//! pairs, where a value opened with `{` may continue across lines until the
//! matching `}`. Rasters are read in any of the common numeric types and
//! interleaves and always written back as little-endian 32-bit float BSQ.

use ndarray::Array3;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{AppResult, SnapError};

/// Sample encoding, keyed by the ENVI `data type` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Code 1.
    U8,
    /// Code 2.
    I16,
    /// Code 3.
    I32,
    /// Code 4.
    F32,
    /// Code 5.
    F64,
    /// Code 12.
    U16,
    /// Code 13.
    U32,
    /// Code 14.
    I64,
    /// Code 15.
    U64,
}

impl DataType {
    /// Type for an ENVI `data type` code.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::U8,
            2 => Self::I16,
            3 => Self::I32,
            4 => Self::F32,
            5 => Self::F64,
            12 => Self::U16,
            13 => Self::U32,
            14 => Self::I64,
            15 => Self::U64,
            _ => return None,
        })
    }

    /// ENVI `data type` code.
    pub fn code(self) -> u32 {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::I32 => 3,
            Self::F32 => 4,
            Self::F64 => 5,
            Self::U16 => 12,
            Self::U32 => 13,
            Self::I64 => 14,
            Self::U64 => 15,
        }
    }

    /// Bytes per sample.
    pub fn size_bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 | Self::I64 | Self::U64 => 8,
        }
    }

    fn decode(self, bytes: &[u8], big_endian: bool) -> f64 {
        macro_rules! read {
            ($t:ty, $n:literal) => {{
                let mut buf = [0u8; $n];
                buf.copy_from_slice(&bytes[..$n]);
                if big_endian {
                    <$t>::from_be_bytes(buf) as f64
                } else {
                    <$t>::from_le_bytes(buf) as f64
                }
            }};
        }
        match self {
            Self::U8 => f64::from(bytes[0]),
            Self::I16 => read!(i16, 2),
            Self::U16 => read!(u16, 2),
            Self::I32 => read!(i32, 4),
            Self::U32 => read!(u32, 4),
            Self::F32 => read!(f32, 4),
            Self::F64 => read!(f64, 8),
            Self::I64 => read!(i64, 8),
            Self::U64 => read!(u64, 8),
        }
    }
}

/// Band layout of the raster file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interleave {
    /// Band sequential.
    Bsq,
    /// Band interleaved by line.
    Bil,
    /// Band interleaved by pixel.
    Bip,
}

impl Interleave {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bsq" => Some(Self::Bsq),
            "bil" => Some(Self::Bil),
            "bip" => Some(Self::Bip),
            _ => None,
        }
    }
}

/// Parsed ENVI header.
///
/// The structural keys are held in typed fields. Every other key is kept in
/// `fields`, in file order, with its raw value (braces included) so that it
/// can be written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnviHeader {
    /// Columns.
    pub samples: usize,
    /// Rows.
    pub lines: usize,
    /// Spectral bands.
    pub bands: usize,
    /// Bytes to skip at the start of the raster file.
    pub header_offset: usize,
    /// Sample encoding.
    pub data_type: DataType,
    /// Sample ordering.
    pub interleave: Interleave,
    /// `byte order = 1`.
    pub big_endian: bool,
    /// Every other key, in file order, carried through on write.
    pub fields: Vec<(String, String)>,
}

const STRUCTURAL_KEYS: [&str; 8] = [
    "samples",
    "lines",
    "bands",
    "header offset",
    "data type",
    "interleave",
    "byte order",
    "file type",
];

impl EnviHeader {
    /// Header for a little-endian f32 BSQ raster of the given shape.
    pub fn for_shape(lines: usize, samples: usize, bands: usize) -> Self {
        Self {
            samples,
            lines,
            bands,
            header_offset: 0,
            data_type: DataType::F32,
            interleave: Interleave::Bsq,
            big_endian: false,
            fields: Vec::new(),
        }
    }

    /// Read and parse a `.hdr` file.
    pub fn read(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text).map_err(|reason| SnapError::envi(path, reason))
    }

    /// Parse header text. Braced values may span lines; `;` starts a comment.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut lines = text.lines();
        match lines.next() {
            Some(first) if first.trim() == "ENVI" => {}
            _ => return Err("missing ENVI signature".into()),
        }

        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut pending: Option<(String, String)> = None;
        for line in lines {
            if let Some((key, mut value)) = pending.take() {
                value.push('\n');
                value.push_str(line.trim_end());
                if line.contains('}') {
                    pairs.push((key, value));
                } else {
                    pending = Some((key, value));
                }
                continue;
            }

            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(format!("line without '=': {line}"));
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if value.starts_with('{') && !value.contains('}') {
                pending = Some((key, value));
            } else {
                pairs.push((key, value));
            }
        }
        if let Some((key, _)) = pending {
            return Err(format!("unterminated value for '{key}'"));
        }

        let lookup = |key: &str| -> Option<&str> {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        let required_usize = |key: &str| -> Result<usize, String> {
            let value = lookup(key).ok_or_else(|| format!("missing '{key}'"))?;
            value
                .parse::<usize>()
                .map_err(|_| format!("'{key}' is not a count: {value}"))
        };

        let samples = required_usize("samples")?;
        let lines = required_usize("lines")?;
        let bands = required_usize("bands")?;
        let header_offset = match lookup("header offset") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| format!("'header offset' is not a count: {v}"))?,
            None => 0,
        };
        let data_type = {
            let value = lookup("data type").ok_or("missing 'data type'")?;
            value
                .parse::<u32>()
                .ok()
                .and_then(DataType::from_code)
                .ok_or_else(|| format!("unsupported data type: {value}"))?
        };
        let interleave = match lookup("interleave") {
            Some(v) => Interleave::parse(v).ok_or_else(|| format!("unknown interleave: {v}"))?,
            None => Interleave::Bsq,
        };
        let big_endian = match lookup("byte order") {
            Some("1") => true,
            Some("0") | None => false,
            Some(other) => return Err(format!("unknown byte order: {other}")),
        };

        let fields = pairs
            .into_iter()
            .filter(|(k, _)| !STRUCTURAL_KEYS.contains(&k.as_str()))
            .collect();

        Ok(Self {
            samples,
            lines,
            bands,
            header_offset,
            data_type,
            interleave,
            big_endian,
            fields,
        })
    }

    /// Raw value of a non-structural key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Header text describing `data` as written by [`write_cube`].
    fn render_for(&self, lines: usize, samples: usize, bands: usize) -> String {
        let mut out = String::from("ENVI\n");
        out.push_str(&format!("samples = {samples}\n"));
        out.push_str(&format!("lines = {lines}\n"));
        out.push_str(&format!("bands = {bands}\n"));
        out.push_str("header offset = 0\n");
        out.push_str("file type = ENVI Standard\n");
        out.push_str(&format!("data type = {}\n", DataType::F32.code()));
        out.push_str("interleave = bsq\n");
        out.push_str("byte order = 0\n");
        for (key, value) in &self.fields {
            out.push_str(&format!("{key} = {value}\n"));
        }
        out
    }
}

/// Read the raster described by `header` into a `(lines, samples, bands)` array.
pub fn read_raster(header: &EnviHeader, data_path: &Path) -> AppResult<Array3<f64>> {
    let (lines, samples, bands) = (header.lines, header.samples, header.bands);
    let width = header.data_type.size_bytes();
    let needed = lines
        .checked_mul(samples)
        .and_then(|n| n.checked_mul(bands))
        .and_then(|n| n.checked_mul(width))
        .and_then(|n| n.checked_add(header.header_offset))
        .ok_or_else(|| SnapError::envi(data_path, "raster size overflows"))?;
    let bytes = fs::read(data_path)?;
    if bytes.len() < needed {
        return Err(SnapError::envi(
            data_path,
            format!("expected at least {needed} bytes, found {}", bytes.len()),
        ));
    }

    let values: Vec<f64> = bytes[header.header_offset..needed]
        .chunks_exact(width)
        .map(|chunk| header.data_type.decode(chunk, header.big_endian))
        .collect();

    let shape_error = |e: ndarray::ShapeError| SnapError::envi(data_path, e.to_string());
    let cube = match header.interleave {
        Interleave::Bsq => Array3::from_shape_vec((bands, lines, samples), values)
            .map_err(shape_error)?
            .permuted_axes([1, 2, 0]),
        Interleave::Bil => Array3::from_shape_vec((lines, bands, samples), values)
            .map_err(shape_error)?
            .permuted_axes([0, 2, 1]),
        Interleave::Bip => {
            Array3::from_shape_vec((lines, samples, bands), values).map_err(shape_error)?
        }
    };
    Ok(cube.as_standard_layout().into_owned())
}

/// Read a header/raster pair.
pub fn read_cube(header_path: &Path, data_path: &Path) -> AppResult<(EnviHeader, Array3<f64>)> {
    let header = EnviHeader::read(header_path)?;
    let data = read_raster(&header, data_path)?;
    debug!(
        "Loaded cube {} with shape {:?}",
        header_path.display(),
        data.dim()
    );
    Ok((header, data))
}

/// Write `data` as a little-endian f32 BSQ raster plus header.
///
/// Both files go to temporary names first and are renamed into place, raster
/// before header.
pub fn write_cube(
    header_path: &Path,
    data_path: &Path,
    header: &EnviHeader,
    data: &Array3<f64>,
) -> AppResult<()> {
    let (lines, samples, bands) = data.dim();

    write_atomically(data_path, |writer| {
        for b in 0..bands {
            for l in 0..lines {
                for s in 0..samples {
                    // Narrowing to f32 is the on-disk format
                    writer.write_all(&(data[[l, s, b]] as f32).to_le_bytes())?;
                }
            }
        }
        Ok(())
    })?;

    let text = header.render_for(lines, samples, bands);
    write_atomically(header_path, |writer| writer.write_all(text.as_bytes()))?;
    debug!("Wrote cube {}", header_path.display());
    Ok(())
}

/// Write through a sibling temporary file, then rename over `path`.
pub(crate) fn write_atomically<F>(path: &Path, write: F) -> AppResult<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let temp = temp_path(path);
    let result = (|| -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(&temp)?);
        write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    fs::rename(&temp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use itertools::Itertools;
use nalgebra::Vector3;

use msicore::data::image::{voxel_count, ImageVolume, PixelType};
use msicore::error::{MsiError, Result};

use crate::exchange::parameters::format_invariant;

fn nrrd_type_name(pixel_type: PixelType) -> &'static str {
    match pixel_type {
        PixelType::UChar => "uchar",
        PixelType::Short => "short",
        PixelType::UShort => "ushort",
        PixelType::Int => "int",
        PixelType::Float => "float",
        PixelType::Double => "double",
    }
}

fn parse_nrrd_type(name: &str) -> Option<PixelType> {
    match name.trim() {
        "uchar" | "unsigned char" | "uint8" | "uint8_t" => Some(PixelType::UChar),
        "short" | "short int" | "signed short" | "signed short int" | "int16" | "int16_t" => {
            Some(PixelType::Short)
        }
        "ushort" | "unsigned short" | "unsigned short int" | "uint16" | "uint16_t" => {
            Some(PixelType::UShort)
        }
        "int" | "signed int" | "int32" | "int32_t" => Some(PixelType::Int),
        "float" => Some(PixelType::Float),
        "double" => Some(PixelType::Double),
        _ => None,
    }
}

fn vector_text(values: &[f64]) -> String {
    format!("({})", values.iter().map(|v| format_invariant(*v)).join(","))
}

/// Write an image as a NRRD file with attached raw little-endian data.
///
/// # Arguments
///
/// * `path` - target file
/// * `image` - 2D or 3D image; samples are quantized to the image pixel type
///
pub fn write_nrrd(path: &Path, image: &ImageVolume) -> Result<()> {
    image.check_dimensionality()?;
    let dim = image.dimension();
    let spacing = image.spacing();
    let origin = image.origin();

    let directions: Vec<String> = (0..dim)
        .map(|axis| {
            let mut v = vec![0.0; dim];
            v[axis] = spacing[axis];
            vector_text(&v)
        })
        .collect();
    let origin: Vec<f64> = (0..dim).map(|axis| origin[axis]).collect();

    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "NRRD0004")?;
    writeln!(writer, "# written by msistack")?;
    writeln!(writer, "type: {}", nrrd_type_name(image.pixel_type()))?;
    writeln!(writer, "dimension: {}", dim)?;
    writeln!(writer, "space dimension: {}", dim)?;
    writeln!(writer, "sizes: {}", image.sizes().iter().join(" "))?;
    writeln!(writer, "space directions: {}", directions.iter().join(" "))?;
    writeln!(writer, "kinds: {}", vec!["domain"; dim].join(" "))?;
    writeln!(writer, "endian: little")?;
    writeln!(writer, "encoding: raw")?;
    writeln!(writer, "space origin: {}", vector_text(&origin))?;
    writeln!(writer)?;

    let pixel_type = image.pixel_type();
    for value in image.data() {
        let v = pixel_type.quantize(*value);
        match pixel_type {
            PixelType::UChar => writer.write_u8(v as u8)?,
            PixelType::Short => writer.write_i16::<LittleEndian>(v as i16)?,
            PixelType::UShort => writer.write_u16::<LittleEndian>(v as u16)?,
            PixelType::Int => writer.write_i32::<LittleEndian>(v as i32)?,
            PixelType::Float => writer.write_f32::<LittleEndian>(v as f32)?,
            PixelType::Double => writer.write_f64::<LittleEndian>(v)?,
        }
    }
    writer.flush()?;
    Ok(())
}

struct NrrdHeader {
    pixel_type: PixelType,
    sizes: Vec<usize>,
    spacing: Vector3<f64>,
    origin: Vector3<f64>,
    big_endian: bool,
}

fn parse_vectors(text: &str) -> Vec<Option<Vec<f64>>> {
    text.split_whitespace()
        .map(|token| {
            if token == "none" {
                return None;
            }
            token
                .trim_start_matches('(')
                .trim_end_matches(')')
                .split(',')
                .map(|v| v.trim().parse::<f64>().ok())
                .collect::<Option<Vec<f64>>>()
        })
        .collect()
}

fn parse_header(header: &str) -> Result<NrrdHeader> {
    let mut lines = header.lines();
    match lines.next() {
        Some(magic) if magic.starts_with("NRRD") => {}
        _ => return Err(MsiError::format("missing NRRD magic")),
    }

    let mut pixel_type = None;
    let mut sizes: Vec<usize> = Vec::new();
    let mut spacing = Vector3::new(1.0, 1.0, 1.0);
    let mut origin = Vector3::zeros();
    let mut big_endian = false;

    for line in lines {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        // key/value pairs (`key:=value`) carry no geometry
        if value.starts_with('=') {
            continue;
        }
        let value = value.trim();
        match key.trim() {
            "type" => {
                pixel_type = Some(parse_nrrd_type(value).ok_or_else(|| {
                    MsiError::format(format!("unsupported NRRD type '{}'", value))
                })?)
            }
            "sizes" => {
                sizes = value
                    .split_whitespace()
                    .map(|s| s.parse::<usize>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| MsiError::format(format!("bad sizes '{}': {}", value, e)))?
            }
            "spacings" => {
                for (axis, s) in value.split_whitespace().take(3).enumerate() {
                    if let Ok(s) = s.parse::<f64>() {
                        spacing[axis] = s;
                    }
                }
            }
            "space directions" => {
                let mut axis = 0;
                for direction in parse_vectors(value).into_iter().flatten() {
                    if axis < 3 {
                        spacing[axis] = direction.iter().map(|d| d * d).sum::<f64>().sqrt();
                    }
                    axis += 1;
                }
            }
            "space origin" => {
                if let Some(Some(o)) = parse_vectors(value).into_iter().next() {
                    for (axis, v) in o.into_iter().take(3).enumerate() {
                        origin[axis] = v;
                    }
                }
            }
            "endian" => big_endian = value == "big",
            "encoding" => {
                if value != "raw" {
                    return Err(MsiError::format(format!("unsupported NRRD encoding '{}'", value)));
                }
            }
            "data file" | "datafile" => {
                return Err(MsiError::format("detached NRRD data files are not supported"));
            }
            _ => {}
        }
    }

    Ok(NrrdHeader {
        pixel_type: pixel_type.ok_or_else(|| MsiError::format("NRRD header without type"))?,
        sizes,
        spacing,
        origin,
        big_endian,
    })
}

fn read_samples<B: ByteOrder>(
    cursor: &mut Cursor<&[u8]>,
    pixel_type: PixelType,
    count: usize,
) -> std::io::Result<Vec<f64>> {
    let mut data = Vec::with_capacity(count);
    for _ in 0..count {
        let v = match pixel_type {
            PixelType::UChar => cursor.read_u8()? as f64,
            PixelType::Short => cursor.read_i16::<B>()? as f64,
            PixelType::UShort => cursor.read_u16::<B>()? as f64,
            PixelType::Int => cursor.read_i32::<B>()? as f64,
            PixelType::Float => cursor.read_f32::<B>()? as f64,
            PixelType::Double => cursor.read_f64::<B>()?,
        };
        data.push(v);
    }
    Ok(data)
}

/// Read a NRRD file with attached raw data.
pub fn read_nrrd(path: &Path) -> Result<ImageVolume> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let (header_end, data_start) = find_header_end(&bytes)
        .ok_or_else(|| MsiError::format(format!("no NRRD header in {}", path.display())))?;
    let header_text = String::from_utf8_lossy(&bytes[..header_end]);
    let header = parse_header(&header_text)?;

    let count = voxel_count(&header.sizes)
        .ok_or_else(|| MsiError::format(format!("NRRD sizes {:?} overflow in {}", header.sizes, path.display())))?;
    let available = bytes.len() - data_start;
    match count.checked_mul(header.pixel_type.byte_size()) {
        Some(needed) if needed <= available => {}
        _ => {
            return Err(MsiError::format(format!(
                "truncated NRRD data in {}: sizes {:?} need more than the {} bytes present",
                path.display(),
                header.sizes,
                available
            )))
        }
    }
    let mut cursor = Cursor::new(&bytes[data_start..]);
    let data = if header.big_endian {
        read_samples::<BigEndian>(&mut cursor, header.pixel_type, count)
    } else {
        read_samples::<LittleEndian>(&mut cursor, header.pixel_type, count)
    }
    .map_err(|e| MsiError::format(format!("truncated NRRD data in {}: {}", path.display(), e)))?;

    ImageVolume::from_data(&header.sizes, header.spacing, header.origin, header.pixel_type, data)
}

fn find_header_end(bytes: &[u8]) -> Option<(usize, usize)> {
    if let Some(i) = bytes.windows(2).position(|w| w == b"\n\n") {
        return Some((i, i + 2));
    }
    bytes
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, i + 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_keeps_geometry_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slice.nrrd");
        let image = ImageVolume::from_data(
            &[3, 2],
            Vector3::new(0.5, 2.0, 1.0),
            Vector3::new(10.0, -4.0, 0.0),
            PixelType::Short,
            vec![1.0, -2.0, 3.4, 4.0, 5.0, 6.0],
        )
        .unwrap();
        write_nrrd(&path, &image).unwrap();

        let loaded = read_nrrd(&path).unwrap();
        assert_eq!(loaded.sizes(), &[3, 2]);
        assert_eq!(loaded.pixel_type(), PixelType::Short);
        assert!(loaded.same_geometry(&image));
        assert_eq!(loaded.data(), &[1.0, -2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_reads_big_endian_spacings_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("be.nrrd");
        let mut bytes = b"NRRD0004\ntype: ushort\ndimension: 2\nsizes: 2 1\nspacings: 3 4\nendian: big\nencoding: raw\n\n".to_vec();
        bytes.extend_from_slice(&[0x01, 0x00, 0x00, 0x02]);
        std::fs::write(&path, bytes).unwrap();

        let loaded = read_nrrd(&path).unwrap();
        assert_eq!(loaded.data(), &[256.0, 2.0]);
        assert_eq!(loaded.spacing().x, 3.0);
        assert_eq!(loaded.spacing().y, 4.0);
    }

    #[test]
    fn test_rejects_compressed_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gz.nrrd");
        std::fs::write(&path, b"NRRD0004\ntype: float\ndimension: 2\nsizes: 1 1\nencoding: gzip\n\n").unwrap();
        assert!(matches!(read_nrrd(&path), Err(MsiError::Format(_))));
    }

    #[test]
    fn test_rejects_sizes_beyond_the_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.nrrd");
        let mut bytes = b"NRRD0004\ntype: float\ndimension: 2\nsizes: 4294967296 4294967296\nencoding: raw\n\n".to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_nrrd(&path), Err(MsiError::Format(_))));

        let path = dir.path().join("short.nrrd");
        let mut bytes = b"NRRD0004\ntype: double\ndimension: 2\nsizes: 1000 1000\nencoding: raw\n\n".to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_nrrd(&path), Err(MsiError::Format(_))));
    }
}

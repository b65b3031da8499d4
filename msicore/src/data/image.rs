use std::fmt;
use std::fmt::{Display, Formatter};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{MsiError, Result};

const GEOMETRY_EPSILON: f64 = 1e-6;

/// Pixel type tag of an image volume.
///
/// # Description
///
/// Samples are always held as `f64` in memory, the tag decides how the volume is written
/// to disk and which `ResultImagePixelType` the warp engine is asked to produce.
///
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum PixelType {
    UChar,
    Short,
    UShort,
    Int,
    Float,
    Double,
}

impl PixelType {
    /// Returns the pixel type name understood by the alignment and warp engines.
    pub fn engine_name(&self) -> &'static str {
        match self {
            PixelType::UChar => "unsigned char",
            PixelType::Short => "short",
            PixelType::UShort => "unsigned short",
            PixelType::Int => "int",
            PixelType::Float => "float",
            PixelType::Double => "double",
        }
    }

    /// Parses an engine pixel type name, e.g. `"float"` or `"unsigned char"`.
    pub fn from_engine_name(name: &str) -> Option<PixelType> {
        match name.trim().trim_matches('"') {
            "unsigned char" | "uchar" | "uint8" | "uint8_t" => Some(PixelType::UChar),
            "short" | "int16" | "int16_t" | "signed short" => Some(PixelType::Short),
            "unsigned short" | "ushort" | "uint16" | "uint16_t" => Some(PixelType::UShort),
            "int" | "int32" | "int32_t" | "signed int" => Some(PixelType::Int),
            "float" => Some(PixelType::Float),
            "double" => Some(PixelType::Double),
            _ => None,
        }
    }

    /// Size of one sample on disk in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            PixelType::UChar => 1,
            PixelType::Short | PixelType::UShort => 2,
            PixelType::Int | PixelType::Float => 4,
            PixelType::Double => 8,
        }
    }

    /// Clamps and rounds a value into the representable range of the pixel type.
    pub fn quantize(&self, value: f64) -> f64 {
        match self {
            PixelType::UChar => value.round().clamp(0.0, u8::MAX as f64),
            PixelType::Short => value.round().clamp(i16::MIN as f64, i16::MAX as f64),
            PixelType::UShort => value.round().clamp(0.0, u16::MAX as f64),
            PixelType::Int => value.round().clamp(i32::MIN as f64, i32::MAX as f64),
            PixelType::Float => value as f32 as f64,
            PixelType::Double => value,
        }
    }
}

impl Default for PixelType {
    fn default() -> Self {
        PixelType::Float
    }
}

impl Display for PixelType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.engine_name())
    }
}

/// A 2D, 3D or (rejected) 4D scalar raster with spacing and origin.
///
/// Voxels are stored x-fastest, then y, then z.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageVolume {
    sizes: Vec<usize>,
    spacing: Vector3<f64>,
    origin: Vector3<f64>,
    pixel_type: PixelType,
    data: Vec<f64>,
    generation: u64,
}

impl Default for ImageVolume {
    fn default() -> Self {
        ImageVolume {
            sizes: vec![0, 0],
            spacing: Vector3::new(1.0, 1.0, 1.0),
            origin: Vector3::zeros(),
            pixel_type: PixelType::default(),
            data: Vec::new(),
            generation: 0,
        }
    }
}

/// Number of voxels of a volume with the given sizes, `None` if it overflows `usize`.
pub fn voxel_count(sizes: &[usize]) -> Option<usize> {
    sizes.iter().try_fold(1usize, |acc, s| acc.checked_mul(*s))
}

fn checked_len(sizes: &[usize]) -> Result<usize> {
    if sizes.len() < 2 || sizes.len() > 4 {
        return Err(MsiError::DimensionalityUnsupported { shape: sizes.to_vec() });
    }
    voxel_count(sizes).ok_or_else(|| MsiError::InvalidInput(format!("voxel count of {:?} overflows", sizes)))
}

impl ImageVolume {
    /// Allocates a zero-filled volume.
    ///
    /// # Arguments
    ///
    /// * `sizes` - number of voxels per axis, two to four axes
    /// * `spacing` - physical voxel spacing (the z component is kept for 2D images)
    /// * `origin` - physical position of the first voxel
    /// * `pixel_type` - on-disk / engine pixel type
    ///
    pub fn zeros(
        sizes: &[usize],
        spacing: Vector3<f64>,
        origin: Vector3<f64>,
        pixel_type: PixelType,
    ) -> Result<Self> {
        let len = checked_len(sizes)?;
        Ok(ImageVolume {
            sizes: sizes.to_vec(),
            spacing,
            origin,
            pixel_type,
            data: vec![0.0; len],
            generation: 0,
        })
    }

    /// Wraps an existing sample buffer, the buffer length must match the sizes.
    pub fn from_data(
        sizes: &[usize],
        spacing: Vector3<f64>,
        origin: Vector3<f64>,
        pixel_type: PixelType,
        data: Vec<f64>,
    ) -> Result<Self> {
        let len = checked_len(sizes)?;
        if data.len() != len {
            return Err(MsiError::DimensionMismatch {
                expected: len,
                actual: data.len(),
            });
        }
        Ok(ImageVolume {
            sizes: sizes.to_vec(),
            spacing,
            origin,
            pixel_type,
            data,
            generation: 0,
        })
    }

    /// A zero-filled image with the geometry of `self` and the given pixel type.
    pub fn like(&self, pixel_type: PixelType) -> Self {
        ImageVolume {
            sizes: self.sizes.clone(),
            spacing: self.spacing,
            origin: self.origin,
            pixel_type,
            data: vec![0.0; self.data.len()],
            generation: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.sizes.len()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Size along `axis`, axes beyond the dimensionality count as 1.
    pub fn size(&self, axis: usize) -> usize {
        self.sizes.get(axis).copied().unwrap_or(1)
    }

    /// Number of elements in one z-layer.
    pub fn layer_len(&self) -> usize {
        self.size(0) * self.size(1)
    }

    pub fn depth(&self) -> usize {
        self.size(2)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    pub fn set_spacing(&mut self, spacing: Vector3<f64>) {
        self.spacing = spacing;
    }

    pub fn origin(&self) -> &Vector3<f64> {
        &self.origin
    }

    pub fn set_origin(&mut self, origin: Vector3<f64>) {
        self.origin = origin;
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f64> {
        if x >= self.size(0) || y >= self.size(1) || z >= self.size(2) {
            return None;
        }
        self.data.get(z * self.layer_len() + y * self.size(0) + x).copied()
    }

    /// Counter bumped by [`ImageVolume::mark_modified`].
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mark_modified(&mut self) {
        self.generation += 1;
    }

    /// True for 2D images and 3D images (with unit or full depth); 4D is rejected.
    pub fn has_supported_dimensionality(&self) -> bool {
        matches!(self.dimension(), 2 | 3)
    }

    pub fn check_dimensionality(&self) -> Result<()> {
        if self.has_supported_dimensionality() {
            Ok(())
        } else {
            Err(MsiError::DimensionalityUnsupported { shape: self.sizes.clone() })
        }
    }

    /// Reduces a unit-depth 3D image to 2D; 2D and full 3D images are returned as copies.
    pub fn to_2d(&self) -> Result<ImageVolume> {
        self.check_dimensionality()?;
        let mut image = self.clone();
        if image.dimension() == 3 && image.sizes[2] == 1 {
            image.sizes.truncate(2);
        }
        Ok(image)
    }

    /// Expands a 2D image to a unit-depth 3D image; 3D images are returned as copies.
    pub fn to_3d(&self) -> Result<ImageVolume> {
        self.check_dimensionality()?;
        let mut image = self.clone();
        if image.dimension() == 2 {
            image.sizes.push(1);
        }
        Ok(image)
    }

    /// Compares sizes, spacing and origin within a small tolerance.
    ///
    /// A 2D image and its unit-depth 3D counterpart share the same geometry.
    pub fn same_geometry(&self, other: &ImageVolume) -> bool {
        let axes = self.dimension().max(other.dimension());
        let sizes_equal = (0..axes).all(|axis| self.size(axis) == other.size(axis));
        let close = |a: &Vector3<f64>, b: &Vector3<f64>| {
            (a - b).iter().all(|d| d.abs() <= GEOMETRY_EPSILON)
        };
        let in_plane = |v: &Vector3<f64>| Vector3::new(v.x, v.y, 0.0);

        // the third spacing component of a 2D image carries no information
        if self.depth() == 1 && other.depth() == 1 {
            sizes_equal
                && close(&in_plane(&self.spacing), &in_plane(&other.spacing))
                && close(&in_plane(&self.origin), &in_plane(&other.origin))
        } else {
            sizes_equal && close(&self.spacing, &other.spacing) && close(&self.origin, &other.origin)
        }
    }

    /// Human-readable shape, e.g. `[64x48x1]`.
    pub fn shape_string(&self) -> String {
        let sizes: Vec<String> = self.sizes.iter().map(|s| s.to_string()).collect();
        format!("[{}]", sizes.join("x"))
    }

    /// Borrow the samples of z-layer `z`.
    pub fn layer(&self, z: usize) -> Result<&[f64]> {
        if z >= self.depth() {
            return Err(MsiError::IndexOutOfRange { index: z, len: self.depth() });
        }
        let n = self.layer_len();
        Ok(&self.data[z * n..(z + 1) * n])
    }

    /// Copies the first layer of `source` into z-layer `z` of `self`.
    ///
    /// Both checks run before any sample is written, so a failing copy leaves `self`
    /// untouched.
    ///
    /// # Arguments
    ///
    /// * `z` - destination layer index
    /// * `source` - 2D or unit-depth image with the same number of in-plane elements
    ///
    pub fn write_layer(&mut self, z: usize, source: &ImageVolume) -> Result<()> {
        let n = self.layer_len();
        let source_n = source.layer_len();
        if source_n != n {
            return Err(MsiError::DimensionMismatch { expected: n, actual: source_n });
        }
        if z >= self.depth() {
            return Err(MsiError::IndexOutOfRange { index: z, len: self.depth() });
        }
        let pixel_type = self.pixel_type;
        self.data[z * n..(z + 1) * n]
            .iter_mut()
            .zip(source.data[..source_n].iter())
            .for_each(|(dst, src)| *dst = pixel_type.quantize(*src));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> Vector3<f64> {
        Vector3::new(1.0, 1.0, 1.0)
    }

    #[test]
    fn test_dimensionality_check() {
        for sizes in [vec![4, 3], vec![4, 3, 1], vec![4, 3, 5]] {
            let image = ImageVolume::zeros(&sizes, unit(), Vector3::zeros(), PixelType::Float).unwrap();
            assert!(image.has_supported_dimensionality());
            assert!(image.check_dimensionality().is_ok());
        }
        let image = ImageVolume::zeros(&[4, 3, 2, 2], unit(), Vector3::zeros(), PixelType::Float).unwrap();
        assert!(!image.has_supported_dimensionality());
        assert!(matches!(
            image.to_2d(),
            Err(MsiError::DimensionalityUnsupported { .. })
        ));
    }

    #[test]
    fn test_to_2d_and_back() {
        let image = ImageVolume::zeros(&[4, 3, 1], Vector3::new(1.0, 1.0, 7.5), Vector3::zeros(), PixelType::Float).unwrap();
        let flat = image.to_2d().unwrap();
        assert_eq!(flat.dimension(), 2);
        let expanded = flat.to_3d().unwrap();
        assert_eq!(expanded.sizes(), &[4, 3, 1]);
        assert_eq!(expanded.spacing().z, 7.5);
        assert!(image.same_geometry(&flat));
    }

    #[test]
    fn test_write_layer_rejects_mismatch_without_writing() {
        let mut stack = ImageVolume::zeros(&[4, 3, 2], unit(), Vector3::zeros(), PixelType::Double).unwrap();
        let wrong = ImageVolume::from_data(&[5, 3], unit(), Vector3::zeros(), PixelType::Double, vec![1.0; 15]).unwrap();
        assert!(matches!(
            stack.write_layer(0, &wrong),
            Err(MsiError::DimensionMismatch { expected: 12, actual: 15 })
        ));
        assert!(stack.data().iter().all(|v| *v == 0.0));

        let right = ImageVolume::from_data(&[4, 3], unit(), Vector3::zeros(), PixelType::Double, vec![2.0; 12]).unwrap();
        assert!(matches!(
            stack.write_layer(2, &right),
            Err(MsiError::IndexOutOfRange { index: 2, len: 2 })
        ));
        stack.write_layer(1, &right).unwrap();
        assert!(stack.layer(0).unwrap().iter().all(|v| *v == 0.0));
        assert!(stack.layer(1).unwrap().iter().all(|v| *v == 2.0));
    }

    #[test]
    fn test_quantize_short() {
        assert_eq!(PixelType::Short.quantize(2.6), 3.0);
        assert_eq!(PixelType::Short.quantize(1e9), i16::MAX as f64);
        assert_eq!(PixelType::from_engine_name("\"unsigned char\""), Some(PixelType::UChar));
    }

    #[test]
    fn test_overflowing_sizes_are_rejected() {
        let huge = [usize::MAX / 2, 3, 1];
        assert_eq!(voxel_count(&huge), None);
        assert!(matches!(
            ImageVolume::zeros(&huge, unit(), Vector3::zeros(), PixelType::Float),
            Err(MsiError::InvalidInput(_))
        ));
        assert!(matches!(
            ImageVolume::from_data(&huge, unit(), Vector3::zeros(), PixelType::Float, vec![0.0; 4]),
            Err(MsiError::InvalidInput(_))
        ));
        assert_eq!(voxel_count(&[4, 3, 2]), Some(24));
    }
}

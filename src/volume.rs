//! Volume handles and the image metadata capability
//!
//! A `Volume` is only a path; geometry, orientation and intensities are
//! queried lazily through an `ImageReader`.

use crate::error::{CestError, CestResult};
use ndarray::{ArrayD, IxDyn};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Handle to an on-disk image artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Volume {
    path: PathBuf,
}

impl Volume {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn geometry(&self, reader: &dyn ImageReader) -> CestResult<VolumeGeometry> {
        reader.geometry(&self.path)
    }

    pub fn orientation(&self, reader: &dyn ImageReader) -> CestResult<Orientation> {
        reader.orientation(&self.path)
    }

    pub fn is_oblique(&self, reader: &dyn ImageReader) -> CestResult<bool> {
        Ok(self.orientation(reader)?.is_oblique())
    }
}

impl From<PathBuf> for Volume {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&Path> for Volume {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

/// Voxel grid of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    /// Grid dimensions, x first
    pub shape: Vec<usize>,
    /// Voxel spacing in mm (x, y, z)
    pub voxel_size: [f64; 3],
}

impl VolumeGeometry {
    /// Number of slices along z (1 for 2D images)
    pub fn n_slices(&self) -> usize {
        self.shape.get(2).copied().unwrap_or(1)
    }
}

/// Index-to-world orientation: the three rows of a 3x4 affine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub rows: [[f64; 4]; 3],
}

impl Orientation {
    pub fn from_voxel_size(voxel_size: [f64; 3]) -> Self {
        Self {
            rows: [
                [voxel_size[0], 0.0, 0.0, 0.0],
                [0.0, voxel_size[1], 0.0, 0.0],
                [0.0, 0.0, voxel_size[2], 0.0],
            ],
        }
    }

    /// True when any grid axis is not aligned with a world axis
    pub fn is_oblique(&self) -> bool {
        (0..3).any(|col| {
            let nonzero = (0..3)
                .filter(|&row| self.rows[row][col].abs() > 1e-6)
                .count();
            nonzero > 1
        })
    }
}

/// Read-only access to image headers and intensities
pub trait ImageReader: Send + Sync {
    fn geometry(&self, path: &Path) -> CestResult<VolumeGeometry>;

    fn orientation(&self, path: &Path) -> CestResult<Orientation>;

    /// Raw intensities, indexed `[x, y, z, ...]`
    fn intensities(&self, path: &Path) -> CestResult<ArrayD<f32>>;

    /// True when every voxel is zero
    fn is_all_zero(&self, path: &Path) -> CestResult<bool> {
        Ok(self.intensities(path)?.iter().all(|v| *v == 0.0))
    }
}

/// `ImageReader` for NIfTI-1 files (`.nii`, `.nii.gz`)
#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiReader;

impl NiftiReader {
    pub fn new() -> Self {
        Self
    }

    fn header(path: &Path) -> CestResult<NiftiHeader> {
        NiftiHeader::from_file(path)
            .map_err(|e| CestError::ImageRead(format!("{}: {}", path.display(), e)))
    }
}

impl ImageReader for NiftiReader {
    fn geometry(&self, path: &Path) -> CestResult<VolumeGeometry> {
        let header = Self::header(path)?;
        let ndim = (header.dim[0] as usize).clamp(1, 7);
        let shape = (1..=ndim).map(|i| header.dim[i] as usize).collect();
        let voxel_size = [
            header.pixdim[1] as f64,
            header.pixdim[2] as f64,
            header.pixdim[3] as f64,
        ];
        if voxel_size.iter().any(|v| *v <= 0.0) {
            return Err(CestError::ImageRead(format!(
                "{}: non-positive voxel size {:?}",
                path.display(),
                voxel_size
            )));
        }
        Ok(VolumeGeometry { shape, voxel_size })
    }

    fn orientation(&self, path: &Path) -> CestResult<Orientation> {
        let header = Self::header(path)?;
        if header.sform_code == 0 {
            let voxel_size = [
                header.pixdim[1] as f64,
                header.pixdim[2] as f64,
                header.pixdim[3] as f64,
            ];
            return Ok(Orientation::from_voxel_size(voxel_size));
        }
        let row = |r: [f32; 4]| [r[0] as f64, r[1] as f64, r[2] as f64, r[3] as f64];
        Ok(Orientation {
            rows: [row(header.srow_x), row(header.srow_y), row(header.srow_z)],
        })
    }

    fn intensities(&self, path: &Path) -> CestResult<ArrayD<f32>> {
        let object = ReaderOptions::new()
            .read_file(path)
            .map_err(|e| CestError::ImageRead(format!("{}: {}", path.display(), e)))?;
        let array = object
            .into_volume()
            .into_ndarray::<f32>()
            .map_err(|e| CestError::ImageRead(format!("{}: {}", path.display(), e)))?;

        // Rebuild in logical order so the result does not depend on the
        // reader's memory layout.
        let shape = array.shape().to_vec();
        let values: Vec<f32> = array.iter().copied().collect();
        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| CestError::ImageRead(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_aligned_is_not_oblique() {
        let orientation = Orientation::from_voxel_size([0.1, 0.1, 0.5]);
        assert!(!orientation.is_oblique());
    }

    #[test]
    fn test_rotated_is_oblique() {
        let c = 0.1 * (0.2f64).cos();
        let s = 0.1 * (0.2f64).sin();
        let orientation = Orientation {
            rows: [[c, -s, 0.0, 1.0], [s, c, 0.0, 2.0], [0.0, 0.0, 0.5, 3.0]],
        };
        assert!(orientation.is_oblique());
    }

    #[test]
    fn test_geometry_slices() {
        let geometry = VolumeGeometry {
            shape: vec![64, 64, 12],
            voxel_size: [0.1, 0.1, 0.5],
        };
        assert_eq!(geometry.n_slices(), 12);

        let flat = VolumeGeometry {
            shape: vec![64, 64],
            voxel_size: [0.1, 0.1, 0.5],
        };
        assert_eq!(flat.n_slices(), 1);
    }

    #[test]
    fn test_nifti_reader_missing_file() {
        let reader = NiftiReader::new();
        let result = reader.geometry(Path::new("/nonexistent/anat.nii"));
        assert!(matches!(result, Err(CestError::ImageRead(_))));
    }

    #[test]
    fn test_volume_exists() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(Volume::new(file.path()).exists());
        assert!(!Volume::new("/nonexistent/cest.nii").exists());
    }
}

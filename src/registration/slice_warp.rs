//! Slice-by-slice nonlinear warping
//!
//! Thin slabs and strong through-plane distortion make whole-volume warps
//! unreliable. Here every slice along z is warped on its own with a
//! 2D-constrained nonlinear registration and the results are stacked back
//! in slice order.
//!
//! Per slice `i`:
//! 1. cut slice `i` out of source and reference, restore their obliquity
//! 2. resample both to the target in-plane voxel size
//! 3. if either resampled slice is empty, pass the source slice through and
//!    record no transform
//! 4. otherwise warp with every out-of-plane parameter fixed
//! 5. resample back onto the original reference slice grid and restore its
//!    obliquity
//!
//! Slices are independent, so with `slice_workers > 1` they are processed on
//! scoped threads. Outcomes are sorted by index before stacking.

use super::{output_dir_for, ObliquityFixer, Toolbox};
use crate::artifacts::IntermediateArtifactSet;
use crate::error::{CestError, CestResult};
use crate::app_log;
use crate::logger::LogLevel;
use crate::paths;
use std::path::{Path, PathBuf};

/// Subdirectory holding slice-level files
pub const PER_SLICE_DIR: &str = "per_slice";

/// Affine parameters fixed during slice warps: z shift, the two
/// out-of-plane rotations, z scale and the shears involving z
const IN_PLANE_PARFIX: [(u8, f64); 6] = [
    (3, 0.0),
    (5, 0.0),
    (6, 0.0),
    (9, 1.0),
    (11, 0.0),
    (12, 0.0),
];

fn parfix_options() -> String {
    IN_PLANE_PARFIX
        .iter()
        .map(|(param, value)| format!("-parfix {} {}", param, value))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Output of `SliceWarper::warp_per_slice`
#[derive(Debug, Clone, PartialEq)]
pub struct SliceWarpResult {
    /// Warped slices stacked into one volume
    pub merged: PathBuf,
    /// Transform of each slice in index order; `None` for skipped slices
    pub transforms: Vec<Option<PathBuf>>,
    /// Auxiliary volume carried through the same slice transforms
    pub applied: Option<PathBuf>,
}

impl SliceWarpResult {
    /// Indices of slices left unwarped
    pub fn skipped_slices(&self) -> Vec<usize> {
        self.transforms
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_none())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Paths slice files are named after, one per role
///
/// A volume is its own name unless another role shares its stem; then the
/// role is appended (`t1_apply_sl000.nii`) so no role overwrites another's
/// slices or stack.
fn naming_bases(roles: &[(&str, &Path)]) -> CestResult<Vec<PathBuf>> {
    let stems = roles
        .iter()
        .map(|(_, path)| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| paths::split_extension(name).0)
                .ok_or_else(|| CestError::InvalidPath(format!("no file name in {:?}", path)))
        })
        .collect::<CestResult<Vec<_>>>()?;

    roles
        .iter()
        .enumerate()
        .map(|(i, (role, path))| {
            let shared = stems
                .iter()
                .enumerate()
                .any(|(j, stem)| j != i && *stem == stems[i]);
            if shared {
                paths::with_suffix(path, &format!("_{}", role))
            } else {
                Ok(path.to_path_buf())
            }
        })
        .collect()
}

struct SliceInputs<'p> {
    source: &'p Path,
    reference: &'p Path,
    apply_to: Option<&'p Path>,
    /// Naming bases of source, reference and `apply_to`, in that order
    names: Vec<PathBuf>,
    target_xy: (f64, f64),
    source_thickness: f64,
    reference_thickness: f64,
    apply_thickness: f64,
    dir: PathBuf,
}

#[derive(Debug)]
struct SliceOutcome {
    index: usize,
    warped: PathBuf,
    transform: Option<PathBuf>,
    applied: Option<PathBuf>,
    intermediates: IntermediateArtifactSet,
}

/// Per-slice warper
pub struct SliceWarper<'a> {
    toolbox: &'a Toolbox,
    output_dir: Option<PathBuf>,
}

impl<'a> SliceWarper<'a> {
    pub fn new(toolbox: &'a Toolbox) -> Self {
        Self {
            toolbox,
            output_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Warp `source` onto `reference` one z slice at a time.
    ///
    /// When `apply_to` is given it is cut into slices as well and each slice
    /// goes through the transform recorded for its index (or unchanged for
    /// skipped slices), then is stacked the same way.
    ///
    /// Slice-level files are deleted afterwards unless caching; the merged
    /// volumes and the per-slice transforms are kept.
    pub fn warp_per_slice(
        &self,
        source: &Path,
        reference: &Path,
        target_xy: (f64, f64),
        apply_to: Option<&Path>,
    ) -> CestResult<SliceWarpResult> {
        let reader = self.toolbox.reader();
        let source_geometry = reader.geometry(source)?;
        let reference_geometry = reader.geometry(reference)?;
        let n_slices = reference_geometry.n_slices();
        if source_geometry.n_slices() != n_slices {
            return Err(CestError::PipelineError(format!(
                "{} has {} slices but {} has {}",
                source.display(),
                source_geometry.n_slices(),
                reference.display(),
                n_slices
            )));
        }
        let apply_thickness = match apply_to {
            Some(path) => {
                let geometry = reader.geometry(path)?;
                if geometry.n_slices() != n_slices {
                    return Err(CestError::PipelineError(format!(
                        "{} has {} slices, expected {}",
                        path.display(),
                        geometry.n_slices(),
                        n_slices
                    )));
                }
                geometry.voxel_size[2]
            }
            None => 0.0,
        };

        let out_dir = output_dir_for(source, self.output_dir.as_deref());
        let dir = out_dir.join(PER_SLICE_DIR);
        std::fs::create_dir_all(&dir)?;

        let mut roles = vec![("source", source), ("reference", reference)];
        if let Some(path) = apply_to {
            roles.push(("apply", path));
        }
        let names = naming_bases(&roles)?;

        let inputs = SliceInputs {
            source,
            reference,
            apply_to,
            names,
            target_xy,
            source_thickness: source_geometry.voxel_size[2],
            reference_thickness: reference_geometry.voxel_size[2],
            apply_thickness,
            dir,
        };

        app_log!(
            LogLevel::Info,
            "registration::slice_warp",
            "Warping {} slices of {} onto {}",
            n_slices,
            source.display(),
            reference.display()
        );

        let mut outcomes = self.process_slices(n_slices, &inputs)?;
        outcomes.sort_by_key(|o| o.index);

        let mut intermediates = IntermediateArtifactSet::new();
        for outcome in &outcomes {
            intermediates.extend(outcome.intermediates.clone());
        }

        let warped: Vec<&Path> = outcomes.iter().map(|o| o.warped.as_path()).collect();
        let merged = self.stack(&inputs.names[0], reference, &warped, &out_dir, &mut intermediates)?;

        let applied = match inputs.names.get(2) {
            Some(name) => {
                let slices: Vec<&Path> = outcomes
                    .iter()
                    .filter_map(|o| o.applied.as_deref())
                    .collect();
                Some(self.stack(name, reference, &slices, &out_dir, &mut intermediates)?)
            }
            None => None,
        };

        let mut keep: Vec<&Path> = vec![merged.as_path()];
        if let Some(path) = &applied {
            keep.push(path.as_path());
        }
        intermediates.cleanup(self.toolbox.caching(), &keep, "registration::slice_warp");

        Ok(SliceWarpResult {
            merged,
            transforms: outcomes.into_iter().map(|o| o.transform).collect(),
            applied,
        })
    }

    fn process_slices(&self, n_slices: usize, inputs: &SliceInputs) -> CestResult<Vec<SliceOutcome>> {
        let workers = self.toolbox.config().slice_workers.clamp(1, n_slices.max(1));
        let indices: Vec<usize> = (0..n_slices).collect();

        if workers == 1 {
            return indices
                .iter()
                .map(|&index| self.process_slice(index, inputs))
                .collect();
        }

        let chunk_size = n_slices.div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = indices
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|&index| self.process_slice(index, inputs))
                            .collect::<CestResult<Vec<_>>>()
                    })
                })
                .collect();

            let mut outcomes = Vec::with_capacity(n_slices);
            for handle in handles {
                let chunk = handle.join().map_err(|_| {
                    CestError::PipelineError("slice worker thread panicked".to_string())
                })?;
                outcomes.extend(chunk?);
            }
            Ok(outcomes)
        })
    }

    fn process_slice(&self, index: usize, inputs: &SliceInputs) -> CestResult<SliceOutcome> {
        let reader = self.toolbox.reader();
        let mut intermediates = IntermediateArtifactSet::new();
        let (tx, ty) = inputs.target_xy;

        let source_slice = self.cut(
            inputs.source,
            &inputs.names[0],
            index,
            &inputs.dir,
            &mut intermediates,
        )?;
        let reference_slice = self.cut(
            inputs.reference,
            &inputs.names[1],
            index,
            &inputs.dir,
            &mut intermediates,
        )?;

        let source_rs = self.resample(
            &source_slice,
            [tx, ty, inputs.source_thickness],
            &mut intermediates,
        )?;
        let reference_rs = self.resample(
            &reference_slice,
            [tx, ty, inputs.reference_thickness],
            &mut intermediates,
        )?;

        let degenerate = reader.is_all_zero(&source_rs)? || reader.is_all_zero(&reference_rs)?;
        let (warped_rs, transform) = if degenerate {
            app_log!(
                LogLevel::Info,
                "registration::slice_warp",
                "Slice {} is empty, passing it through unwarped",
                index
            );
            (source_rs.clone(), None)
        } else {
            let (warped, warp) = self.qwarp(&source_slice, &source_rs, &reference_rs)?;
            intermediates.push(&warped);
            (warped, Some(warp))
        };

        let warped = self.restore(&source_slice, &warped_rs, &reference_slice, &mut intermediates)?;

        let applied = match (inputs.apply_to, inputs.names.get(2)) {
            (Some(volume), Some(name)) => {
                let slice = self.cut(volume, name, index, &inputs.dir, &mut intermediates)?;
                let slice_rs = self.resample(
                    &slice,
                    [tx, ty, inputs.apply_thickness],
                    &mut intermediates,
                )?;
                let moved = match &transform {
                    Some(warp) => {
                        let moved = self.apply_warp(&slice, &slice_rs, warp, &reference_rs)?;
                        intermediates.push(&moved);
                        moved
                    }
                    None => slice_rs,
                };
                Some(self.restore(&slice, &moved, &reference_slice, &mut intermediates)?)
            }
            _ => None,
        };

        Ok(SliceOutcome {
            index,
            warped,
            transform,
            applied,
            intermediates,
        })
    }

    /// Cut slice `index` out of `volume` and give it `volume`'s obliquity.
    /// The slice file is named after `name`.
    fn cut(
        &self,
        volume: &Path,
        name: &Path,
        index: usize,
        dir: &Path,
        intermediates: &mut IntermediateArtifactSet,
    ) -> CestResult<PathBuf> {
        let slice = paths::derive(name, Some(&format!("_sl{:03}", index)), None, Some(dir))?;
        let call = self
            .toolbox
            .call(&self.toolbox.tools().zcutup)
            .opt_n("-keep", [index, index])
            .opt("-prefix", &slice)
            .arg(volume)
            .output("out_file", &slice);
        self.toolbox.run(&call)?;
        intermediates.push(&slice);

        let fixed = ObliquityFixer::new(self.toolbox).fix(&slice, volume, self.toolbox.overwrite_headers())?;
        intermediates.push(&fixed);
        Ok(fixed)
    }

    fn resample(
        &self,
        slice: &Path,
        voxel_size: [f64; 3],
        intermediates: &mut IntermediateArtifactSet,
    ) -> CestResult<PathBuf> {
        let out = paths::with_suffix(slice, "_rs")?;
        let call = self
            .toolbox
            .call(&self.toolbox.tools().resample)
            .opt_n("-dxyz", voxel_size)
            .opt("-rmode", "Cu")
            .opt("-prefix", &out)
            .opt("-input", slice)
            .output("out_file", &out);
        self.toolbox.run(&call)?;
        intermediates.push(&out);
        Ok(out)
    }

    /// In-plane warp; returns the warped slice and its displacement field
    fn qwarp(&self, slice: &Path, source_rs: &Path, reference_rs: &Path) -> CestResult<(PathBuf, PathBuf)> {
        let warped = paths::with_suffix(slice, "_warped")?;
        let warp = paths::with_suffix(&warped, "_WARP")?;
        let call = self
            .toolbox
            .call(&self.toolbox.tools().qwarp)
            .opt("-base", reference_rs)
            .opt("-source", source_rs)
            .opt("-prefix", &warped)
            .flag("-allineate")
            .opt("-allineate_opts", parfix_options())
            .output("out_file", &warped)
            .output("warp", &warp);
        self.toolbox.run(&call)?;
        Ok((warped, warp))
    }

    fn apply_warp(&self, slice: &Path, slice_rs: &Path, warp: &Path, grid: &Path) -> CestResult<PathBuf> {
        let out = paths::with_suffix(slice, "_warped")?;
        let call = self
            .toolbox
            .call(&self.toolbox.tools().nwarp_apply)
            .opt("-nwarp", warp)
            .opt("-source", slice_rs)
            .opt("-master", grid)
            .opt("-prefix", &out)
            .output("out_file", &out);
        self.toolbox.run(&call)?;
        Ok(out)
    }

    /// Resample back onto the original reference slice grid and restore its
    /// obliquity
    fn restore(
        &self,
        slice: &Path,
        resampled: &Path,
        reference_slice: &Path,
        intermediates: &mut IntermediateArtifactSet,
    ) -> CestResult<PathBuf> {
        let out = paths::with_suffix(slice, "_final")?;
        let call = self
            .toolbox
            .call(&self.toolbox.tools().resample)
            .opt("-master", reference_slice)
            .opt("-rmode", "Cu")
            .opt("-prefix", &out)
            .opt("-input", resampled)
            .output("out_file", &out);
        self.toolbox.run(&call)?;
        intermediates.push(&out);

        let fixed = ObliquityFixer::new(self.toolbox).fix(&out, reference_slice, self.toolbox.overwrite_headers())?;
        intermediates.push(&fixed);
        Ok(fixed)
    }

    /// Stack slices along z and give the result `reference`'s obliquity
    fn stack(
        &self,
        name: &Path,
        reference: &Path,
        slices: &[&Path],
        out_dir: &Path,
        intermediates: &mut IntermediateArtifactSet,
    ) -> CestResult<PathBuf> {
        let merged = paths::derive(name, Some("_perslice"), None, Some(out_dir))?;
        let mut call = self
            .toolbox
            .call(&self.toolbox.tools().zcat)
            .opt("-prefix", &merged)
            .output("out_file", &merged);
        for slice in slices {
            call = call.arg(slice);
        }
        self.toolbox.run(&call)?;

        let fixed = ObliquityFixer::new(self.toolbox).fix(&merged, reference, self.toolbox.overwrite_headers())?;
        if fixed != merged {
            intermediates.push(&merged);
        }
        Ok(fixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::registration::testing::{toolbox, write};
    use crate::tools::mock::{MockToolbox, MockVolume};
    use crate::volume::{ImageReader, Orientation};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn oblique() -> Orientation {
        Orientation {
            rows: [[0.09, -0.04, 0.0, 0.0], [0.04, 0.09, 0.0, 0.0], [0.0, 0.0, 0.5, 0.0]],
        }
    }

    /// 2x2 square per slice at (x0, y0), with per-slice intensities
    fn squares(n: usize, origins: &[(usize, usize)], values: &[f32]) -> MockVolume {
        MockVolume::from_fn([10, 10, n], [0.1, 0.1, 0.5], |x, y, z| {
            let (x0, y0) = origins[z];
            if x >= x0 && x < x0 + 2 && y >= y0 && y < y0 + 2 {
                values[z]
            } else {
                0.0
            }
        })
    }

    fn slice_values(volume: &MockVolume, z: usize) -> Vec<f32> {
        volume.slice(z).unwrap().data
    }

    #[test]
    fn test_empty_slice_passes_through() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockToolbox::new());
        let tb = toolbox(&mock, PipelineConfig::default(), dir.path());

        // Slice 1 of the reference is empty; slices 0 and 2 match after a shift
        let reference = squares(3, &[(3, 3), (3, 3), (5, 2)], &[100.0, 0.0, 100.0]);
        let source = squares(3, &[(5, 4), (6, 6), (7, 3)], &[100.0, 80.0, 100.0]);
        let reference_path = write(&dir, "cest.nii", &reference.clone().with_orientation(oblique()));
        let source_path = write(&dir, "anat.nii", &source);

        let result = SliceWarper::new(&tb)
            .warp_per_slice(&source_path, &reference_path, (0.1, 0.1), None)
            .unwrap();

        assert_eq!(result.transforms.len(), 3);
        assert_eq!(result.skipped_slices(), vec![1]);
        assert_eq!(mock.count("3dQwarp"), 2);

        let merged = MockVolume::read(&result.merged).unwrap();
        assert_eq!(merged.shape, [10, 10, 3]);
        assert_eq!(slice_values(&merged, 0), slice_values(&reference, 0));
        assert_eq!(slice_values(&merged, 1), slice_values(&source, 1));
        assert_eq!(slice_values(&merged, 2), slice_values(&reference, 2));
        assert_eq!(mock.orientation(&result.merged).unwrap(), oblique());
    }

    #[test]
    fn test_reassembly_preserves_slice_order() {
        for n in [1usize, 5, 20] {
            let dir = TempDir::new().unwrap();
            let mock = Arc::new(MockToolbox::new());
            let tb = toolbox(&mock, PipelineConfig::default(), dir.path());

            let volume = MockVolume::from_fn([4, 4, n], [0.1, 0.1, 0.5], |_, _, z| z as f32);
            let reference = write(&dir, "cest.nii", &volume);
            let source = write(&dir, "anat.nii", &volume);

            let result = SliceWarper::new(&tb)
                .warp_per_slice(&source, &reference, (0.1, 0.1), None)
                .unwrap();

            let merged = MockVolume::read(&result.merged).unwrap();
            assert_eq!(merged.shape[2], n);
            for z in 0..n {
                assert!(
                    slice_values(&merged, z).iter().all(|v| *v == z as f32),
                    "slice {} of {} out of place",
                    z,
                    n
                );
            }
        }
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let reference = squares(4, &[(3, 3), (2, 2), (4, 4), (3, 5)], &[100.0, 100.0, 0.0, 100.0]);
        let source = squares(4, &[(5, 4), (3, 3), (4, 4), (6, 6)], &[100.0, 100.0, 50.0, 100.0]);

        let mut merged = Vec::new();
        for workers in [1usize, 3] {
            let dir = TempDir::new().unwrap();
            let mock = Arc::new(MockToolbox::new());
            let config = PipelineConfig::builder().slice_workers(workers).build().unwrap();
            let tb = toolbox(&mock, config, dir.path());
            let reference_path = write(&dir, "cest.nii", &reference);
            let source_path = write(&dir, "anat.nii", &source);

            let result = SliceWarper::new(&tb)
                .warp_per_slice(&source_path, &reference_path, (0.1, 0.1), None)
                .unwrap();
            assert_eq!(result.skipped_slices(), vec![2]);
            merged.push(MockVolume::read(&result.merged).unwrap());
        }
        assert_eq!(merged[0], merged[1]);
    }

    #[test]
    fn test_apply_to_auxiliary_volume() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockToolbox::new());
        let tb = toolbox(&mock, PipelineConfig::default(), dir.path());

        let reference = squares(2, &[(3, 3), (3, 3)], &[100.0, 0.0]);
        let source = squares(2, &[(5, 4), (5, 4)], &[100.0, 100.0]);
        let auxiliary = squares(2, &[(5, 4), (5, 4)], &[7.0, 9.0]);
        let reference_path = write(&dir, "cest.nii", &reference);
        let source_path = write(&dir, "anat.nii", &source);
        let auxiliary_path = write(&dir, "t2.nii", &auxiliary);

        let result = SliceWarper::new(&tb)
            .warp_per_slice(&source_path, &reference_path, (0.1, 0.1), Some(&auxiliary_path))
            .unwrap();

        let applied = MockVolume::read(result.applied.as_ref().unwrap()).unwrap();
        // Slice 0 moves like the source, slice 1 is passed through
        let expected0 = squares(1, &[(3, 3)], &[7.0]);
        assert_eq!(slice_values(&applied, 0), expected0.data);
        assert_eq!(slice_values(&applied, 1), slice_values(&auxiliary, 1));
        assert_eq!(mock.count("3dNwarpApply"), 1);
    }

    #[test]
    fn test_apply_to_sharing_the_source_stem() {
        let dir = TempDir::new().unwrap();
        let aux_dir = TempDir::new().unwrap();
        let mock = Arc::new(MockToolbox::new());
        let config = PipelineConfig::builder().caching(true).build().unwrap();
        let tb = toolbox(&mock, config, dir.path());

        let reference_path = write(&dir, "cest.nii", &squares(1, &[(3, 3)], &[100.0]));
        let source_path = write(&dir, "anat.nii", &squares(1, &[(5, 4)], &[100.0]));
        let auxiliary = squares(1, &[(5, 4)], &[7.0]);
        let auxiliary_path = write(&aux_dir, "anat.nii", &auxiliary);

        let result = SliceWarper::new(&tb)
            .in_dir(dir.path())
            .warp_per_slice(&source_path, &reference_path, (0.1, 0.1), Some(&auxiliary_path))
            .unwrap();

        let per_slice = dir.path().join(PER_SLICE_DIR);
        assert!(per_slice.join("anat_source_sl000.nii").exists());
        assert!(per_slice.join("anat_apply_sl000.nii").exists());
        assert!(per_slice.join("cest_sl000.nii").exists());
        assert_ne!(result.applied.as_ref(), Some(&result.merged));

        // Each stack keeps its own intensities
        let merged = MockVolume::read(&result.merged).unwrap();
        let applied = MockVolume::read(result.applied.as_ref().unwrap()).unwrap();
        assert_eq!(merged.data, squares(1, &[(3, 3)], &[100.0]).data);
        assert_eq!(applied.data, squares(1, &[(3, 3)], &[7.0]).data);
    }

    #[test]
    fn test_naming_bases() {
        let bases = naming_bases(&[
            ("source", Path::new("/a/anat.nii")),
            ("reference", Path::new("/c/cest.nii.gz")),
            ("apply", Path::new("/t/anat.nii.gz")),
        ])
        .unwrap();
        assert_eq!(
            bases,
            vec![
                PathBuf::from("/a/anat_source.nii"),
                PathBuf::from("/c/cest.nii.gz"),
                PathBuf::from("/t/anat_apply.nii.gz"),
            ]
        );
    }

    #[test]
    fn test_slice_files_removed_without_caching() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockToolbox::new());
        let tb = toolbox(&mock, PipelineConfig::default(), dir.path());
        let reference = write(&dir, "cest.nii", &squares(2, &[(3, 3), (3, 3)], &[100.0, 100.0]));
        let source = write(&dir, "anat.nii", &squares(2, &[(4, 4), (4, 4)], &[100.0, 100.0]));

        let result = SliceWarper::new(&tb)
            .warp_per_slice(&source, &reference, (0.1, 0.1), None)
            .unwrap();

        let mut remaining: Vec<PathBuf> = std::fs::read_dir(dir.path().join(PER_SLICE_DIR))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        remaining.sort();
        let transforms: Vec<PathBuf> = result.transforms.iter().flatten().cloned().collect();
        assert_eq!(remaining, transforms);
        assert!(result.merged.exists());
    }

    #[test]
    fn test_slice_files_kept_with_caching() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockToolbox::new());
        let config = PipelineConfig::builder().caching(true).build().unwrap();
        let tb = toolbox(&mock, config, dir.path());
        let reference = write(&dir, "cest.nii", &squares(1, &[(3, 3)], &[100.0]));
        let source = write(&dir, "anat.nii", &squares(1, &[(4, 4)], &[100.0]));

        SliceWarper::new(&tb)
            .warp_per_slice(&source, &reference, (0.1, 0.1), None)
            .unwrap();
        assert!(dir.path().join(PER_SLICE_DIR).join("anat_sl000.nii").exists());
        assert!(dir.path().join(PER_SLICE_DIR).join("cest_sl000.nii").exists());
    }

    #[test]
    fn test_parfix_constrains_out_of_plane_parameters() {
        assert_eq!(
            parfix_options(),
            "-parfix 3 0 -parfix 5 0 -parfix 6 0 -parfix 9 1 -parfix 11 0 -parfix 12 0"
        );
    }

    #[test]
    fn test_slice_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockToolbox::new());
        let tb = toolbox(&mock, PipelineConfig::default(), dir.path());
        let reference = write(&dir, "cest.nii", &squares(2, &[(3, 3), (3, 3)], &[1.0, 1.0]));
        let source = write(&dir, "anat.nii", &squares(1, &[(3, 3)], &[1.0]));

        let result = SliceWarper::new(&tb).warp_per_slice(&source, &reference, (0.1, 0.1), None);
        assert!(matches!(result, Err(CestError::PipelineError(_))));
        assert!(mock.calls().is_empty());
    }
}

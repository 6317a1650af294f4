//! In-process simulation of the external imaging programs
//!
//! `MockToolbox` is both a `ToolRunner` and an `ImageReader` over a small
//! JSON volume format (`MockVolume`). It honours the argument contract of
//! every program in the default `ToolCatalog` well enough for the pipeline
//! to run end to end without AFNI or RATS installed:
//! - registrations estimate integer translations from centres of mass
//! - matrices use pull semantics: applying shift `t` gives `out[i] = in[i + t]`
//! - programs that deoblique their output drop the stored orientation
//!
//! Every call is recorded so tests can assert on what was invoked.

use super::{RunOutput, ToolCall, ToolRunner};
use crate::config::ToolCatalog;
use crate::error::{CestError, CestResult};
use crate::paths;
use crate::transform::{spec_token, Affine12};
use crate::volume::{ImageReader, Orientation, VolumeGeometry};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Synthetic 3D volume stored as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockVolume {
    /// Grid dimensions (x, y, z)
    pub shape: [usize; 3],
    pub voxel_size: [f64; 3],
    /// `None` means an axis-aligned grid
    #[serde(default)]
    pub orientation: Option<Orientation>,
    /// Intensities, x-major (`[x][y][z]`)
    pub data: Vec<f32>,
}

impl MockVolume {
    pub fn zeros(shape: [usize; 3], voxel_size: [f64; 3]) -> Self {
        Self {
            shape,
            voxel_size,
            orientation: None,
            data: vec![0.0; shape[0] * shape[1] * shape[2]],
        }
    }

    pub fn from_fn<F>(shape: [usize; 3], voxel_size: [f64; 3], f: F) -> Self
    where
        F: Fn(usize, usize, usize) -> f32,
    {
        let mut volume = Self::zeros(shape, voxel_size);
        for x in 0..shape[0] {
            for y in 0..shape[1] {
                for z in 0..shape[2] {
                    volume.set(x, y, z, f(x, y, z));
                }
            }
        }
        volume
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = Some(orientation);
        self
    }

    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (x * self.shape[1] + y) * self.shape[2] + z
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[self.index(x, y, z)]
    }

    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f32) {
        let idx = self.index(x, y, z);
        self.data[idx] = value;
    }

    pub fn orientation_or_default(&self) -> Orientation {
        self.orientation
            .unwrap_or_else(|| Orientation::from_voxel_size(self.voxel_size))
    }

    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|v| *v == 0.0)
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(0.0, f32::max)
    }

    /// Slice `z` as a single-slice volume; orientation is dropped
    pub fn slice(&self, z: usize) -> CestResult<MockVolume> {
        if z >= self.shape[2] {
            return Err(CestError::ImageRead(format!(
                "slice {} out of range for {} slices",
                z, self.shape[2]
            )));
        }
        Ok(MockVolume::from_fn(
            [self.shape[0], self.shape[1], 1],
            self.voxel_size,
            |x, y, _| self.get(x, y, z),
        ))
    }

    /// Intensity-weighted centre in voxel coordinates
    pub fn center_of_mass(&self) -> Option<[f64; 3]> {
        let mut total = 0.0f64;
        let mut acc = [0.0f64; 3];
        for x in 0..self.shape[0] {
            for y in 0..self.shape[1] {
                for z in 0..self.shape[2] {
                    let v = self.get(x, y, z) as f64;
                    total += v;
                    acc[0] += v * x as f64;
                    acc[1] += v * y as f64;
                    acc[2] += v * z as f64;
                }
            }
        }
        if total == 0.0 {
            return None;
        }
        Some([acc[0] / total, acc[1] / total, acc[2] / total])
    }

    /// Resample onto a grid of `shape`, reading `self[i + shift]`
    pub fn pull(&self, shift: [i64; 3], shape: [usize; 3], voxel_size: [f64; 3]) -> MockVolume {
        MockVolume::from_fn(shape, voxel_size, |x, y, z| {
            let src = [x as i64 + shift[0], y as i64 + shift[1], z as i64 + shift[2]];
            let inside = (0..3).all(|a| src[a] >= 0 && (src[a] as usize) < self.shape[a]);
            if inside {
                self.get(src[0] as usize, src[1] as usize, src[2] as usize)
            } else {
                0.0
            }
        })
    }

    pub fn read(path: &Path) -> CestResult<MockVolume> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CestError::ImageRead(format!("{}: {}", path.display(), e)))?;
        let volume: MockVolume = serde_json::from_str(&text)
            .map_err(|e| CestError::ImageRead(format!("{}: {}", path.display(), e)))?;
        let expected = volume.shape.iter().product::<usize>();
        if volume.data.len() != expected {
            return Err(CestError::ImageRead(format!(
                "{}: {} values for shape {:?}",
                path.display(),
                volume.data.len(),
                volume.shape
            )));
        }
        Ok(volume)
    }

    pub fn write(&self, path: &Path) -> CestResult<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

fn round_shift(v: [f64; 3]) -> [i64; 3] {
    [v[0].round() as i64, v[1].round() as i64, v[2].round() as i64]
}

/// Shift registering `source` onto `base`
fn estimate_shift(source: &MockVolume, base: &MockVolume) -> [f64; 3] {
    match (source.center_of_mass(), base.center_of_mass()) {
        (Some(s), Some(b)) => [s[0] - b[0], s[1] - b[1], s[2] - b[2]],
        _ => [0.0; 3],
    }
}

fn matrix_text(header: &str, affine: &Affine12) -> String {
    format!("# {}\n{}\n", header, affine.to_oneline())
}

/// Simulated tool suite
#[derive(Debug, Default)]
pub struct MockToolbox {
    tools: ToolCatalog,
    calls: Mutex<Vec<ToolCall>>,
    unavailable: HashSet<String>,
    failing: HashSet<String>,
    silent: HashSet<String>,
}

impl MockToolbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tools(tools: ToolCatalog) -> Self {
        Self {
            tools,
            ..Self::default()
        }
    }

    /// Report `program` as not installed
    pub fn unavailable(mut self, program: &str) -> Self {
        self.unavailable.insert(program.to_string());
        self
    }

    /// Make `program` exit with an error
    pub fn failing(mut self, program: &str) -> Self {
        self.failing.insert(program.to_string());
        self
    }

    /// Make `program` succeed without writing its outputs
    pub fn silent(mut self, program: &str) -> Self {
        self.silent.insert(program.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, program: &str) -> Vec<ToolCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    pub fn count(&self, program: &str) -> usize {
        self.calls_to(program).len()
    }

    fn required<'a>(call: &'a ToolCall, option: &str) -> CestResult<&'a str> {
        call.option(option)
            .ok_or_else(|| CestError::tool(&call.program, format!("missing {}", option)))
    }

    fn positional(call: &ToolCall, index: usize) -> CestResult<PathBuf> {
        call.positionals()
            .get(index)
            .map(PathBuf::from)
            .ok_or_else(|| CestError::tool(&call.program, format!("missing argument {}", index)))
    }

    fn simulate(&self, call: &ToolCall) -> CestResult<String> {
        let tools = &self.tools;
        let program = call.program.as_str();

        if program == tools.copy {
            std::fs::copy(Self::positional(call, 0)?, Self::positional(call, 1)?)?;
            Ok(String::new())
        } else if program == tools.unifize {
            let volume = MockVolume::read(Path::new(Self::required(call, "-input")?))?;
            volume.write(Path::new(Self::required(call, "-prefix")?))?;
            Ok(String::new())
        } else if program == tools.clip_level {
            let volume = MockVolume::read(&Self::positional(call, 0)?)?;
            Ok(format!("{}\n", volume.max() * 0.5))
        } else if program == tools.morpho_mask || program == tools.histogram_mask {
            self.mask(call)
        } else if program == tools.calc {
            self.calc(call)
        } else if program == tools.allineate {
            self.allineate(call)
        } else if program == tools.cat_matvec {
            self.cat_matvec(call)
        } else if program == tools.warp {
            self.warp(call)
        } else if program == tools.refit {
            self.refit(call)
        } else if program == tools.zcutup {
            self.zcutup(call)
        } else if program == tools.resample {
            self.resample(call)
        } else if program == tools.qwarp {
            self.qwarp(call)
        } else if program == tools.zcat {
            self.zcat(call)
        } else if program == tools.nwarp_apply {
            self.nwarp_apply(call)
        } else {
            Err(CestError::ToolUnavailable(format!("can not locate {}", program)))
        }
    }

    fn mask(&self, call: &ToolCall) -> CestResult<String> {
        let head = MockVolume::read(&Self::positional(call, 0)?)?;
        let threshold: f32 = Self::required(call, "-t")?
            .parse()
            .map_err(|_| CestError::tool(&call.program, "bad -t value"))?;
        let mut mask = head.clone();
        for v in mask.data.iter_mut() {
            *v = if *v >= threshold && *v > 0.0 { 1.0 } else { 0.0 };
        }
        mask.write(&Self::positional(call, 1)?)?;
        Ok(String::new())
    }

    fn calc(&self, call: &ToolCall) -> CestResult<String> {
        let a = MockVolume::read(Path::new(Self::required(call, "-a")?))?;
        let b = MockVolume::read(Path::new(Self::required(call, "-b")?))?;
        if a.shape != b.shape {
            return Err(CestError::tool(&call.program, "dataset grids differ"));
        }
        let mut out = a.clone();
        for (v, m) in out.data.iter_mut().zip(b.data.iter()) {
            *v *= *m;
        }
        out.write(Path::new(Self::required(call, "-prefix")?))?;
        Ok(String::new())
    }

    fn allineate(&self, call: &ToolCall) -> CestResult<String> {
        let source = MockVolume::read(Path::new(Self::required(call, "-source")?))?;

        let (shift, grid) = if let Some(matrix) = call.option("-1Dmatrix_apply") {
            let affine = Affine12::parse(&std::fs::read_to_string(matrix)?)?;
            let master = MockVolume::read(Path::new(Self::required(call, "-master")?))?;
            (round_shift(affine.translation_part()), master)
        } else {
            let base = MockVolume::read(Path::new(Self::required(call, "-base")?))?;
            let shift = round_shift(estimate_shift(&source, &base));
            if let Some(save) = call.option("-1Dmatrix_save") {
                let affine = Affine12::translation(shift[0] as f64, shift[1] as f64, shift[2] as f64);
                std::fs::write(save, matrix_text("3dAllineate matrix", &affine))?;
            }
            (shift, base)
        };

        if let Some(prefix) = call.option("-prefix") {
            let mut out = source.pull(shift, grid.shape, grid.voxel_size);
            out.orientation = grid.orientation;
            out.write(Path::new(prefix))?;
        }
        Ok(String::new())
    }

    fn cat_matvec(&self, call: &ToolCall) -> CestResult<String> {
        let mut matrices: Vec<Affine12> = Vec::new();
        for arg in &call.args {
            match arg {
                super::ToolArg::Positional(path) => {
                    matrices.push(Affine12::parse(&std::fs::read_to_string(path)?)?);
                }
                super::ToolArg::Flag(flag) if flag == "-I" => {
                    let last = matrices
                        .pop()
                        .ok_or_else(|| CestError::tool(&call.program, "-I without a matrix"))?;
                    matrices.push(last.inverse()?);
                }
                _ => {}
            }
        }
        let product = matrices
            .iter()
            .fold(Affine12::identity(), |acc, m| acc.compose(m));
        Ok(format!("{}\n", product.to_oneline()))
    }

    fn warp(&self, call: &ToolCall) -> CestResult<String> {
        let source = MockVolume::read(&Self::positional(call, 0)?)?;
        let parent = MockVolume::read(Path::new(Self::required(call, "-oblique_parent")?))?;
        let out = source.pull([0; 3], parent.shape, parent.voxel_size);
        out.write(Path::new(Self::required(call, "-prefix")?))?;
        Ok(format!(
            "++ 3dWarp: deobliquing\n# mat44 Obliquity Transformation ::\n{}\n",
            Affine12::identity().to_oneline()
        ))
    }

    fn refit(&self, call: &ToolCall) -> CestResult<String> {
        let reference = call
            .option("-atrcopy")
            .ok_or_else(|| CestError::tool(&call.program, "missing -atrcopy"))?;
        let reference = MockVolume::read(Path::new(reference))?;
        let target_path = call
            .positionals()
            .last()
            .map(PathBuf::from)
            .ok_or_else(|| CestError::tool(&call.program, "missing target dataset"))?;
        let mut target = MockVolume::read(&target_path)?;
        target.orientation = Some(reference.orientation_or_default());
        target.write(&target_path)?;
        Ok(String::new())
    }

    fn zcutup(&self, call: &ToolCall) -> CestResult<String> {
        let keep = call.option_values("-keep");
        let index: usize = keep
            .first()
            .and_then(|k| k.parse().ok())
            .ok_or_else(|| CestError::tool(&call.program, "bad -keep range"))?;
        let volume = MockVolume::read(&Self::positional(call, 0)?)?;
        volume
            .slice(index)?
            .write(Path::new(Self::required(call, "-prefix")?))?;
        Ok(String::new())
    }

    fn resample(&self, call: &ToolCall) -> CestResult<String> {
        let input = MockVolume::read(Path::new(Self::required(call, "-input")?))?;
        let out = if let Some(master) = call.option("-master") {
            let master = MockVolume::read(Path::new(master))?;
            input.pull([0; 3], master.shape, master.voxel_size)
        } else {
            let dxyz: Vec<f64> = call
                .option_values("-dxyz")
                .iter()
                .filter_map(|v| v.parse().ok())
                .collect();
            if dxyz.len() != 3 {
                return Err(CestError::tool(&call.program, "need -dxyz or -master"));
            }
            input.pull([0; 3], input.shape, [dxyz[0], dxyz[1], dxyz[2]])
        };
        out.write(Path::new(Self::required(call, "-prefix")?))?;
        Ok(String::new())
    }

    fn qwarp(&self, call: &ToolCall) -> CestResult<String> {
        let base = MockVolume::read(Path::new(Self::required(call, "-base")?))?;
        let source = MockVolume::read(Path::new(Self::required(call, "-source")?))?;
        if base.is_all_zero() || source.is_all_zero() {
            return Err(CestError::tool(&call.program, "** FATAL ERROR: empty dataset"));
        }
        let mut shift = round_shift(estimate_shift(&source, &base));
        if base.shape[2] == 1 {
            shift[2] = 0;
        }
        let prefix = PathBuf::from(Self::required(call, "-prefix")?);
        source
            .pull(shift, base.shape, base.voxel_size)
            .write(&prefix)?;

        let affine = Affine12::translation(shift[0] as f64, shift[1] as f64, shift[2] as f64);
        let warp = paths::with_suffix(&prefix, "_WARP")?;
        std::fs::write(warp, matrix_text("3dQwarp displacement", &affine))?;
        Ok(String::new())
    }

    fn zcat(&self, call: &ToolCall) -> CestResult<String> {
        let slices = call
            .positionals()
            .iter()
            .map(|p| MockVolume::read(Path::new(p)))
            .collect::<CestResult<Vec<_>>>()?;
        let first = slices
            .first()
            .ok_or_else(|| CestError::tool(&call.program, "no datasets to stack"))?;
        let (nx, ny) = (first.shape[0], first.shape[1]);
        if slices.iter().any(|s| s.shape[0] != nx || s.shape[1] != ny) {
            return Err(CestError::tool(&call.program, "in-plane grids differ"));
        }
        let nz: usize = slices.iter().map(|s| s.shape[2]).sum();
        let mut out = MockVolume::zeros([nx, ny, nz], first.voxel_size);
        let mut z0 = 0;
        for slice in &slices {
            for x in 0..nx {
                for y in 0..ny {
                    for z in 0..slice.shape[2] {
                        out.set(x, y, z0 + z, slice.get(x, y, z));
                    }
                }
            }
            z0 += slice.shape[2];
        }
        out.write(Path::new(Self::required(call, "-prefix")?))?;
        Ok(String::new())
    }

    fn nwarp_apply(&self, call: &ToolCall) -> CestResult<String> {
        let spec = Self::required(call, "-nwarp")?;
        let mut total = [0.0f64; 3];
        for token in spec.split_whitespace() {
            let (path, inverted) = spec_token(token);
            let mut affine = Affine12::parse(&std::fs::read_to_string(path)?)?;
            if inverted {
                affine = affine.inverse()?;
            }
            let t = affine.translation_part();
            for a in 0..3 {
                total[a] += t[a];
            }
        }
        let source = MockVolume::read(Path::new(Self::required(call, "-source")?))?;
        let master = MockVolume::read(Path::new(Self::required(call, "-master")?))?;
        let mut out = source.pull(round_shift(total), master.shape, master.voxel_size);
        out.orientation = master.orientation;
        out.write(Path::new(Self::required(call, "-prefix")?))?;
        Ok(String::new())
    }
}

impl ToolRunner for MockToolbox {
    fn run(&self, call: &ToolCall, _timeout: Option<Duration>) -> CestResult<RunOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.clone());
        }
        if self.unavailable.contains(&call.program) {
            return Err(CestError::ToolUnavailable(format!(
                "can not locate {}",
                call.program
            )));
        }
        if self.failing.contains(&call.program) {
            return Ok(RunOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: format!("** FATAL ERROR: {} failed", call.program),
            });
        }
        if self.silent.contains(&call.program) {
            return Ok(RunOutput {
                success: true,
                code: Some(0),
                ..RunOutput::default()
            });
        }

        match self.simulate(call) {
            Ok(stdout) => Ok(RunOutput {
                success: true,
                code: Some(0),
                stdout,
                stderr: String::new(),
            }),
            Err(CestError::ToolUnavailable(message)) => Err(CestError::ToolUnavailable(message)),
            Err(e) => Ok(RunOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: e.to_string(),
            }),
        }
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        if self.unavailable.contains(program) {
            None
        } else {
            Some(PathBuf::from("/mock/bin").join(program))
        }
    }
}

impl ImageReader for MockToolbox {
    fn geometry(&self, path: &Path) -> CestResult<VolumeGeometry> {
        let volume = MockVolume::read(path)?;
        Ok(VolumeGeometry {
            shape: volume.shape.to_vec(),
            voxel_size: volume.voxel_size,
        })
    }

    fn orientation(&self, path: &Path) -> CestResult<Orientation> {
        Ok(MockVolume::read(path)?.orientation_or_default())
    }

    fn intensities(&self, path: &Path) -> CestResult<ArrayD<f32>> {
        let volume = MockVolume::read(path)?;
        ArrayD::from_shape_vec(IxDyn(&volume.shape), volume.data)
            .map_err(|e| CestError::ImageRead(format!("{}: {}", path.display(), e)))
    }
}
